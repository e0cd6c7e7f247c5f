//! Per-thread sampling state: PRNG, decrementing sample counter, and the
//! recursion guard, packed into a single 64-bit TLS word so the hot path
//! touches one cache line.

use crate::platform;
use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

/// Initial xorshift32 state. Chosen so the first output is 0xfffffea4,
/// which makes the first sample interval of an uninitialised pool
/// essentially infinite: dynamic initialisation of the host runtime may
/// call into the allocator long before `init()` runs.
const RANDOM_STATE_INIT: u32 = 0xff82_eb50;

const COUNTER_SHIFT: u32 = 32;
const COUNTER_MASK: u64 = 0x7fff_ffff;
const GUARD_BIT: u64 = 1 << 63;

thread_local! {
    /// Packed {random_state: u32, next_sample_counter: u31, recursive_guard: u1}.
    static THREAD_LOCALS: Cell<u64> = const { Cell::new(RANDOM_STATE_INIT as u64) };
}

/// `max(1, 2 * sample_rate) + 1`. The doubling yields an expected interval
/// of `sample_rate` from the uniform refill below. Starts at u32::MAX so
/// the refill modulo is well-defined (and sampling is effectively off)
/// before `init()` configures it.
static ADJUSTED_SAMPLE_RATE_PLUS_ONE: AtomicU32 = AtomicU32::new(u32::MAX);

#[derive(Clone, Copy)]
struct ThreadLocals {
    random_state: u32,
    next_sample_counter: u32,
    recursive_guard: bool,
}

#[inline(always)]
fn unpack(word: u64) -> ThreadLocals {
    ThreadLocals {
        random_state: word as u32,
        next_sample_counter: ((word >> COUNTER_SHIFT) & COUNTER_MASK) as u32,
        recursive_guard: word & GUARD_BIT != 0,
    }
}

#[inline(always)]
fn pack(tls: ThreadLocals) -> u64 {
    let mut word = tls.random_state as u64;
    word |= ((tls.next_sample_counter as u64) & COUNTER_MASK) << COUNTER_SHIFT;
    if tls.recursive_guard {
        word |= GUARD_BIT;
    }
    word
}

/// xorshift (32-bit output), arithmetic only. The new state is the output.
#[inline(always)]
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

/// Seed a thread's PRNG from address entropy and the thread id. Only used
/// once the pool is live; until then every thread keeps the magic initial
/// state and its giant first interval.
#[cold]
fn fresh_seed() -> u32 {
    let stack_slot = 0u8;
    let addr = &stack_slot as *const u8 as u64;
    let mixed = addr
        .wrapping_mul(0x517c_c1b7_2722_0a95)
        .wrapping_add(platform::thread_id());
    let folded = (mixed ^ (mixed >> 32)) as u32;
    if folded == 0 {
        RANDOM_STATE_INIT
    } else {
        folded
    }
}

/// Configure the sample rate. Rate 0 disables sampling.
pub fn set_sample_rate(sample_rate: u32) {
    let adjusted = if sample_rate == 0 {
        u32::MAX
    } else {
        let doubled = (sample_rate as u64 * 2).max(1);
        (doubled.min(u32::MAX as u64 - 1) + 1) as u32
    };
    ADJUSTED_SAMPLE_RATE_PLUS_ONE.store(adjusted, Ordering::Relaxed);
}

/// Decide whether the current allocation should be serviced by the pool.
/// Returns true with probability ~1/sample_rate. Free to call before
/// `init()`: the default state never samples in any realistic run.
#[inline]
pub fn should_sample() -> bool {
    let sampled = THREAD_LOCALS.try_with(|cell| {
        let mut tls = unpack(cell.get());
        if tls.next_sample_counter == 0 {
            let adjusted = ADJUSTED_SAMPLE_RATE_PLUS_ONE.load(Ordering::Relaxed);
            if tls.random_state == RANDOM_STATE_INIT && adjusted != u32::MAX {
                tls.random_state = fresh_seed();
            }
            let r = xorshift32(&mut tls.random_state);
            // The packed counter is 31 bits; an interval beyond that is
            // indistinguishable from "never" anyway.
            tls.next_sample_counter = ((r % (adjusted - 1)) + 1).min(COUNTER_MASK as u32);
        }
        // Counter of 1 means "sample this allocation".
        tls.next_sample_counter -= 1;
        let hit = tls.next_sample_counter == 0;
        cell.set(pack(tls));
        hit
    });
    // TLS unavailable (thread teardown): never sample.
    sampled.unwrap_or(false)
}

/// Advance the calling thread's PRNG and return 32 random bits. Used for
/// free-list shuffling and the per-allocation left/right coin flip.
#[inline]
pub fn random_u32() -> u32 {
    THREAD_LOCALS
        .try_with(|cell| {
            let mut tls = unpack(cell.get());
            if tls.random_state == RANDOM_STATE_INIT {
                tls.random_state = fresh_seed();
            }
            let r = xorshift32(&mut tls.random_state);
            cell.set(pack(tls));
            r
        })
        .unwrap_or(0x9e37_79b9)
}

/// Scope-bound recursion guard. The pool's allocate/deallocate paths hold
/// one so that a backtrace callback which itself allocates falls through
/// to the host allocator instead of looping back into the pool.
pub struct ScopedRecursiveGuard {
    prev: bool,
}

impl ScopedRecursiveGuard {
    /// Enter the guard; returns None if this thread is already inside the
    /// pool (or TLS is unavailable), in which case the caller must defer
    /// to the host allocator.
    #[inline]
    pub fn try_enter() -> Option<Self> {
        THREAD_LOCALS
            .try_with(|cell| {
                let word = cell.get();
                if word & GUARD_BIT != 0 {
                    None
                } else {
                    cell.set(word | GUARD_BIT);
                    Some(ScopedRecursiveGuard { prev: false })
                }
            })
            .ok()
            .flatten()
    }

    /// Enter unconditionally, restoring the previous guard value on drop.
    #[inline]
    pub fn enter() -> Self {
        let prev = THREAD_LOCALS
            .try_with(|cell| {
                let word = cell.get();
                cell.set(word | GUARD_BIT);
                word & GUARD_BIT != 0
            })
            .unwrap_or(true);
        ScopedRecursiveGuard { prev }
    }
}

impl Drop for ScopedRecursiveGuard {
    #[inline]
    fn drop(&mut self) {
        if !self.prev {
            let _ = THREAD_LOCALS.try_with(|cell| {
                cell.set(cell.get() & !GUARD_BIT);
            });
        }
    }
}
