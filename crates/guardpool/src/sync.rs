//! The lock guarding the free-slot list and metadata writes.
//!
//! std::sync::Mutex is off the table twice over: it may allocate, and the
//! fork hooks need a bare `lock` in the prepare callback paired with a
//! bare `unlock` in the parent/child callbacks, which no RAII guard can
//! span. The signal handler never touches this lock at all; it reads
//! metadata through seqlock snapshots instead.

use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const HELD: u32 = 1;
const HELD_CONTENDED: u32 = 2;

/// Spins before parking on the futex. The critical sections here are a
/// slot-index swap or a metadata publish, a few dozen instructions, so a
/// waiter that spins briefly usually never reaches the kernel.
const SPIN_LIMIT: u32 = 64;

pub struct PoolMutex {
    state: AtomicU32,
}

impl PoolMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire without blocking. Returns false if the lock is held.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                return;
            }
            core::hint::spin_loop();
            spins += 1;
        }
        // Announce contention so the eventual unlock knows to wake us,
        // then park until the holder lets go. Taking the lock with a
        // swap to HELD_CONTENDED over-reports contention for one wake
        // cycle, which is harmless; missing a waiter would not be.
        while self.state.swap(HELD_CONTENDED, Ordering::Acquire) != UNLOCKED {
            park(&self.state, HELD_CONTENDED);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == HELD_CONTENDED {
            unpark_one(&self.state);
        }
    }

    /// Acquire for the duration of the returned guard.
    #[inline]
    pub fn guard(&self) -> PoolMutexGuard<'_> {
        self.lock();
        PoolMutexGuard { mutex: self }
    }
}

pub struct PoolMutexGuard<'a> {
    mutex: &'a PoolMutex,
}

impl Drop for PoolMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Sleep until the lock word changes away from `expected`.
#[cfg(target_os = "linux")]
fn park(state: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected as libc::c_int,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn park(_state: &AtomicU32, _expected: u32) {
    // No futex: hand the core back and retry.
    std::thread::yield_now();
}

#[cfg(target_os = "linux")]
fn unpark_one(state: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1 as libc::c_int,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn unpark_one(_state: &AtomicU32) {}
