//! Pool behavior tests: ownership, sizing, slot reservation and the
//! deferred-recycle policy. Signal handlers stay off here; every
//! operation in this file is a valid one, so nothing ever traps.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use guardpool::{GuardedPoolAllocator, Options};

fn test_options(num_slots: u32) -> Options {
    Options {
        sample_rate: 1,
        max_simultaneous_allocations: num_slots,
        perfectly_right_align: false,
        backtrace: None,
        install_signal_handlers: false,
        recoverable: false,
    }
}

/// Helper: a freshly initialised pool. Boxed so each test owns an
/// independent instance regardless of test-thread interleaving.
unsafe fn new_pool(opts: &Options) -> Box<GuardedPoolAllocator> {
    let mut pool = Box::new(GuardedPoolAllocator::new());
    pool.init(opts);
    pool
}

unsafe fn destroy(mut pool: Box<GuardedPoolAllocator>) {
    pool.uninit_test_only();
}

// ---------------------------------------------------------------------------
// Ownership: every successful allocation is "mine", everything else is not
// ---------------------------------------------------------------------------

#[test]
fn allocations_are_owned_and_outsiders_are_not() {
    unsafe {
        let pool = new_pool(&test_options(4));

        let p = pool.allocate(32);
        assert!(!p.is_null());
        assert!(pool.pointer_is_mine(p));

        let stack_var = 0u64;
        assert!(!pool.pointer_is_mine(&stack_var as *const u64 as *const u8));
        assert!(!pool.pointer_is_mine(std::ptr::null()));

        pool.deallocate(p);
        destroy(pool);
    }
}

#[test]
fn default_pool_owns_nothing() {
    let pool = GuardedPoolAllocator::new();
    assert!(!pool.pointer_is_mine(0x1000 as *const u8));
}

// ---------------------------------------------------------------------------
// Size round-trip
// ---------------------------------------------------------------------------

#[test]
fn get_size_round_trips() {
    unsafe {
        let pool = new_pool(&test_options(4));
        let page_size = pool.state().page_size();

        for &size in &[1usize, 2, 8, 16, 100, 255, page_size - 1, page_size] {
            let p = pool.allocate(size);
            assert!(!p.is_null(), "allocate({}) failed", size);
            assert_eq!(pool.get_size(p), size, "size mismatch for {}", size);
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

#[test]
fn out_of_range_sizes_are_refused() {
    unsafe {
        let pool = new_pool(&test_options(4));
        let page_size = pool.state().page_size();

        assert!(pool.allocate(0).is_null());
        assert!(pool.allocate(page_size + 1).is_null());
        assert!(pool.allocate(usize::MAX).is_null());
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// Uniqueness and exhaustion
// ---------------------------------------------------------------------------

#[test]
fn simultaneous_allocations_are_distinct_until_exhaustion() {
    const SLOTS: usize = 16;
    unsafe {
        let pool = new_pool(&test_options(SLOTS as u32));

        let mut ptrs = Vec::new();
        let mut seen = HashSet::new();
        for i in 0..SLOTS {
            let p = pool.allocate(1);
            assert!(!p.is_null(), "allocation {} failed", i);
            assert!(seen.insert(p as usize), "duplicate pointer {:p}", p);
            ptrs.push(p);
        }

        // Pool is full: the host must fall back.
        assert!(pool.allocate(1).is_null());

        for p in ptrs {
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// Deferred recycling: all slots are used once before any address repeats
// ---------------------------------------------------------------------------

#[test]
fn every_slot_is_used_before_any_is_recycled() {
    const SLOTS: usize = 8;
    unsafe {
        let pool = new_pool(&test_options(SLOTS as u32));
        let page_size = pool.state().page_size();

        let mut slot_pages = HashSet::new();
        for _ in 0..SLOTS {
            let p = pool.allocate(1);
            assert!(!p.is_null());
            // Left- or right-aligned, the pointer stays on its slot page.
            let slot_page = p as usize & !(page_size - 1);
            assert!(
                slot_pages.insert(slot_page),
                "slot page {:#x} reused before every slot was used",
                slot_page
            );
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

#[test]
fn recycling_keeps_the_pool_alive_after_the_threshold() {
    const SLOTS: usize = 8;
    unsafe {
        let pool = new_pool(&test_options(SLOTS as u32));

        // Drain the fresh-slot phase.
        for _ in 0..SLOTS {
            let p = pool.allocate(1);
            assert!(!p.is_null());
            pool.deallocate(p);
        }
        // From here on the pool recycles; it must never run dry on a
        // serial allocate/free pattern.
        for i in 0..64 {
            let p = pool.allocate(16);
            assert!(!p.is_null(), "recycled allocation {} failed", i);
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// Alignment policy
// ---------------------------------------------------------------------------

#[test]
fn both_alignments_occur_and_respect_natural_alignment() {
    const SLOTS: usize = 64;
    unsafe {
        let pool = new_pool(&test_options(SLOTS as u32));
        let page_size = pool.state().page_size();

        let size = 24usize;
        let mut left = 0;
        let mut right = 0;
        let mut ptrs = Vec::new();
        for _ in 0..SLOTS {
            let p = pool.allocate(size);
            assert!(!p.is_null());
            let offset = p as usize & (page_size - 1);
            if offset == 0 {
                left += 1;
            } else {
                right += 1;
                let slot_end = (p as usize & !(page_size - 1)) + page_size;
                assert!(p as usize % 16 == 0, "right-aligned pointer unaligned");
                assert!(p as usize + size <= slot_end);
                assert!(slot_end - (p as usize + size) < 16);
            }
            ptrs.push(p);
        }
        assert!(left > 0, "no left-aligned allocation in {} tries", SLOTS);
        assert!(right > 0, "no right-aligned allocation in {} tries", SLOTS);

        for p in ptrs {
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

#[test]
fn perfect_right_alignment_touches_the_last_byte() {
    const SLOTS: usize = 32;
    unsafe {
        let mut opts = test_options(SLOTS as u32);
        opts.perfectly_right_align = true;
        let pool = new_pool(&opts);
        let page_size = pool.state().page_size();

        let size = 5usize;
        let mut saw_right = false;
        let mut ptrs = Vec::new();
        for _ in 0..SLOTS {
            let p = pool.allocate(size);
            assert!(!p.is_null());
            let offset = p as usize & (page_size - 1);
            if offset != 0 {
                saw_right = true;
                assert_eq!(offset + size, page_size, "not flush against the guard");
            }
            ptrs.push(p);
        }
        assert!(saw_right);

        for p in ptrs {
            pool.deallocate(p);
        }
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// iterate
// ---------------------------------------------------------------------------

struct IterateCollector {
    count: usize,
    total_bytes: usize,
}

/// Must not allocate: the pool is disabled while it runs.
unsafe extern "C" fn collect_allocation(_user_ptr: usize, size: usize, arg: *mut c_void) {
    let collector = &mut *(arg as *mut IterateCollector);
    collector.count += 1;
    collector.total_bytes += size;
}

#[test]
fn iterate_visits_exactly_the_live_allocations() {
    unsafe {
        let pool = new_pool(&test_options(8));

        let a = pool.allocate(10);
        let b = pool.allocate(20);
        let c = pool.allocate(30);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        pool.deallocate(b);

        let mut collector = IterateCollector {
            count: 0,
            total_bytes: 0,
        };
        pool.disable();
        pool.iterate(
            pool.state().pool_base(),
            pool.state().pool_end() - pool.state().pool_base(),
            collect_allocation,
            &mut collector as *mut IterateCollector as *mut c_void,
        );
        pool.enable();

        assert_eq!(collector.count, 2);
        assert_eq!(collector.total_bytes, 40);

        pool.deallocate(a);
        pool.deallocate(c);
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// stop
// ---------------------------------------------------------------------------

#[test]
fn stop_is_terminal_for_allocations_but_not_frees() {
    unsafe {
        let pool = new_pool(&test_options(4));

        let p = pool.allocate(8);
        assert!(!p.is_null());

        pool.stop();
        pool.stop(); // idempotent
        assert!(pool.allocate(8).is_null());

        // In-flight allocations can still be returned.
        pool.deallocate(p);
        assert!(pool.allocate(8).is_null());
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// Recursion guard: a backtrace callback that allocates must not loop
// ---------------------------------------------------------------------------

static RECURSION_POOL: AtomicPtr<GuardedPoolAllocator> = AtomicPtr::new(std::ptr::null_mut());
static INNER_ALLOCATION_WAS_NULL: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn allocating_backtrace(frames: *mut usize, max: usize) -> usize {
    let pool = RECURSION_POOL.load(Ordering::Acquire);
    if !pool.is_null() {
        let inner = (*pool).allocate(1);
        INNER_ALLOCATION_WAS_NULL.store(inner.is_null(), Ordering::Release);
    }
    if max > 0 {
        *frames = 0x1000;
        1
    } else {
        0
    }
}

#[test]
fn backtrace_reentry_falls_back_instead_of_looping() {
    unsafe {
        let mut opts = test_options(4);
        opts.backtrace = Some(allocating_backtrace);
        let mut pool = new_pool(&opts);
        RECURSION_POOL.store(&mut *pool as *mut _, Ordering::Release);

        let p = pool.allocate(1);
        assert!(!p.is_null(), "outer allocation must succeed");
        assert!(
            INNER_ALLOCATION_WAS_NULL.load(Ordering::Acquire),
            "nested allocation from the backtrace callback must return null"
        );

        RECURSION_POOL.store(std::ptr::null_mut(), Ordering::Release);
        pool.deallocate(p);
        destroy(pool);
    }
}

// ---------------------------------------------------------------------------
// deallocate(null) is a no-op
// ---------------------------------------------------------------------------

#[test]
fn deallocate_null_is_a_noop() {
    unsafe {
        let pool = new_pool(&test_options(4));
        pool.deallocate(std::ptr::null_mut());
        destroy(pool);
    }
}
