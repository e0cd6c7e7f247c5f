//! The guarded pool: a region of `2N + 1` pages where every odd page is an
//! allocation slot and every even page is an inaccessible guard. A sampled
//! allocation gets a whole slot; anything that walks off it, touches it
//! after free, or frees it wrongly becomes a SIGSEGV that the crash
//! handler can attribute.
//!
//! Expected to be a singleton for the lifetime of the process. Once
//! initialised, the backing mappings are deliberately leaked at exit:
//! unmapping them would hand late allocations from global destructors a
//! use-after-free on the pool itself.

use crate::metadata::{CallSiteInfo, SlotRecord};
use crate::options::{BacktraceFn, Options};
use crate::platform;
use crate::report;
use crate::sampler::{self, ScopedRecursiveGuard};
use crate::state::{AllocatorState, Error};
use crate::sync::PoolMutex;
use crate::util::{align_down, align_up, INVALID_SLOT, MAX_NATURAL_ALIGN};
use core::cell::UnsafeCell;
use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

pub(crate) const POOL_NAME: &CStr = c"guardpool guard pages";
pub(crate) const ALIVE_SLOT_NAME: &CStr = c"guardpool alive slot";
pub(crate) const METADATA_NAME: &CStr = c"guardpool metadata";
pub(crate) const FREE_SLOTS_NAME: &CStr = c"guardpool free slots";

/// Callback for `iterate`: receives the user pointer, the requested size
/// and the opaque argument. Must not allocate.
pub type IterateCallback = unsafe extern "C" fn(user_ptr: usize, size: usize, arg: *mut c_void);

/// Mutable pool bookkeeping, everything behind `mutex`.
struct PoolInner {
    /// Array of up to N reusable slot indices, in randomised order.
    free_slots: *mut usize,
    free_slots_length: usize,
    /// Total slot reservations so far. Freed slots are withheld from the
    /// free list until this reaches N, so every slot is used once before
    /// any address is recycled.
    num_sampled_allocations: usize,
}

pub struct GuardedPoolAllocator {
    state: AllocatorState,
    mutex: PoolMutex,
    inner: UnsafeCell<PoolInner>,
    records: *mut SlotRecord,
    backtrace: Option<BacktraceFn>,
    perfectly_right_align: bool,
    recoverable: bool,
    stopped: AtomicBool,
    installed_handlers: bool,
}

unsafe impl Send for GuardedPoolAllocator {}
unsafe impl Sync for GuardedPoolAllocator {}

/// The pool the signal handler and fork hooks consult. First `init` wins.
static SINGLETON: AtomicPtr<GuardedPoolAllocator> = AtomicPtr::new(ptr::null_mut());
static ATFORK_INSTALLED: AtomicBool = AtomicBool::new(false);
static ATFORK_HOLDING: AtomicBool = AtomicBool::new(false);

pub(crate) fn singleton() -> Option<&'static GuardedPoolAllocator> {
    let ptr = SINGLETON.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// A child forked while a sampled allocation is mid-flight would inherit a
/// locked pool mutex; taking it around fork() keeps both sides consistent.
unsafe extern "C" fn atfork_prepare() {
    if let Some(pool) = singleton() {
        pool.mutex.lock();
        ATFORK_HOLDING.store(true, Ordering::Release);
    }
}

unsafe extern "C" fn atfork_release() {
    if ATFORK_HOLDING.swap(false, Ordering::AcqRel) {
        if let Some(pool) = singleton() {
            pool.mutex.unlock();
        }
    }
}

unsafe fn install_at_fork() {
    if ATFORK_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    libc::pthread_atfork(
        Some(atfork_prepare),
        Some(atfork_release),
        Some(atfork_release),
    );
}

impl GuardedPoolAllocator {
    /// The constant default value: owns no memory, samples nothing.
    /// `init()` transitions it to active.
    pub const fn new() -> Self {
        GuardedPoolAllocator {
            state: AllocatorState::new(),
            mutex: PoolMutex::new(),
            inner: UnsafeCell::new(PoolInner {
                free_slots: ptr::null_mut(),
                free_slots_length: 0,
                num_sampled_allocations: 0,
            }),
            records: ptr::null_mut(),
            backtrace: None,
            perfectly_right_align: false,
            recoverable: false,
            stopped: AtomicBool::new(false),
            installed_handlers: false,
        }
    }

    /// Create the guarded region, metadata and free list, seed the free
    /// list with a random slot permutation, configure sampling, and hook
    /// fork and (optionally) SIGSEGV.
    ///
    /// # Safety
    /// Must be called once per instance, before any other operation, from
    /// a single-threaded context.
    pub unsafe fn init(&mut self, opts: &Options) {
        debug_assert!(self.records.is_null(), "init called twice");

        let page_size = platform::page_size();
        let num_slots = opts.max_simultaneous_allocations.max(1) as usize;

        let pool_bytes = AllocatorState::pool_region_size(num_slots, page_size);
        let pool = platform::map_inaccessible(pool_bytes, POOL_NAME);
        self.state.init(pool as usize, num_slots, page_size);

        // Freshly mapped zero pages are valid empty records, so no
        // initialisation pass over the array is needed.
        let record_bytes = align_up(num_slots * core::mem::size_of::<SlotRecord>(), page_size);
        let records = platform::map_inaccessible(record_bytes, METADATA_NAME);
        platform::mark_read_write(records, record_bytes, METADATA_NAME);
        self.records = records as *mut SlotRecord;

        let free_bytes = align_up(num_slots * core::mem::size_of::<usize>(), page_size);
        let free = platform::map_inaccessible(free_bytes, FREE_SLOTS_NAME) as *mut usize;
        platform::mark_read_write(free as *mut u8, free_bytes, FREE_SLOTS_NAME);
        for i in 0..num_slots {
            *free.add(i) = i;
        }
        // Fisher-Yates so the allocation order does not mirror slot order.
        for i in (1..num_slots).rev() {
            let j = sampler::random_u32() as usize % (i + 1);
            ptr::swap(free.add(i), free.add(j));
        }
        {
            let inner = &mut *self.inner.get();
            inner.free_slots = free;
            inner.free_slots_length = num_slots;
            inner.num_sampled_allocations = 0;
        }

        self.backtrace = opts.backtrace;
        self.perfectly_right_align = opts.perfectly_right_align;
        self.recoverable = opts.recoverable;
        self.stopped.store(false, Ordering::Relaxed);

        sampler::set_sample_rate(opts.sample_rate);

        let _ = SINGLETON.compare_exchange(
            ptr::null_mut(),
            self as *mut _,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        install_at_fork();

        if opts.install_signal_handlers {
            report::install_signal_handlers();
            self.installed_handlers = true;
        }
    }

    /// Tear the pool down and release its mappings. Tests only: a
    /// production pool leaks on purpose (see the module docs).
    ///
    /// # Safety
    /// No other thread may touch the pool during or after this call.
    pub unsafe fn uninit_test_only(&mut self) {
        if self.installed_handlers {
            report::uninstall_signal_handlers();
            self.installed_handlers = false;
        }
        let _ = SINGLETON.compare_exchange(
            self as *mut _,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );

        let page_size = self.state.page_size();
        let num_slots = self.state.max_simultaneous_allocations();
        if self.state.pool_base() != 0 {
            let pool_bytes = AllocatorState::pool_region_size(num_slots, page_size);
            platform::unmap(self.state.pool_base() as *mut u8, pool_bytes, POOL_NAME);
        }
        if !self.records.is_null() {
            let record_bytes = align_up(num_slots * core::mem::size_of::<SlotRecord>(), page_size);
            platform::unmap(self.records as *mut u8, record_bytes, METADATA_NAME);
            self.records = ptr::null_mut();
        }
        {
            let inner = &mut *self.inner.get();
            if !inner.free_slots.is_null() {
                let free_bytes = align_up(num_slots * core::mem::size_of::<usize>(), page_size);
                platform::unmap(inner.free_slots as *mut u8, free_bytes, FREE_SLOTS_NAME);
                inner.free_slots = ptr::null_mut();
            }
            inner.free_slots_length = 0;
            inner.num_sampled_allocations = 0;
        }
        self.state.reset();
        self.stopped.store(false, Ordering::Relaxed);
        sampler::set_sample_rate(0);
    }

    /// Whether the current allocation should be serviced by the pool.
    #[inline]
    pub fn should_sample(&self) -> bool {
        sampler::should_sample()
    }

    /// Whether `ptr` is a live or historical pool pointer. False before
    /// init.
    #[inline]
    pub fn pointer_is_mine(&self, ptr: *const u8) -> bool {
        self.state.pointer_is_mine(ptr as usize)
    }

    pub fn state(&self) -> &AllocatorState {
        &self.state
    }

    /// Base of the metadata array, for out-of-process crash printers.
    pub fn metadata(&self) -> *const SlotRecord {
        self.records
    }

    pub(crate) fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !self.records.is_null()
    }

    pub(crate) fn record_at(&self, slot: usize) -> &SlotRecord {
        debug_assert!(slot < self.state.max_simultaneous_allocations());
        unsafe { &*self.records.add(slot) }
    }

    /// Allocate `size` bytes in a guarded slot. Returns null when the pool
    /// is empty or stopped, the size does not fit a page, or the caller is
    /// already inside the pool (recursion via the backtrace callback); the
    /// host falls back to its own allocator in every such case.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 || size > self.state.max_allocation_size() {
            return ptr::null_mut();
        }
        let _guard = match ScopedRecursiveGuard::try_enter() {
            Some(guard) => guard,
            None => return ptr::null_mut(),
        };

        let slot = self.reserve_slot();
        if slot == INVALID_SLOT {
            return ptr::null_mut();
        }

        let page_size = self.state.page_size();
        let slot_page = self.state.slot_to_addr(slot);
        // Re-randomised on every allocation: left alignment walks
        // overflows into the right guard, right alignment walks
        // underflows into the left one.
        let left_aligned = sampler::random_u32() & 1 == 0;
        let user_ptr = if left_aligned {
            slot_page
        } else {
            self.right_aligned_addr(slot_page + page_size, size)
        };

        // Captured before the mutex: the callback may allocate.
        let call_site = CallSiteInfo::capture(self.backtrace);
        {
            let _lock = self.mutex.guard();
            self.record_at(slot)
                .record_allocation(user_ptr, size, left_aligned, call_site);
        }
        platform::mark_read_write(slot_page as *mut u8, page_size, ALIVE_SLOT_NAME);

        user_ptr as *mut u8
    }

    /// Return a pool pointer. Traps (and reports through the crash
    /// handler) on invalid and double frees.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let _guard = ScopedRecursiveGuard::enter();

        let addr = ptr as usize;
        if !self.state.pointer_is_mine(addr) {
            self.trap_on_address(addr, Error::InvalidFree);
            return;
        }

        let slot = self.state.nearest_slot(addr);
        let record = self.record_at(slot);
        let call_site = CallSiteInfo::capture(self.backtrace);

        let fault = {
            let _lock = self.mutex.guard();
            if record.user_ptr() != addr {
                Some(Error::InvalidFree)
            } else if !record.is_allocated() {
                Some(Error::DoubleFree)
            } else {
                record.record_deallocation(call_site);
                None
            }
        };
        if let Some(kind) = fault {
            self.trap_on_address(addr, kind);
            return;
        }

        let page_size = self.state.page_size();
        platform::mark_inaccessible(self.state.slot_to_addr(slot) as *mut u8, page_size, POOL_NAME);
        self.free_slot(slot);
    }

    /// Requested size of the allocation at `ptr`, which must be a live
    /// pool pointer.
    pub unsafe fn get_size(&self, ptr: *const u8) -> usize {
        let addr = ptr as usize;
        debug_assert!(self.state.pointer_is_mine(addr));
        if !self.state.pointer_is_mine(addr) {
            return 0;
        }
        let _lock = self.mutex.guard();
        self.record_at(self.state.nearest_slot(addr)).requested_size()
    }

    /// Invoke `cb` for every live allocation whose user pointer lies in
    /// `[base, base + size)`. The pool must be `disable()`d for the
    /// duration and the callback must not allocate.
    pub unsafe fn iterate(&self, base: usize, size: usize, cb: IterateCallback, arg: *mut c_void) {
        for slot in 0..self.state.max_simultaneous_allocations() {
            let record = self.record_at(slot);
            if !record.is_allocated() {
                continue;
            }
            let user_ptr = record.user_ptr();
            if user_ptr >= base && user_ptr < base.saturating_add(size) {
                cb(user_ptr, record.requested_size(), arg);
            }
        }
    }

    /// Prevent all threads from allocating until `enable()` is called.
    pub fn disable(&self) {
        self.mutex.lock();
    }

    pub fn enable(&self) {
        self.mutex.unlock();
    }

    /// Permanently stop servicing allocations. Idempotent; called from
    /// the crash handler so no sampled allocation races the crash dump.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn reserve_slot(&self) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return INVALID_SLOT;
        }
        let _lock = self.mutex.guard();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.free_slots_length == 0 {
            return INVALID_SLOT;
        }
        inner.free_slots_length -= 1;
        let slot = unsafe { *inner.free_slots.add(inner.free_slots_length) };
        inner.num_sampled_allocations += 1;
        slot
    }

    fn free_slot(&self, slot: usize) {
        let _lock = self.mutex.guard();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.num_sampled_allocations >= self.state.max_simultaneous_allocations() {
            unsafe { *inner.free_slots.add(inner.free_slots_length) = slot };
            inner.free_slots_length += 1;
        }
    }

    /// Right-aligned placement: the last byte of the allocation coincides
    /// with the last byte of the slot, modulo natural alignment. With
    /// `perfectly_right_align` there is no rounding at all.
    fn right_aligned_addr(&self, slot_end: usize, size: usize) -> usize {
        let align = if self.perfectly_right_align {
            1
        } else {
            size.next_power_of_two().min(MAX_NATURAL_ALIGN)
        };
        align_down(slot_end - size, align)
    }

    /// Publish an internally detected error and raise SIGSEGV so the
    /// crash handler produces the one unified report. If another thread's
    /// trap is already in flight, this one is dropped silently.
    fn trap_on_address(&self, addr: usize, kind: Error) {
        if !self.state.try_set_failure(kind, addr) {
            return;
        }
        unsafe {
            libc::raise(libc::SIGSEGV);
        }
    }
}
