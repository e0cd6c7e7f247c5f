//! Out-of-band per-slot records: who allocated, who freed, and the latch
//! that limits each slot to a single error report.
//!
//! Records live in their own anonymous mapping, away from user data.
//! Writes happen under the pool mutex; the crash handler reads without any
//! lock (taking a mutex in a signal handler is unsafe), so every record is
//! fronted by a seqlock version counter and the handler validates its
//! snapshot instead of trusting a possibly torn read.

use crate::options::BacktraceFn;
use crate::platform;
use crate::trace;
use crate::util::{MAX_TRACE_FRAMES, TRACE_STORAGE_BYTES};
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

/// How many times the handler re-reads an unstable record before giving
/// up and disowning the fault. Writer critical sections are a few stores,
/// so any honest writer finishes well within this.
const SNAPSHOT_RETRIES: usize = 1 << 16;

/// One call site: the capturing thread plus its compressed stack trace.
#[derive(Clone, Copy)]
pub struct CallSiteInfo {
    pub thread_id: u64,
    /// Length in bytes of the compressed trace. Zero when no backtrace
    /// callback is configured.
    pub trace_bytes: u32,
    pub compressed_trace: [u8; TRACE_STORAGE_BYTES],
}

impl CallSiteInfo {
    pub const fn empty() -> Self {
        CallSiteInfo {
            thread_id: 0,
            trace_bytes: 0,
            compressed_trace: [0; TRACE_STORAGE_BYTES],
        }
    }

    /// Capture the current stack through the host-provided callback and
    /// compress it inline. Called while holding no locks: the callback may
    /// itself allocate (the recursion guard keeps that from looping back).
    pub fn capture(backtrace: Option<BacktraceFn>) -> Self {
        let mut info = CallSiteInfo::empty();
        info.thread_id = platform::thread_id();
        if let Some(bt) = backtrace {
            let mut frames = [0usize; MAX_TRACE_FRAMES];
            let count = unsafe { bt(frames.as_mut_ptr(), MAX_TRACE_FRAMES) };
            let count = count.min(MAX_TRACE_FRAMES);
            info.trace_bytes = trace::pack(&frames[..count], &mut info.compressed_trace) as u32;
        }
        info
    }

    /// Decompress into `out`, returning the frame count.
    pub fn decode(&self, out: &mut [usize]) -> usize {
        trace::unpack(&self.compressed_trace[..self.trace_bytes as usize], out)
    }
}

struct RecordInner {
    user_ptr: usize,
    requested_size: usize,
    allocated: bool,
    left_aligned: bool,
    has_deallocation: bool,
    allocation: CallSiteInfo,
    deallocation: CallSiteInfo,
}

/// A coherent copy of one record, taken lock-free.
#[derive(Clone, Copy)]
pub struct SlotSnapshot {
    pub user_ptr: usize,
    pub requested_size: usize,
    pub allocated: bool,
    pub left_aligned: bool,
    pub has_deallocation: bool,
    pub allocation: CallSiteInfo,
    pub deallocation: CallSiteInfo,
}

/// Per-slot record. All-zero bytes are a valid empty record, which is what
/// makes it legal to use the freshly mapped (zero-filled) metadata region
/// without an initialisation pass.
#[repr(C)]
pub struct SlotRecord {
    /// Seqlock: odd while a writer is inside.
    version: AtomicU32,
    /// Once a fault has been attributed to this slot, further faults on it
    /// are suppressed. Claimed by CAS from the signal handler.
    error_reported: AtomicBool,
    inner: UnsafeCell<RecordInner>,
}

unsafe impl Send for SlotRecord {}
unsafe impl Sync for SlotRecord {}

impl SlotRecord {
    /// Publish a fresh allocation.
    ///
    /// # Safety
    /// Caller must hold the pool mutex.
    pub unsafe fn record_allocation(
        &self,
        user_ptr: usize,
        requested_size: usize,
        left_aligned: bool,
        call_site: CallSiteInfo,
    ) {
        self.begin_write();
        let inner = &mut *self.inner.get();
        inner.user_ptr = user_ptr;
        inner.requested_size = requested_size;
        inner.allocated = true;
        inner.left_aligned = left_aligned;
        inner.has_deallocation = false;
        inner.allocation = call_site;
        inner.deallocation = CallSiteInfo::empty();
        self.end_write();
    }

    /// Mark the slot deallocated and record the freeing call site.
    ///
    /// # Safety
    /// Caller must hold the pool mutex.
    pub unsafe fn record_deallocation(&self, call_site: CallSiteInfo) {
        self.begin_write();
        let inner = &mut *self.inner.get();
        inner.allocated = false;
        inner.has_deallocation = true;
        inner.deallocation = call_site;
        self.end_write();
    }

    /// Read the live user pointer.
    ///
    /// # Safety
    /// Caller must hold the pool mutex.
    #[inline]
    pub unsafe fn user_ptr(&self) -> usize {
        (*self.inner.get()).user_ptr
    }

    /// # Safety
    /// Caller must hold the pool mutex.
    #[inline]
    pub unsafe fn requested_size(&self) -> usize {
        (*self.inner.get()).requested_size
    }

    /// # Safety
    /// Caller must hold the pool mutex.
    #[inline]
    pub unsafe fn is_allocated(&self) -> bool {
        (*self.inner.get()).allocated
    }

    #[inline]
    pub fn error_reported(&self) -> bool {
        self.error_reported.load(Ordering::Acquire)
    }

    /// Claim the one report this slot is allowed. Exactly one caller wins
    /// even when several threads fault on the slot concurrently.
    #[inline]
    pub fn try_claim_report(&self) -> bool {
        self.error_reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take a coherent snapshot without the mutex. Async-signal-safe.
    /// Returns None if a writer would not get out of the way; callers
    /// treat that as "not our fault".
    pub fn snapshot(&self) -> Option<SlotSnapshot> {
        for _ in 0..SNAPSHOT_RETRIES {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let snap = unsafe {
                let inner = self.inner.get();
                SlotSnapshot {
                    user_ptr: core::ptr::addr_of!((*inner).user_ptr).read_volatile(),
                    requested_size: core::ptr::addr_of!((*inner).requested_size).read_volatile(),
                    allocated: core::ptr::addr_of!((*inner).allocated).read_volatile(),
                    left_aligned: core::ptr::addr_of!((*inner).left_aligned).read_volatile(),
                    has_deallocation: core::ptr::addr_of!((*inner).has_deallocation)
                        .read_volatile(),
                    allocation: core::ptr::addr_of!((*inner).allocation).read_volatile(),
                    deallocation: core::ptr::addr_of!((*inner).deallocation).read_volatile(),
                }
            };
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == v1 {
                return Some(snap);
            }
        }
        None
    }

    fn begin_write(&self) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn end_write(&self) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Release);
    }
}
