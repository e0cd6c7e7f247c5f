//! SIGSEGV handling and report staging.
//!
//! The handler runs in async-signal context on the faulting thread, so it
//! works exclusively with atomics, the seqlock metadata snapshots, page
//! permission flips, and a single write(2) of a preformatted buffer. It
//! never takes the pool mutex and never allocates.
//!
//! Faults the pool does not own are chained to whatever handler was
//! installed before ours: the saved disposition is restored and the
//! faulting instruction re-executes under it.

use crate::platform;
use crate::pool::{self, ALIVE_SLOT_NAME};
use crate::state::{AllocatorState, Error, SlotView};
use crate::util::{align_down, MAX_TRACE_FRAMES};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// Every report starts with this line; exactly one occurrence per
/// attributed slot.
pub const REPORT_HEADER: &str = "guardpool: memory error detected:";

/// Stack frames included per trace in the staged report. The full
/// compressed traces stay in the metadata region for richer printers.
const REPORT_MAX_FRAMES: usize = 8;

const REPORT_BUFFER_BYTES: usize = 1024;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static mut PREVIOUS_ACTION: Option<libc::sigaction> = None;

/// Install the SIGSEGV handler, saving the previous disposition for
/// chaining.
///
/// # Safety
/// Process-global signal state; call from single-threaded init.
pub unsafe fn install_signal_handlers() {
    if HANDLER_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = segv_handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    libc::sigemptyset(&mut action.sa_mask);
    let mut previous: libc::sigaction = mem::zeroed();
    libc::sigaction(libc::SIGSEGV, &action, &mut previous);
    *ptr::addr_of_mut!(PREVIOUS_ACTION) = Some(previous);
}

/// Restore the previous SIGSEGV disposition. Tests only.
///
/// # Safety
/// Process-global signal state; no fault may be in flight.
pub unsafe fn uninstall_signal_handlers() {
    if !HANDLER_INSTALLED.swap(false, Ordering::AcqRel) {
        return;
    }
    if let Some(previous) = (*ptr::addr_of_mut!(PREVIOUS_ACTION)).take() {
        libc::sigaction(libc::SIGSEGV, &previous, ptr::null_mut());
    }
}

/// Hand the fault to whoever owned SIGSEGV before us. Restoring the old
/// disposition and returning makes the faulting instruction re-execute
/// under it; for the default disposition that terminates the process with
/// the original fault context intact.
unsafe fn chain_to_previous() {
    HANDLER_INSTALLED.store(false, Ordering::Release);
    match (*ptr::addr_of_mut!(PREVIOUS_ACTION)).take() {
        Some(previous) => {
            libc::sigaction(libc::SIGSEGV, &previous, ptr::null_mut());
        }
        None => {
            let mut default_action: libc::sigaction = mem::zeroed();
            default_action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGSEGV, &default_action, ptr::null_mut());
        }
    }
}

/// Make the faulting page accessible again so the trapped access can
/// retire and the program keeps running.
unsafe fn rearm_page(state: &AllocatorState, addr: usize) {
    let page = state.pool_base() + align_down(addr - state.pool_base(), state.page_size());
    platform::mark_read_write(page as *mut u8, state.page_size(), ALIVE_SLOT_NAME);
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(target_os = "macos")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

unsafe extern "C" fn segv_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let pool = match pool::singleton() {
        Some(pool) if pool.is_initialized() => pool,
        _ => return chain_to_previous(),
    };
    let state = pool.state();
    let recoverable = pool.is_recoverable();

    // An internal trap (double/invalid free) latches its kind and address
    // before raising; that beats si_addr, which raise() leaves empty.
    // take_failure consumes the latch, so of several concurrently running
    // handler invocations exactly one owns the internal error.
    let internal = state.take_failure();
    let (latched_kind, addr) = match internal {
        Some((kind, failure_addr)) => (kind, failure_addr),
        None => (Error::Unknown, fault_address(info)),
    };
    let was_internal = internal.is_some();

    if !was_internal && (*info).si_code <= 0 {
        // A raise()-origin signal whose latch a concurrent handler
        // already consumed: that handler owns the report; the raising
        // thread just resumes.
        return;
    }

    if !state.pointer_is_mine(addr) {
        if !was_internal {
            return chain_to_previous();
        }
        // Wild free: no slot to attribute, so no per-slot latch. Report
        // each occurrence.
        emit_report(latched_kind, addr, None, None);
        if recoverable {
            return;
        }
        pool.stop();
        chain_to_previous();
        libc::raise(libc::SIGSEGV);
        return;
    }

    let slot = state.nearest_slot(addr);
    let record = pool.record_at(slot);

    // One report per slot: once latched, keep the program moving without
    // a word.
    if record.error_reported() {
        return suppress(pool, state, addr, was_internal, recoverable);
    }

    let snapshot = match record.snapshot() {
        Some(snapshot) => snapshot,
        // A writer would not get out of the way; the record cannot be
        // trusted, so the fault cannot be attributed.
        None => return suppress(pool, state, addr, was_internal, recoverable),
    };

    let kind = if was_internal {
        latched_kind
    } else {
        let view = SlotView {
            allocated: snapshot.allocated,
            user_ptr: snapshot.user_ptr,
            requested_size: snapshot.requested_size,
        };
        state.classify(addr, slot, &view)
    };
    if kind == Error::Unknown {
        // In-pool but unattributable (e.g. a guard hit beside a slot
        // that is not allocated): the report is dropped, but the fault
        // is still ours to absorb.
        return suppress(pool, state, addr, was_internal, recoverable);
    }

    if !record.try_claim_report() {
        // Lost the race against a concurrent fault on the same slot.
        return suppress(pool, state, addr, was_internal, recoverable);
    }

    emit_report(kind, addr, Some(slot), Some(&snapshot));

    if recoverable {
        if !was_internal {
            rearm_page(state, addr);
        }
        return;
    }
    pool.stop();
    chain_to_previous();
    if was_internal {
        // raise() has no faulting instruction to re-execute.
        libc::raise(libc::SIGSEGV);
    }
}

/// Silent path for already-reported or unattributable faults: keep a real
/// memory access runnable, or give the fault away when the pool is not
/// allowed to recover.
unsafe fn suppress(
    pool: &pool::GuardedPoolAllocator,
    state: &AllocatorState,
    addr: usize,
    was_internal: bool,
    recoverable: bool,
) {
    if recoverable {
        if !was_internal {
            rearm_page(state, addr);
        }
        return;
    }
    pool.stop();
    chain_to_previous();
    if was_internal {
        libc::raise(libc::SIGSEGV);
    }
}

// ---------------------------------------------------------------------------
// Report staging
// ---------------------------------------------------------------------------

/// Fixed-size staging buffer with truncating, allocation-free append.
struct StagingBuffer {
    buf: [u8; REPORT_BUFFER_BYTES],
    len: usize,
}

impl StagingBuffer {
    fn new() -> Self {
        StagingBuffer {
            buf: [0; REPORT_BUFFER_BYTES],
            len: 0,
        }
    }

    fn push_str(&mut self, s: &str) {
        for &byte in s.as_bytes() {
            if self.len >= self.buf.len() {
                return;
            }
            self.buf[self.len] = byte;
            self.len += 1;
        }
    }

    fn push_dec(&mut self, mut value: u64) {
        let mut digits = [0u8; 20];
        let mut count = 0;
        loop {
            digits[count] = b'0' + (value % 10) as u8;
            value /= 10;
            count += 1;
            if value == 0 {
                break;
            }
        }
        while count > 0 {
            count -= 1;
            if self.len >= self.buf.len() {
                return;
            }
            self.buf[self.len] = digits[count];
            self.len += 1;
        }
    }

    fn push_hex(&mut self, value: usize) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        self.push_str("0x");
        let mut started = false;
        for shift in (0..usize::BITS / 4).rev() {
            let nibble = (value >> (shift * 4)) & 0xf;
            if nibble == 0 && !started && shift != 0 {
                continue;
            }
            started = true;
            if self.len >= self.buf.len() {
                return;
            }
            self.buf[self.len] = HEX[nibble as usize];
            self.len += 1;
        }
    }

    fn flush_to_stderr(&self) {
        unsafe {
            libc::write(2, self.buf.as_ptr() as *const libc::c_void, self.len);
        }
    }
}

fn emit_report(
    kind: Error,
    addr: usize,
    slot: Option<usize>,
    snapshot: Option<&crate::metadata::SlotSnapshot>,
) {
    let mut out = StagingBuffer::new();
    out.push_str(REPORT_HEADER);
    out.push_str(" ");
    out.push_str(kind.as_str());
    out.push_str(" at ");
    out.push_hex(addr);
    if let Some(slot) = slot {
        out.push_str(" (slot ");
        out.push_dec(slot as u64);
        if let Some(snapshot) = snapshot {
            out.push_str(", size ");
            out.push_dec(snapshot.requested_size as u64);
        }
        out.push_str(")");
    }
    out.push_str(" on thread ");
    out.push_dec(platform::thread_id());
    out.push_str("\n");

    if let Some(snapshot) = snapshot {
        push_trace(&mut out, "  allocated by thread ", &snapshot.allocation);
        if snapshot.has_deallocation {
            push_trace(&mut out, "  freed by thread ", &snapshot.deallocation);
        }
    }
    out.flush_to_stderr();
}

fn push_trace(out: &mut StagingBuffer, label: &str, site: &crate::metadata::CallSiteInfo) {
    out.push_str(label);
    out.push_dec(site.thread_id);
    out.push_str(":");
    let mut frames = [0usize; MAX_TRACE_FRAMES];
    let count = site.decode(&mut frames);
    if count == 0 {
        out.push_str(" <no trace>");
    }
    for &frame in frames.iter().take(count.min(REPORT_MAX_FRAMES)) {
        out.push_str(" ");
        out.push_hex(frame);
    }
    if count > REPORT_MAX_FRAMES {
        out.push_str(" ...");
    }
    out.push_str("\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_buffer_formats_and_truncates() {
        let mut out = StagingBuffer::new();
        out.push_str("addr ");
        out.push_hex(0xdead_beef);
        out.push_str(" size ");
        out.push_dec(4096);
        assert_eq!(&out.buf[..out.len], b"addr 0xdeadbeef size 4096");

        let mut out = StagingBuffer::new();
        for _ in 0..REPORT_BUFFER_BYTES {
            out.push_str("xy");
        }
        assert_eq!(out.len, REPORT_BUFFER_BYTES);
    }

    #[test]
    fn hex_of_zero_prints_a_digit() {
        let mut out = StagingBuffer::new();
        out.push_hex(0);
        assert_eq!(&out.buf[..out.len], b"0x0");
    }
}
