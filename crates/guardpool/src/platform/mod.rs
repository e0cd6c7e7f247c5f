#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use core::ffi::CStr;

/// Map anonymous memory, initially inaccessible. Never returns null: a
/// mapping failure means the environment is fundamentally broken, so the
/// process is aborted with a diagnostic.
///
/// `name` must be a static string; on platforms that support named
/// mappings it shows up in the memory map.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_inaccessible(size: usize, name: &'static CStr) -> *mut u8 {
    let ptr = sys::map_inaccessible(size, name);
    if ptr.is_null() {
        abort_with_message("guardpool: failed to map pool memory\n");
    }
    ptr
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_inaccessible` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize, _name: &'static CStr) {
    sys::unmap(ptr, size);
}

/// Mark memory as read-write. Aborts the process on failure.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn mark_read_write(ptr: *mut u8, size: usize, _name: &'static CStr) {
    if !sys::protect_read_write(ptr, size) {
        abort_with_message("guardpool: mprotect(PROT_READ | PROT_WRITE) failed\n");
    }
}

/// Mark memory as inaccessible (guard state). Aborts the process on failure.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn mark_inaccessible(ptr: *mut u8, size: usize, _name: &'static CStr) {
    if !sys::protect_none(ptr, size) {
        abort_with_message("guardpool: mprotect(PROT_NONE) failed\n");
    }
}

/// Get the platform page size.
#[inline]
pub fn page_size() -> usize {
    sys::page_size()
}

/// Get a cheap thread identifier, cached in TLS.
#[inline]
pub fn thread_id() -> u64 {
    sys::thread_id()
}

/// Abort with a diagnostic message on stderr. Used when the platform
/// cannot supply the primitives the pool depends on.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Raw write(2): if mapping or mprotect fails, the heap is the
        // last thing to trust with a formatted message.
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}
