use core::ffi::CStr;
use core::ptr;

/// Map anonymous memory with no access permissions. Mapping names are not
/// supported on macOS; the argument is accepted for interface parity.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_inaccessible(size: usize, _name: &'static CStr) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by `map_inaccessible` with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Mark memory as inaccessible (guard state). Returns false on failure.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE) == 0
}

/// Mark memory as read-write. Returns false on failure.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Get the platform page size.
pub fn page_size() -> usize {
    unsafe {
        let sz = libc::sysconf(libc::_SC_PAGESIZE);
        if sz < 1 {
            4096
        } else {
            sz as usize
        }
    }
}

/// Get a cheap thread identifier, cached in TLS.
#[inline]
pub fn thread_id() -> u64 {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<u64> = const { Cell::new(0) };
    }

    let cached = CACHED_TID.try_with(|tid| {
        let t = tid.get();
        if t != 0 {
            return t;
        }
        let mut new_tid: u64 = 0;
        unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut new_tid) };
        tid.set(new_tid);
        new_tid
    });

    match cached {
        Ok(t) => t,
        Err(_) => {
            let mut tid: u64 = 0;
            unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
            tid
        }
    }
}
