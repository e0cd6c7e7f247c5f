use core::ffi::CStr;
use core::ptr;

// prctl constants for naming anonymous mappings. Not exposed by every libc
// version, so they are spelled out here.
const PR_SET_VMA: libc::c_int = 0x53564d41;
const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

/// Map anonymous memory with no access permissions.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_inaccessible(size: usize, name: &'static CStr) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    // Name the mapping so it is identifiable in /proc/self/maps. The name
    // must be a static string: the kernel keeps the pointer. Unsupported on
    // kernels before 5.17, so failure is ignored.
    libc::prctl(
        PR_SET_VMA,
        PR_SET_VMA_ANON_NAME,
        result as libc::c_ulong,
        size as libc::c_ulong,
        name.as_ptr() as libc::c_ulong,
    );
    result as *mut u8
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

/// Get a cheap thread identifier.
/// Cached in TLS to avoid a syscall on every allocation. Falls back to the
/// raw syscall during thread teardown when TLS is gone.
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
        let new_tid = unsafe { libc::syscall(libc::SYS_gettid) as u64 };
        tid.set(new_tid);
        new_tid
    });

    match cached {
        Ok(t) => t,
        Err(_) => unsafe { libc::syscall(libc::SYS_gettid) as u64 },
    }
}
