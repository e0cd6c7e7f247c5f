//! Pool configuration. Defaults suit production sampling; everything can
//! be overridden programmatically or, for quick experiments, through
//! `GUARDPOOL_*` environment variables (parsed without allocating, since
//! this runs before the host heap is trustworthy).

/// Host-provided stack capture: fills up to `max` frames into `frames`
/// and returns the number written. May allocate; the pool's recursion
/// guard keeps that from re-entering the pool.
pub type BacktraceFn = unsafe extern "C" fn(frames: *mut usize, max: usize) -> usize;

#[derive(Clone, Copy)]
pub struct Options {
    /// Approximate reciprocal of the sampling probability. 0 disables
    /// sampling entirely.
    pub sample_rate: u32,
    /// Number of guarded slots, i.e. the maximum number of simultaneous
    /// sampled allocations.
    pub max_simultaneous_allocations: u32,
    /// Place right-aligned allocations flush against the guard page with
    /// no alignment rounding, trading ABI-correct alignment for
    /// byte-exact overflow detection.
    pub perfectly_right_align: bool,
    /// Stack capture callback used for allocation/deallocation traces.
    pub backtrace: Option<BacktraceFn>,
    /// Install the SIGSEGV handler during `init`. Hosts with their own
    /// crash plumbing can leave this off and call into the pool's
    /// classification themselves.
    pub install_signal_handlers: bool,
    /// Report each error once per slot and keep running, instead of
    /// stopping the process at the first fault.
    pub recoverable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sample_rate: 5000,
            max_simultaneous_allocations: 16,
            perfectly_right_align: false,
            backtrace: None,
            install_signal_handlers: true,
            recoverable: false,
        }
    }
}

impl Options {
    /// Defaults with any `GUARDPOOL_*` environment overrides applied.
    ///
    /// # Safety
    /// Calls libc::getenv, which is not thread-safe against concurrent
    /// environment mutation; call during single-threaded startup.
    pub unsafe fn from_env() -> Self {
        let mut opts = Options::default();
        if let Some(val) = getenv_u32(b"GUARDPOOL_SAMPLE_RATE\0") {
            opts.sample_rate = val;
        }
        if let Some(val) = getenv_u32(b"GUARDPOOL_MAX_ALLOCATIONS\0") {
            opts.max_simultaneous_allocations = val;
        }
        if let Some(val) = getenv_bool(b"GUARDPOOL_PERFECT_RIGHT_ALIGN\0") {
            opts.perfectly_right_align = val;
        }
        if let Some(val) = getenv_bool(b"GUARDPOOL_RECOVERABLE\0") {
            opts.recoverable = val;
        }
        opts
    }
}

/// Parse an environment variable as a u32.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_u32(key: &[u8]) -> Option<u32> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually (no std allocation)
    let mut result: u32 = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None; // Invalid
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as u32)?;
        ptr = ptr.add(1);
    }
    Some(result)
}

/// Parse an environment variable as a boolean ("0"/"1").
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_bool(key: &[u8]) -> Option<bool> {
    match getenv_u32(key) {
        Some(0) => Some(false),
        Some(_) => Some(true),
        None => None,
    }
}
