#![no_main]

use libfuzzer_sys::fuzz_target;

use guardpool::{GuardedPoolAllocator, Options};

/// Fuzz target that interprets a byte slice as a sequence of pool
/// operations. Only valid sequences are generated (a pointer is freed at
/// most once and never fabricated): invalid frees intentionally raise
/// SIGSEGV, which the fuzzer would misread as a crash.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=deallocate, 2=get_size, 3=write)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 32 live pointers.
const MAX_SLOTS: usize = 32;

fn pool() -> &'static GuardedPoolAllocator {
    use std::sync::OnceLock;
    static POOL: OnceLock<&'static GuardedPoolAllocator> = OnceLock::new();
    POOL.get_or_init(|| unsafe {
        let pool = Box::leak(Box::new(GuardedPoolAllocator::new()));
        pool.init(&Options {
            sample_rate: 1,
            max_simultaneous_allocations: 16,
            perfectly_right_align: false,
            backtrace: None,
            install_signal_handlers: false,
            recoverable: false,
        });
        pool
    })
}

fuzz_target!(|data: &[u8]| {
    let pool = pool();
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // allocate (freeing any pointer already in the slot)
                if !slots[slot].is_null() {
                    unsafe { pool.deallocate(slots[slot]) };
                }
                let ptr = unsafe { pool.allocate(size) };
                slots[slot] = ptr;
                sizes[slot] = size;
                if !ptr.is_null() && size > 0 {
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xAA, size.min(256));
                    }
                }
            }
            1 => {
                // deallocate
                if !slots[slot].is_null() {
                    unsafe { pool.deallocate(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                // get_size must agree with the recorded request
                if !slots[slot].is_null() {
                    let got = unsafe { pool.get_size(slots[slot]) };
                    assert_eq!(got, sizes[slot]);
                }
            }
            _ => {
                // write across the whole allocation
                if !slots[slot].is_null() && sizes[slot] > 0 {
                    unsafe {
                        std::ptr::write_bytes(slots[slot], 0x5A, sizes[slot]);
                    }
                }
            }
        }
    }

    // Return everything so the next input starts from an empty pool.
    for &ptr in slots.iter() {
        if !ptr.is_null() {
            unsafe { pool.deallocate(ptr) };
        }
    }
});
