#![no_main]

use libfuzzer_sys::fuzz_target;

use guardpool::trace;
use guardpool::util::{MAX_TRACE_FRAMES, TRACE_STORAGE_BYTES};

/// Fuzz the trace codec from both directions:
/// 1. Treat the input as raw compressed bytes and unpack them; the decoder
///    must never panic or read out of bounds, whatever the bytes are.
/// 2. Treat the input as frame addresses, pack them into the fixed buffer,
///    unpack the result, and require that every decoded frame matches its
///    original (truncation may shorten the list, never corrupt it).
fuzz_target!(|data: &[u8]| {
    // Direction 1: arbitrary bytes into the decoder.
    let mut frames = [0usize; MAX_TRACE_FRAMES];
    let _ = trace::unpack(data, &mut frames);

    // Direction 2: interpret the input as frames and round-trip.
    let mut original = [0usize; MAX_TRACE_FRAMES];
    let mut count = 0;
    for chunk in data.chunks_exact(8) {
        if count >= original.len() {
            break;
        }
        original[count] = usize::from_le_bytes(chunk.try_into().unwrap());
        count += 1;
    }

    let mut packed = [0u8; TRACE_STORAGE_BYTES];
    let packed_len = trace::pack(&original[..count], &mut packed);
    assert!(packed_len <= packed.len());

    let mut decoded = [0usize; MAX_TRACE_FRAMES];
    let decoded_count = trace::unpack(&packed[..packed_len], &mut decoded);
    assert!(decoded_count <= count);
    assert_eq!(&decoded[..decoded_count], &original[..decoded_count]);
});
