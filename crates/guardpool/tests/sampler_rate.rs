//! Sampling-rate behavior that depends on process-global state, kept in
//! its own test binary (and a single test function) so nothing else can
//! have configured the sampler first.

use guardpool::{GuardedPoolAllocator, Options};

fn options_with_rate(sample_rate: u32) -> Options {
    Options {
        sample_rate,
        max_simultaneous_allocations: 4,
        perfectly_right_align: false,
        backtrace: None,
        install_signal_handlers: false,
        recoverable: false,
    }
}

#[test]
fn sampling_tracks_the_configured_rate() {
    // Before init the sampler sits on its magic initial state: the first
    // refill produces an interval of roughly four billion, so nothing in
    // this test's lifetime ever samples.
    let uninitialised = GuardedPoolAllocator::new();
    for _ in 0..1_000_000 {
        assert!(!uninitialised.should_sample(), "sampled before init");
    }

    // Rate 0 keeps sampling disabled after init, too.
    unsafe {
        let mut pool = Box::new(GuardedPoolAllocator::new());
        pool.init(&options_with_rate(0));
        for _ in 0..1_000_000 {
            assert!(!pool.should_sample(), "sampled at rate 0");
        }
        pool.uninit_test_only();
    }

    // Rate 1: the refill interval is 1 or 2, so roughly every other call
    // samples. Run on a fresh thread so the counter state left over from
    // the phases above cannot skew the tally.
    unsafe {
        let mut pool = Box::new(GuardedPoolAllocator::new());
        pool.init(&options_with_rate(1));
        let hits = std::thread::spawn(|| {
            (0..1000)
                .filter(|_| guardpool::sampler::should_sample())
                .count()
        })
        .join()
        .unwrap();
        assert!(hits >= 300, "rate 1 sampled only {}/1000", hits);
        pool.uninit_test_only();
    }
}
