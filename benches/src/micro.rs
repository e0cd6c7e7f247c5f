/// Microbenchmarks for guardpool.
///
/// Measures the two paths that matter in production: the per-allocation
/// sampling decision (taken by every host malloc call, sampled or not)
/// and the full guarded allocate/deallocate cycle (taken only by sampled
/// calls, dominated by the two mprotect syscalls).

use std::hint::black_box;
use std::time::Instant;

use guardpool::{GuardedPoolAllocator, Options};

/// Measure the should_sample() hot path at a production-like rate.
fn bench_should_sample(iterations: usize, pool: &GuardedPoolAllocator) -> f64 {
    // Warmup
    for _ in 0..1000 {
        black_box(pool.should_sample());
    }
    let start = Instant::now();
    let mut hits = 0usize;
    for _ in 0..iterations {
        if black_box(pool.should_sample()) {
            hits += 1;
        }
    }
    let elapsed = start.elapsed();
    black_box(hits);
    elapsed.as_nanos() as f64 / iterations as f64
}

/// Measure a guarded allocate/write/deallocate cycle.
fn bench_guarded_cycle(size: usize, iterations: usize, pool: &GuardedPoolAllocator) -> f64 {
    // Warmup: also drives the pool past its fresh-slot phase so the
    // measured loop exercises the steady recycling path.
    for _ in 0..100 {
        unsafe {
            let ptr = pool.allocate(black_box(size));
            if !ptr.is_null() {
                std::ptr::write_bytes(ptr, 0xAB, size.min(64));
                pool.deallocate(black_box(ptr));
            }
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = pool.allocate(black_box(size));
            if !ptr.is_null() {
                std::ptr::write_bytes(ptr, 0xAB, size.min(64));
                pool.deallocate(black_box(ptr));
            }
        }
    }
    let elapsed = start.elapsed();
    elapsed.as_nanos() as f64 / iterations as f64
}

fn main() {
    let pool: &'static GuardedPoolAllocator = unsafe {
        let pool = Box::leak(Box::new(GuardedPoolAllocator::new()));
        pool.init(&Options {
            sample_rate: 5000,
            max_simultaneous_allocations: 16,
            perfectly_right_align: false,
            backtrace: None,
            install_signal_handlers: false,
            recoverable: false,
        });
        pool
    };

    println!("guardpool microbenchmarks");
    println!();

    let ns = bench_should_sample(10_000_000, pool);
    println!("should_sample (rate 5000):  {:8.2} ns/call", ns);

    for &size in &[16usize, 256, 4096] {
        let ns = bench_guarded_cycle(size, 100_000, pool);
        println!("guarded cycle size {:5}:   {:8.2} ns/op", size, ns);
    }
}
