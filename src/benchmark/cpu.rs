//! CPU throughput, per-operation latency and cache hierarchy latency

use super::progress;
use super::workers::{run_pinned_workers, worker_count};
use crate::affinity;
use crate::metrics::{LatencyStats, Timer};
use crate::results::BenchmarkResult;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::hint::black_box;
use std::time::Duration;

pub const NAME: &str = "CPU";

/// Operations credited per worker batch (1000 rounds of 10 mixed ops)
const OPS_PER_BATCH: u64 = 10_000;
const ROUNDS_PER_BATCH: usize = 1_000;
/// Elements in the float and integer latency kernels
const KERNEL_LEN: usize = 100_000;
/// Dependent loads per pointer-chase measurement
const CHASE_STEPS: usize = 200_000;

/// Working sets sized to land in L1, L2, L3 and main memory
pub const CACHE_WORKING_SETS: [usize; 4] = [4 * 1024, 128 * 1024, 1024 * 1024, 32 * 1024 * 1024];

/// Average dependent-load latency per cache level, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheLatencyProfile {
    pub l1_ns: f64,
    pub l2_ns: f64,
    pub l3_ns: f64,
    pub mem_ns: f64,
}

impl CacheLatencyProfile {
    pub fn from_levels(levels: [f64; 4]) -> Self {
        Self {
            l1_ns: levels[0],
            l2_ns: levels[1],
            l3_ns: levels[2],
            mem_ns: levels[3],
        }
    }

    pub fn levels(&self) -> [f64; 4] {
        [self.l1_ns, self.l2_ns, self.l3_ns, self.mem_ns]
    }

    /// True when latency never decreases moving away from the core
    pub fn is_monotonic(&self) -> bool {
        self.levels().windows(2).all(|w| w[0] <= w[1])
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuBenchmark {
    threads: Option<usize>,
}

impl CpuBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a thread count; it is still capped at the hardware threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub(crate) fn execute(&self, duration_seconds: u32, iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        let cores = affinity::num_cores();
        let threads = worker_count(self.threads.unwrap_or(cores));
        progress!(
            verbose,
            "Starting CPU benchmark with {} threads on {} cores",
            threads,
            cores
        );

        let run = run_pinned_workers(
            (0..threads as u64).collect(),
            Duration::from_secs(duration_seconds as u64),
            |_, seed, ctx| {
                let mut rng = StdRng::seed_from_u64(seed);
                while !ctx.should_stop() {
                    black_box(mixed_batch(&mut rng));
                    ctx.add_operations(OPS_PER_BATCH);
                }
            },
        )?;
        let gops = run.operations_per_second() / 1e9;
        progress!(
            verbose,
            "Multithreaded phase done: {:.3} GOPS, {}/{} threads pinned",
            gops,
            run.pinned,
            run.threads
        );

        let mut latencies = LatencyStats::with_capacity(iterations as usize * 2);
        let mut float_latency = LatencyStats::with_capacity(iterations as usize);
        let mut int_latency = LatencyStats::with_capacity(iterations as usize);
        for _ in 0..iterations {
            let f = float_latency_us_per_op();
            let i = int_latency_us_per_op();
            float_latency.add_sample(f);
            int_latency.add_sample(i);
        }
        latencies.merge(&float_latency);
        latencies.merge(&int_latency);

        progress!(verbose, "Measuring cache latency");
        let cache = measure_cache_latency();
        if !cache.is_monotonic() {
            progress!(verbose, "Cache latency not monotonic on this host: {:?}", cache);
        }

        Ok(BenchmarkResult::new(NAME)
            .with_throughput(gops, "GOPS")
            .with_latency(latencies.summary(), "us/op")
            .with_metric("l1_cache_latency_ns", cache.l1_ns)
            .with_metric("l2_cache_latency_ns", cache.l2_ns)
            .with_metric("l3_cache_latency_ns", cache.l3_ns)
            .with_metric("mem_latency_ns", cache.mem_ns)
            .with_metric("threads_used", run.threads as f64)
            .with_metric("cpu_cores", cores as f64)
            .with_metric("cpu_affinity_enabled", if run.pinned > 0 { 1.0 } else { 0.0 })
            .with_metric("float_latency_us", float_latency.average())
            .with_metric("int_latency_us", int_latency.average()))
    }
}

/// One worker batch of mixed floating point and integer work
fn mixed_batch(rng: &mut StdRng) -> (f64, i64) {
    let mut sum = 0.0f64;
    let mut int_sum = 0i64;
    for _ in 0..ROUNDS_PER_BATCH {
        let a: f64 = rng.gen_range(0.0..1000.0);
        let b: f64 = rng.gen_range(0.0..1000.0);
        sum += a.sin() * b.cos();
        sum += (a * b).sqrt();
        sum += (-a / (b + 1.0)).exp();

        let x = a as i64;
        let y = b as i64 + 1;
        int_sum = int_sum.wrapping_add(x.wrapping_mul(y));
        int_sum = int_sum.wrapping_add(x / y);
        int_sum ^= x << 2;
        int_sum |= y >> 1;
    }
    (sum, int_sum)
}

/// Average microseconds per floating point operation over a fixed kernel
pub fn float_latency_us_per_op() -> f64 {
    let mut rng = StdRng::seed_from_u64(42);
    let values: Vec<f64> = (0..KERNEL_LEN).map(|_| rng.gen_range(0.1..100.0)).collect();

    let timer = Timer::new();
    let mut result = 0.0f64;
    for pair in values.windows(2) {
        let (a, b) = (black_box(pair[0]), black_box(pair[1]));
        result += a.sin() * b.cos();
        result += a.abs().sqrt();
        result += (a + 1.0).ln();
    }
    let elapsed = timer.elapsed_us();
    black_box(result);

    elapsed / (KERNEL_LEN * 3) as f64
}

/// Average microseconds per integer operation over a fixed kernel
pub fn int_latency_us_per_op() -> f64 {
    let mut rng = StdRng::seed_from_u64(42);
    let values: Vec<i64> = (0..KERNEL_LEN).map(|_| rng.gen_range(1..=1_000_000)).collect();

    let timer = Timer::new();
    let mut result = 0i64;
    for pair in values.windows(2) {
        let (a, b) = (black_box(pair[0]), black_box(pair[1]));
        result = result.wrapping_add(a.wrapping_mul(b));
        result ^= a << 3;
        result |= b >> 2;
        result = result.wrapping_add(a / (b + 1));
    }
    let elapsed = timer.elapsed_us();
    black_box(result);

    elapsed / (KERNEL_LEN * 4) as f64
}

/// Single random cycle through `len` slots (Sattolo's algorithm)
///
/// Following `next[i]` from any slot visits every slot before returning,
/// so each load depends on the previous one and prefetchers cannot help.
pub fn chase_cycle(len: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut next: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..i);
        next.swap(i, j);
    }
    next
}

/// Nanoseconds per dependent load over a working set of `bytes`
pub fn pointer_chase_ns(bytes: usize, steps: usize) -> f64 {
    let len = (bytes / std::mem::size_of::<usize>()).max(2);
    let mut rng = StdRng::seed_from_u64(42);
    let next = chase_cycle(len, &mut rng);

    // Warm the working set and TLB before timing
    let mut index = 0usize;
    for _ in 0..len {
        index = next[index];
    }

    let timer = Timer::new();
    for _ in 0..steps {
        index = next[black_box(index)];
    }
    let elapsed = timer.elapsed_ns();
    black_box(index);

    elapsed / steps.max(1) as f64
}

pub fn measure_cache_latency() -> CacheLatencyProfile {
    let mut levels = [0.0; 4];
    for (slot, bytes) in levels.iter_mut().zip(CACHE_WORKING_SETS) {
        *slot = pointer_chase_ns(bytes, CHASE_STEPS);
    }
    CacheLatencyProfile::from_levels(levels)
}
