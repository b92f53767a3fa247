//! Memory bandwidth, random access latency and multithreaded contention

use super::progress;
use super::workers::{run_pinned_workers, worker_count};
use crate::affinity;
use crate::metrics::{AdaptiveMeasurement, LatencyStats, Timer};
use crate::results::BenchmarkResult;
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Duration;
use tracing::debug;

pub const NAME: &str = "Memory";

const MIB: usize = 1024 * 1024;
pub const DEFAULT_BUFFER_BYTES: usize = 256 * MIB;
pub const MIN_BUFFER_BYTES: usize = 16 * MIB;
/// Sequential copies move 4 KiB at a time
const BLOCK_WORDS: usize = 4096 / WORD;
const WORD: usize = std::mem::size_of::<u64>();
/// Words per 64-byte cache line
const LINE_WORDS: usize = 64 / WORD;
const BATCH_OPS: usize = 100;
const MULTITHREAD_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MemoryBenchmark {
    buffer_bytes: usize,
    min_buffer_bytes: usize,
    threads: Option<usize>,
}

impl Default for MemoryBenchmark {
    fn default() -> Self {
        Self {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            min_buffer_bytes: MIN_BUFFER_BYTES,
            threads: None,
        }
    }
}

impl MemoryBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocation attempts at `bytes` instead of 256 MiB
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes.max(BLOCK_WORDS * WORD);
        self.min_buffer_bytes = self.min_buffer_bytes.min(self.buffer_bytes);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub(crate) fn execute(&self, duration_seconds: u32, iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        let mut buffer = allocate_buffer(self.buffer_bytes, self.min_buffer_bytes)?;
        let buffer_bytes = buffer.len() * WORD;
        progress!(verbose, "Allocated {} MB buffer", buffer_bytes / MIB);

        let measurement = AdaptiveMeasurement::default();

        progress!(verbose, "Running sequential read test");
        let read = sequential_read(&buffer, &measurement);
        progress!(verbose, "Running sequential write test");
        let write = sequential_write(&mut buffer, &measurement);
        let clamped = read.clamped || write.clamped;
        if clamped {
            debug!("Sequential throughput hit the {} MB/s ceiling", measurement.throughput_ceiling_mb_s);
        }

        progress!(verbose, "Running random access test (individual timing)");
        let mut individual = LatencyStats::with_capacity(iterations as usize * 100);
        let random_ops = random_access_individual(&mut buffer, iterations as usize * 100, &mut individual);

        progress!(verbose, "Running random access test (batch timing)");
        let batch = random_access_batched(&mut buffer, iterations as usize * 1000);
        let batch_avg_us = batch.avg_latency_ns / 1000.0;
        progress!(
            verbose,
            "Random access: individual {:.4} us, batch {:.4} us, overhead {:.4} us",
            individual.average(),
            batch_avg_us,
            individual.average() - batch_avg_us
        );

        let threads = worker_count(self.threads.unwrap_or_else(affinity::num_cores));
        let window = MULTITHREAD_CAP.min(Duration::from_secs(duration_seconds as u64));
        progress!(verbose, "Running multithreaded pass on {} threads for {:?}", threads, window);
        let multithread_mbps = multithreaded_pass(&mut buffer, threads, window)?;

        let mut result = BenchmarkResult::new(NAME)
            .with_throughput((read.throughput_mb_s + write.throughput_mb_s) / 2.0, "MB/s")
            .with_latency(individual.summary(), "us")
            .with_metric("sequential_read_mbps", read.throughput_mb_s)
            .with_metric("sequential_write_mbps", write.throughput_mb_s)
            .with_metric("random_access_ops_sec", random_ops)
            .with_metric("random_access_batch_ops_sec", batch.ops_per_second)
            .with_metric("random_latency_batch_ns", batch.avg_latency_ns)
            .with_metric("random_latency_overhead_us", individual.average() - batch_avg_us)
            .with_metric("buffer_size_mb", buffer_bytes as f64 / MIB as f64)
            .with_metric("multithread_throughput_mbps", multithread_mbps)
            .with_metric("threads_used", threads as f64)
            .with_metric("throughput_clamped", if clamped { 1.0 } else { 0.0 });
        // Batch timing excludes per-sample timer overhead
        result.avg_latency = batch_avg_us;
        Ok(result)
    }
}

/// Allocate `bytes` (rounded down to whole words), halving on failure
/// until `floor` is reached
pub fn allocate_buffer(bytes: usize, floor: usize) -> Result<Vec<u64>> {
    let mut size = bytes;
    loop {
        let words = size / WORD;
        let mut buffer: Vec<u64> = Vec::new();
        match buffer.try_reserve_exact(words) {
            Ok(()) => {
                buffer.resize(words, 0x5555_5555_5555_5555);
                return Ok(buffer);
            }
            Err(e) => {
                debug!("Could not allocate {} bytes: {}", size, e);
                if size / 2 < floor || size / 2 == 0 {
                    bail!("Failed to allocate memory buffer (last attempt {} bytes)", size);
                }
                size /= 2;
            }
        }
    }
}

fn sequential_read(buffer: &[u64], measurement: &AdaptiveMeasurement) -> crate::metrics::AdaptiveOutcome {
    let mut block = vec![0u64; BLOCK_WORDS];
    let bytes = (buffer.len() / BLOCK_WORDS * BLOCK_WORDS * WORD) as u64;
    measurement.measure(10, bytes, |iterations| {
        for _ in 0..iterations {
            for chunk in buffer.chunks_exact(BLOCK_WORDS) {
                block.copy_from_slice(chunk);
                black_box(&block);
            }
        }
    })
}

fn sequential_write(buffer: &mut [u64], measurement: &AdaptiveMeasurement) -> crate::metrics::AdaptiveOutcome {
    let block = vec![0xAAAA_AAAA_AAAA_AAAAu64; BLOCK_WORDS];
    let bytes = (buffer.len() / BLOCK_WORDS * BLOCK_WORDS * WORD) as u64;
    measurement.measure(10, bytes, |iterations| {
        for _ in 0..iterations {
            for chunk in buffer.chunks_exact_mut(BLOCK_WORDS) {
                chunk.copy_from_slice(&block);
            }
            black_box(&buffer);
        }
    })
}

fn random_indices(len: usize, count: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(0..len)).collect()
}

/// Read-modify-write `ops` random words, timing each one; returns ops/sec
pub fn random_access_individual(buffer: &mut [u64], ops: usize, stats: &mut LatencyStats) -> f64 {
    if buffer.is_empty() || ops == 0 {
        return 0.0;
    }
    let indices = random_indices(buffer.len(), ops);

    let overall = Timer::new();
    let mut sum = 0u64;
    for &index in &indices {
        let op = Timer::new();
        sum = sum.wrapping_add(buffer[index]);
        buffer[index] = sum;
        stats.add_sample(op.elapsed_us());
    }
    let elapsed = overall.elapsed_s();
    black_box(sum);

    if elapsed > 0.0 {
        ops as f64 / elapsed
    } else {
        0.0
    }
}

/// Batch-timed random access
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOutcome {
    pub ops_per_second: f64,
    pub avg_latency_ns: f64,
    pub batches: usize,
}

/// Read-modify-write `ops` random words timed in batches of 100
pub fn random_access_batched(buffer: &mut [u64], ops: usize) -> BatchOutcome {
    if buffer.is_empty() || ops == 0 {
        return BatchOutcome {
            ops_per_second: 0.0,
            avg_latency_ns: 0.0,
            batches: 0,
        };
    }
    let indices = random_indices(buffer.len(), ops);

    // Warm caches and TLB on the same access pattern
    let mut sum = 0u64;
    for &index in indices.iter().take(1000) {
        sum = sum.wrapping_add(buffer[index]);
        buffer[index] = sum;
    }

    let mut total_ns = 0.0;
    let mut batches = 0;
    for batch in indices.chunks(BATCH_OPS) {
        let timer = Timer::new();
        for &index in batch {
            sum = sum.wrapping_add(buffer[index]);
            buffer[index] = sum;
        }
        total_ns += timer.elapsed_ns();
        batches += 1;
    }
    black_box(sum);

    let avg_latency_ns = total_ns / ops as f64;
    let ops_per_second = if total_ns > 0.0 {
        ops as f64 / (total_ns / 1e9)
    } else {
        0.0
    };
    BatchOutcome {
        ops_per_second,
        avg_latency_ns,
        batches,
    }
}

/// Each thread touches one cache line at a time in its own chunk; MB/s
fn multithreaded_pass(buffer: &mut [u64], threads: usize, window: Duration) -> Result<f64> {
    let chunk_words = (buffer.len() / threads.max(1)).max(LINE_WORDS);
    let chunks: Vec<&mut [u64]> = buffer.chunks_mut(chunk_words).take(threads).collect();

    let run = run_pinned_workers(chunks, window, |_, chunk, ctx| {
        let lines = (chunk.len() / LINE_WORDS) as u64;
        while !ctx.should_stop() {
            for word in chunk.iter_mut().step_by(LINE_WORDS) {
                *word = word.wrapping_add(1);
            }
            ctx.add_operations(lines);
        }
    })?;

    let secs = run.elapsed.as_secs_f64();
    if secs <= 0.0 {
        return Ok(0.0);
    }
    Ok(run.total_operations as f64 * 64.0 / MIB as f64 / secs)
}
