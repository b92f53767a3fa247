//! Sequential and random disk I/O on a self-deleting scratch file

use super::progress;
use crate::metrics::{LatencyStats, Timer};
use crate::results::BenchmarkResult;
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const NAME: &str = "Disk I/O";

const MIB: u64 = 1024 * 1024;
pub const DEFAULT_FILE_BYTES: u64 = 256 * MIB;
const BLOCK_BYTES: usize = 4 * 1024 * 1024;
const PAGE_BYTES: usize = 4096;
pub const DEFAULT_RANDOM_OPS: usize = 1000;
/// Random read IOPS above which the device is most likely solid state
const SSD_READ_IOPS: f64 = 5000.0;

#[derive(Debug, Clone)]
pub struct DiskBenchmark {
    file_bytes: u64,
    random_ops: usize,
    dir: Option<PathBuf>,
}

impl Default for DiskBenchmark {
    fn default() -> Self {
        Self {
            file_bytes: DEFAULT_FILE_BYTES,
            random_ops: DEFAULT_RANDOM_OPS,
            dir: None,
        }
    }
}

/// Per-operation timings and the resulting rate of one phase
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    /// MB/s for sequential phases, IOPS for random ones
    pub rate: f64,
    /// Milliseconds per operation
    pub latencies: LatencyStats,
}

impl DiskBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the scratch file; at least one 4 KiB page
    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_bytes = bytes.max(PAGE_BYTES as u64);
        self
    }

    pub fn with_random_ops(mut self, ops: usize) -> Self {
        self.random_ops = ops.max(1);
        self
    }

    /// Place the scratch file in `dir` instead of the system temp directory
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    fn scratch_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub(crate) fn execute(&self, _duration_seconds: u32, _iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        let dir = self.scratch_dir();
        if let Some(available) = available_space(&dir) {
            progress!(verbose, "Available disk space: {} GB", available / (1024 * MIB));
            if available < self.file_bytes.saturating_mul(2) {
                bail!("Insufficient disk space for test");
            }
        }

        let mut scratch = tempfile::Builder::new()
            .prefix("perf_test_")
            .tempfile_in(&dir)
            .with_context(|| format!("Failed to create test file in {}", dir.display()))?;
        progress!(
            verbose,
            "Using test file {} ({} MB)",
            scratch.path().display(),
            self.file_bytes / MIB
        );

        progress!(verbose, "Running sequential write test");
        let seq_write = sequential_write(scratch.as_file_mut(), self.file_bytes)?;
        progress!(verbose, "Running sequential read test");
        let seq_read = sequential_read(scratch.as_file_mut(), self.file_bytes)?;
        progress!(verbose, "Running random write test");
        let rand_write = random_write(&scratch, self.file_bytes, self.random_ops)?;
        progress!(verbose, "Running random read test");
        let rand_read = random_read(&scratch, self.file_bytes, self.random_ops)?;

        let mut sequential = seq_write.latencies.clone();
        sequential.merge(&seq_read.latencies);

        let result = BenchmarkResult::new(NAME)
            .with_throughput((seq_write.rate + seq_read.rate) / 2.0, "MB/s")
            .with_latency(sequential.summary(), "ms")
            .with_metric("sequential_write_mbps", seq_write.rate)
            .with_metric("sequential_read_mbps", seq_read.rate)
            .with_metric("random_write_iops", rand_write.rate)
            .with_metric("random_read_iops", rand_read.rate)
            .with_metric("random_write_latency_ms", rand_write.latencies.average())
            .with_metric("random_read_latency_ms", rand_read.latencies.average())
            .with_metric("test_file_size_mb", self.file_bytes as f64 / MIB as f64)
            .with_metric("likely_disk_type", likely_disk_type(rand_read.rate));

        // Removing the scratch file is part of the run; report a failure to do so
        scratch.close().context("Failed to remove test file")?;
        Ok(result)
    }
}

/// 1 for a likely SSD, 0 for a likely spinning disk
pub fn likely_disk_type(random_read_iops: f64) -> f64 {
    if random_read_iops > SSD_READ_IOPS {
        1.0
    } else {
        0.0
    }
}

#[cfg(unix)]
fn available_space(dir: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Option<u64> {
    None
}

fn rate(amount: f64, timer: &Timer) -> f64 {
    let secs = timer.elapsed_s();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}

fn sequential_write(file: &mut File, size: u64) -> Result<PhaseOutcome> {
    let block = vec![b'X'; BLOCK_BYTES];
    let mut latencies = LatencyStats::with_capacity((size / BLOCK_BYTES as u64 + 1) as usize);
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;

    let overall = Timer::new();
    let mut written = 0u64;
    while written < size {
        let len = (size - written).min(BLOCK_BYTES as u64) as usize;
        let op = Timer::new();
        file.write_all(&block[..len]).context("Write operation failed")?;
        latencies.add_sample(op.elapsed_ms());
        written += len as u64;
    }
    file.flush()?;

    Ok(PhaseOutcome {
        rate: rate(written as f64 / MIB as f64, &overall),
        latencies,
    })
}

fn sequential_read(file: &mut File, size: u64) -> Result<PhaseOutcome> {
    let mut block = vec![0u8; BLOCK_BYTES];
    let mut latencies = LatencyStats::with_capacity((size / BLOCK_BYTES as u64 + 1) as usize);
    file.seek(SeekFrom::Start(0))?;

    let overall = Timer::new();
    let mut read = 0u64;
    while read < size {
        let op = Timer::new();
        let n = file.read(&mut block).context("Read operation failed")?;
        latencies.add_sample(op.elapsed_ms());
        if n == 0 {
            break;
        }
        read += n as u64;
    }

    Ok(PhaseOutcome {
        rate: rate(read as f64 / MIB as f64, &overall),
        latencies,
    })
}

fn random_offsets(size: u64, ops: usize) -> Vec<u64> {
    let max_page = (size / PAGE_BYTES as u64).saturating_sub(1);
    let mut rng = StdRng::seed_from_u64(42);
    (0..ops)
        .map(|_| rng.gen_range(0..=max_page) * PAGE_BYTES as u64)
        .collect()
}

/// 4 KiB writes at random page offsets, each synced to the device
fn random_write(scratch: &NamedTempFile, size: u64, ops: usize) -> Result<PhaseOutcome> {
    let file = scratch.as_file();
    file.set_len(size).context("Failed to set file size")?;
    let page = vec![b'R'; PAGE_BYTES];
    let mut latencies = LatencyStats::with_capacity(ops);

    let overall = Timer::new();
    for offset in random_offsets(size, ops) {
        let op = Timer::new();
        write_page_at(file, &page, offset)?;
        file.sync_data().context("Failed to sync random write")?;
        latencies.add_sample(op.elapsed_ms());
    }

    Ok(PhaseOutcome {
        rate: rate(ops as f64, &overall),
        latencies,
    })
}

fn random_read(scratch: &NamedTempFile, size: u64, ops: usize) -> Result<PhaseOutcome> {
    let file = scratch.as_file();
    let mut page = vec![0u8; PAGE_BYTES];
    let mut latencies = LatencyStats::with_capacity(ops);

    let overall = Timer::new();
    for offset in random_offsets(size, ops) {
        let op = Timer::new();
        read_page_at(file, &mut page, offset)?;
        latencies.add_sample(op.elapsed_ms());
    }

    Ok(PhaseOutcome {
        rate: rate(ops as f64, &overall),
        latencies,
    })
}

#[cfg(unix)]
fn write_page_at(file: &File, page: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(page, offset)
        .with_context(|| format!("Random write at offset {} failed", offset))
}

#[cfg(unix)]
fn read_page_at(file: &File, page: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(page, offset)
        .with_context(|| format!("Random read at offset {} failed", offset))
}

#[cfg(not(unix))]
fn write_page_at(mut file: &File, page: &[u8], offset: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(page)
        .with_context(|| format!("Random write at offset {} failed", offset))
}

#[cfg(not(unix))]
fn read_page_at(mut file: &File, page: &mut [u8], offset: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(page)
        .with_context(|| format!("Random read at offset {} failed", offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_offsets_are_page_aligned_and_in_bounds() {
        let size = 64 * PAGE_BYTES as u64;
        for offset in random_offsets(size, 500) {
            assert_eq!(offset % PAGE_BYTES as u64, 0);
            assert!(offset + PAGE_BYTES as u64 <= size);
        }
    }

    #[test]
    fn test_disk_type_threshold() {
        assert_eq!(likely_disk_type(5000.0), 0.0);
        assert_eq!(likely_disk_type(5000.1), 1.0);
        assert_eq!(likely_disk_type(120.0), 0.0);
    }

    #[test]
    fn test_sequential_phases_cover_file() {
        let mut scratch = NamedTempFile::new().unwrap();
        let size = 3 * BLOCK_BYTES as u64 / 2;
        let write = sequential_write(scratch.as_file_mut(), size).unwrap();
        assert_eq!(write.latencies.count(), 2);
        assert_eq!(scratch.as_file().metadata().unwrap().len(), size);

        let read = sequential_read(scratch.as_file_mut(), size).unwrap();
        assert_eq!(read.latencies.count(), 2);
        assert!(read.rate > 0.0);
    }

    #[test]
    fn test_small_run_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let module = DiskBenchmark::new()
            .with_file_size(8 * MIB)
            .with_random_ops(20)
            .in_dir(dir.path());
        let result = module.execute(1, 1, false).unwrap();

        assert_eq!(result.throughput_unit, "MB/s");
        assert_eq!(result.latency_unit, "ms");
        assert_eq!(result.extra_metrics["test_file_size_mb"], 8.0);
        assert!(result.extra_metrics["random_read_iops"] > 0.0);
        assert!(result.extra_metrics["random_write_latency_ms"] >= 0.0);
        // The scratch file is gone once the run returns
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let module = DiskBenchmark::new()
            .with_file_size(MIB)
            .in_dir(dir.path().join("absent"));
        assert!(module.execute(1, 1, false).is_err());
    }
}
