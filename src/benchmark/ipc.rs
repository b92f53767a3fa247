//! Shared memory producer/consumer throughput across message sizes

use super::{fraction_of, progress};
use crate::ipc::{run_transfer, TransferOutcome};
use crate::metrics::LatencyStats;
use crate::results::BenchmarkResult;
use crate::utils::format_bytes;
use anyhow::{bail, Context, Result};

pub const NAME: &str = "IPC Shared Memory";

pub const MESSAGE_SIZES: [usize; 4] = [64, 1024, 64 * 1024, 1024 * 1024];

#[derive(Debug, Clone)]
pub struct IpcBenchmark {
    message_sizes: Vec<usize>,
    segment_size: usize,
    sample_capacity: usize,
}

impl Default for IpcBenchmark {
    fn default() -> Self {
        Self {
            message_sizes: MESSAGE_SIZES.to_vec(),
            segment_size: crate::defaults::SHM_SIZE,
            sample_capacity: crate::defaults::IPC_LATENCY_SLOTS,
        }
    }
}

impl IpcBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_sizes(mut self, sizes: &[usize]) -> Self {
        self.message_sizes = sizes.to_vec();
        self
    }

    pub(crate) fn execute(&self, duration_seconds: u32, iterations: u32, verbose: bool) -> Result<BenchmarkResult> {
        if self.message_sizes.is_empty() {
            bail!("No message sizes configured");
        }
        let size_count = self.message_sizes.len() as u32;
        let runs = (iterations / size_count).max(1);
        let window = fraction_of(duration_seconds, size_count);

        let mut result = BenchmarkResult::new(NAME);
        let mut combined = LatencyStats::new();
        let mut throughputs = Vec::with_capacity(self.message_sizes.len());
        let mut corrupted = 0u64;

        for &size in &self.message_sizes {
            progress!(
                verbose,
                "Testing {} messages ({} runs of {:?})",
                format_bytes(size),
                runs,
                window
            );
            let mut total = 0.0;
            for run in 0..runs {
                let outcome = run_transfer(size, window, self.segment_size, self.sample_capacity)
                    .with_context(|| format!("IPC transfer of {} byte messages failed", size))?;
                check_delivery(&outcome)?;
                progress!(
                    verbose,
                    "Run {}: {} messages, {:.2} MB/s",
                    run + 1,
                    outcome.messages_consumed,
                    outcome.throughput_mb_s()
                );
                total += outcome.throughput_mb_s();
                corrupted += outcome.messages_corrupt;
                combined.merge(&outcome.latencies);
            }
            let average = total / runs as f64;
            throughputs.push(average);
            result = result.with_metric(format!("throughput_{}b_mbps", size), average);
        }

        let mean = throughputs.iter().sum::<f64>() / throughputs.len() as f64;
        let max = throughputs.iter().copied().fold(f64::MIN, f64::max);
        let min = throughputs.iter().copied().fold(f64::MAX, f64::min);

        Ok(result
            .with_throughput(mean, "MB/s")
            .with_latency(combined.summary(), "ms")
            .with_metric("max_throughput_mbps", max)
            .with_metric("min_throughput_mbps", min)
            .with_metric("message_sizes_tested", self.message_sizes.len() as f64)
            .with_metric("shared_memory_size_mb", self.segment_size as f64 / (1024.0 * 1024.0))
            .with_metric("latency_samples_collected", combined.count() as f64)
            .with_metric("messages_corrupted", corrupted as f64))
    }
}

/// Every published message must have been consumed exactly once
fn check_delivery(outcome: &TransferOutcome) -> Result<()> {
    if outcome.messages_consumed != outcome.messages_sent {
        bail!(
            "Consumer saw {} of {} messages of {} bytes",
            outcome.messages_consumed,
            outcome.messages_sent,
            outcome.message_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ChannelNames;
    use std::time::Duration;

    fn outcome(sent: u64, consumed: u64) -> TransferOutcome {
        TransferOutcome {
            message_size: 64,
            messages_sent: sent,
            messages_consumed: consumed,
            messages_corrupt: 0,
            bytes_transferred: sent * 64,
            elapsed: Duration::from_secs(1),
            latencies: LatencyStats::new(),
            latency_samples_recorded: consumed,
            names: ChannelNames {
                shared_memory: "/pf_shm_test".into(),
                producer_semaphore: "/pf_prod_test".into(),
                consumer_semaphore: "/pf_cons_test".into(),
            },
        }
    }

    #[test]
    fn test_delivery_check() {
        assert!(check_delivery(&outcome(10, 10)).is_ok());
        assert!(check_delivery(&outcome(10, 9)).is_err());
    }

    #[test]
    fn test_small_run_reports_per_size_metrics() {
        let module = IpcBenchmark::new().with_message_sizes(&[64, 4096]);
        let result = module.execute(1, 2, false).unwrap();
        assert_eq!(result.throughput_unit, "MB/s");
        assert_eq!(result.latency_unit, "ms");
        assert!(result.extra_metrics.contains_key("throughput_64b_mbps"));
        assert!(result.extra_metrics.contains_key("throughput_4096b_mbps"));
        assert_eq!(result.extra_metrics["message_sizes_tested"], 2.0);
        assert_eq!(result.extra_metrics["messages_corrupted"], 0.0);
        assert!(result.extra_metrics["max_throughput_mbps"] >= result.extra_metrics["min_throughput_mbps"]);
    }

    #[test]
    fn test_empty_size_list_is_an_error() {
        assert!(IpcBenchmark::new().with_message_sizes(&[]).execute(1, 1, false).is_err());
    }
}
