use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Monotonic stopwatch
///
/// `start()` records the reference instant; every `elapsed_*` accessor is a
/// pure read and may be called any number of times.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started_at: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Create a timer that is already running
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    /// Restart the timer from now
    pub fn start(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_ns(&self) -> f64 {
        self.elapsed().as_nanos() as f64
    }

    pub fn elapsed_us(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1_000_000.0
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1_000.0
    }

    pub fn elapsed_s(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

/// Six-number summary of a latency distribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Unordered collection of latency samples
///
/// Samples are kept exactly; order statistics are computed on a sorted copy
/// so the collector itself is never reordered. The unit is whatever the
/// producing module records (ns, us or ms) and is reported alongside the
/// result, never stored here.
///
/// A `LatencyStats` is not meant to be shared between threads. Give each
/// worker its own instance and `merge` them once the workers are joined.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: Vec<f64>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn from_samples(samples: Vec<f64>) -> Self {
        Self { samples }
    }

    pub fn add_sample(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Append every sample of `other`
    pub fn merge(&mut self, other: &LatencyStats) {
        self.samples.extend_from_slice(&other.samples);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Order-statistic percentile
    ///
    /// Index is `floor(p / 100 * n)` clamped to `n - 1`; `p` outside
    /// `[0, 100]` is clamped first. Returns 0 for an empty set.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self::percentile_of_sorted(&sorted, p)
    }

    fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
        let n = sorted.len();
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
        let index = ((p / 100.0) * n as f64).floor() as usize;
        sorted[index.min(n - 1)]
    }

    /// Compute all six statistics with a single sort
    pub fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        LatencySummary {
            avg: self.average(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: Self::percentile_of_sorted(&sorted, 50.0),
            p90: Self::percentile_of_sorted(&sorted, 90.0),
            p99: Self::percentile_of_sorted(&sorted, 99.0),
        }
    }
}

/// Outcome of one adaptive throughput measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveOutcome {
    /// Iterations completed in the final, accepted timing pass
    pub iterations: u64,
    pub elapsed: Duration,
    pub bytes_processed: u64,
    pub throughput_mb_s: f64,
    /// True when the measured rate exceeded the sanity ceiling
    pub clamped: bool,
}

/// Geometric back-off throughput measurement
///
/// Runs the workload with a caller-chosen iteration count and, while the
/// timed pass is shorter than `min_duration` and the count is still below
/// `max_iterations`, grows the count by `growth_factor` and times it again.
/// Throughput is always derived from the iteration count of the accepted
/// pass.
///
/// The `throughput_ceiling_mb_s` clamp is an approximation that hides clock
/// resolution artifacts on very fast passes. It is not a physical limit and
/// results that hit it are flagged through [`AdaptiveOutcome::clamped`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveMeasurement {
    pub min_duration: Duration,
    pub growth_factor: u64,
    pub max_iterations: u64,
    pub throughput_ceiling_mb_s: f64,
}

impl Default for AdaptiveMeasurement {
    fn default() -> Self {
        Self {
            min_duration: crate::defaults::MIN_MEASURABLE_DURATION,
            growth_factor: 10,
            max_iterations: 1000,
            throughput_ceiling_mb_s: crate::defaults::THROUGHPUT_CEILING_MB_S,
        }
    }
}

impl AdaptiveMeasurement {
    /// Time `workload(iterations)` until the pass is long enough to trust
    pub fn measure<F>(&self, initial_iterations: u64, bytes_per_iteration: u64, mut workload: F) -> AdaptiveOutcome
    where
        F: FnMut(u64),
    {
        let mut iterations = initial_iterations.max(1);
        let growth = self.growth_factor.max(2);

        let elapsed = loop {
            let timer = Timer::new();
            workload(iterations);
            let elapsed = timer.elapsed();

            if elapsed < self.min_duration && iterations < self.max_iterations {
                iterations = iterations.saturating_mul(growth).min(self.max_iterations);
                continue;
            }
            break elapsed;
        };

        let bytes_processed = bytes_per_iteration.saturating_mul(iterations);
        let seconds = elapsed.as_secs_f64();
        let raw = if seconds > 0.0 {
            bytes_processed as f64 / (1024.0 * 1024.0) / seconds
        } else {
            f64::INFINITY
        };
        let clamped = raw > self.throughput_ceiling_mb_s;

        AdaptiveOutcome {
            iterations,
            elapsed,
            bytes_processed,
            throughput_mb_s: raw.min(self.throughput_ceiling_mb_s),
            clamped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_of(values: &[f64]) -> LatencyStats {
        let mut stats = LatencyStats::new();
        for v in values {
            stats.add_sample(*v);
        }
        stats
    }

    #[test]
    fn test_empty_stats_are_zero() {
        let stats = LatencyStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.average(), 0.0);
        assert_eq!(stats.min(), 0.0);
        assert_eq!(stats.max(), 0.0);
        assert_eq!(stats.percentile(50.0), 0.0);
        assert_eq!(stats.percentile(99.0), 0.0);
        assert_eq!(stats.summary(), LatencySummary::default());
    }

    #[test]
    fn test_percentile_indexing() {
        let stats = stats_of(&[5.0, 1.0, 4.0, 2.0, 3.0, 10.0, 9.0, 8.0, 7.0, 6.0]);
        // floor(0.5 * 10) = 5 -> sixth smallest
        assert_eq!(stats.percentile(50.0), 6.0);
        assert_eq!(stats.percentile(90.0), 10.0);
        assert_eq!(stats.percentile(0.0), 1.0);
        // index 10 is clamped to 9
        assert_eq!(stats.percentile(100.0), 10.0);
    }

    #[test]
    fn test_percentiles_bounded_and_monotonic() {
        let stats = stats_of(&[0.7, 13.0, 2.5, 2.5, 99.1, 0.01, 42.0, 8.0, 8.0, 3.3, 17.5]);
        let mut previous = f64::MIN;
        for p in 0..=100 {
            let value = stats.percentile(p as f64);
            assert!(value >= stats.min());
            assert!(value <= stats.max());
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn test_percentile_does_not_reorder_samples() {
        let stats = stats_of(&[3.0, 1.0, 2.0]);
        let _ = stats.percentile(50.0);
        assert_eq!(stats.samples(), &[3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_merge_and_clear() {
        let mut a = stats_of(&[1.0, 2.0]);
        let b = stats_of(&[3.0]);
        a.merge(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.max(), 3.0);
        assert!((a.average() - 2.0).abs() < 1e-9);

        a.clear();
        assert!(a.is_empty());
    }

    #[test]
    fn test_summary_matches_individual_queries() {
        let stats = stats_of(&[4.0, 8.0, 15.0, 16.0, 23.0, 42.0]);
        let summary = stats.summary();
        assert_eq!(summary.min, stats.min());
        assert_eq!(summary.max, stats.max());
        assert_eq!(summary.p50, stats.percentile(50.0));
        assert_eq!(summary.p90, stats.percentile(90.0));
        assert_eq!(summary.p99, stats.percentile(99.0));
        assert!((summary.avg - stats.average()).abs() < 1e-9);
    }

    #[test]
    fn test_timer_is_idempotent_and_monotonic() {
        let timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        let first = timer.elapsed_ms();
        let second = timer.elapsed_ms();
        assert!(first >= 2.0);
        assert!(second >= first);
        assert!(timer.elapsed_ns() >= timer.elapsed_us());
    }

    #[test]
    fn test_adaptive_grows_fast_workload_to_ceiling() {
        let adaptive = AdaptiveMeasurement::default();
        let mut passes = Vec::new();
        let outcome = adaptive.measure(1, 64, |iterations| passes.push(iterations));

        // An empty workload never reaches 1 ms, so it grows to the ceiling.
        assert_eq!(outcome.iterations, 1000);
        assert_eq!(passes, vec![1, 10, 100, 1000]);
        assert_eq!(outcome.bytes_processed, 64 * 1000);
    }

    #[test]
    fn test_adaptive_stops_once_threshold_met() {
        let adaptive = AdaptiveMeasurement::default();
        let outcome = adaptive.measure(1, 1024, |iterations| {
            std::thread::sleep(Duration::from_micros(200) * iterations as u32);
        });

        // 1 iteration sleeps 0.2 ms, 10 iterations sleep 2 ms.
        assert_eq!(outcome.iterations, 10);
        assert!(outcome.elapsed >= adaptive.min_duration);
        assert_eq!(outcome.bytes_processed, 10 * 1024);
        let expected = outcome.bytes_processed as f64 / (1024.0 * 1024.0) / outcome.elapsed.as_secs_f64();
        assert!((outcome.throughput_mb_s - expected).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_never_exceeds_ceiling_iterations() {
        let adaptive = AdaptiveMeasurement::default();
        let outcome = adaptive.measure(300, 1, |_| {});
        assert_eq!(outcome.iterations, 1000);
    }

    #[test]
    fn test_adaptive_clamps_implausible_rates() {
        let adaptive = AdaptiveMeasurement {
            throughput_ceiling_mb_s: 1.0,
            ..AdaptiveMeasurement::default()
        };
        let outcome = adaptive.measure(1000, 1024 * 1024 * 1024, |_| {});
        assert!(outcome.clamped);
        assert_eq!(outcome.throughput_mb_s, 1.0);
    }
}
