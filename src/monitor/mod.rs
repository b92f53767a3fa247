//! # Background Resource Monitor
//!
//! [`SystemMonitor`] samples system-wide resource usage on a dedicated
//! thread while a benchmark runs, so the result can be judged against the
//! background activity that overlapped it.
//!
//! ## Lifecycle
//!
//! ```text
//! idle --start_monitoring()--> monitoring --stop_monitoring()--> idle
//! ```
//!
//! `start_monitoring` clears earlier samples, takes a baseline counter
//! snapshot, and spawns the sampling thread. Every interval the thread takes
//! one sample; failed samples are logged and skipped. The sampling thread is
//! never synchronized with benchmark workers: callers start monitoring
//! before the phase they want to characterize and stop it afterwards.
//!
//! ## Data Sources
//!
//! All figures come from `/proc` and `/sys` (see [`procfs`]). On hosts
//! without them every sample fails and the reducers return zeroed metrics.

pub mod interference;
pub mod procfs;
pub mod resource;
pub mod sampler;

pub use interference::InterferenceReport;
pub use resource::ResourceMetrics;
pub use sampler::Sampler;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use procfs::ProcFs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Load per core above which the host is considered too busy to benchmark
pub const BUSY_LOAD_PER_CORE: f64 = 0.7;

/// State shared with the sampling thread
struct Shared {
    running: AtomicBool,
    samples: Mutex<Vec<ResourceMetrics>>,
    sampler: Mutex<Sampler>,
}

/// Background sampler of system-wide resource usage
pub struct SystemMonitor {
    shared: Arc<Shared>,
    procfs: ProcFs,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    stopped_after: Option<Duration>,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self::with_procfs(ProcFs::default(), crate::defaults::SAMPLE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self::with_procfs(ProcFs::default(), interval)
    }

    pub fn with_procfs(procfs: ProcFs, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                samples: Mutex::new(Vec::new()),
                sampler: Mutex::new(Sampler::new(procfs.clone())),
            }),
            procfs,
            interval,
            handle: None,
            started_at: None,
            stopped_after: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begin sampling on a background thread
    ///
    /// Does nothing if the monitor is already running.
    pub fn start_monitoring(&mut self) -> Result<()> {
        if self.handle.is_some() {
            debug!("System monitor already running");
            return Ok(());
        }

        self.reset();
        {
            let mut sampler = self.shared.sampler.lock();
            if let Err(e) = sampler.collect() {
                debug!("Baseline resource snapshot unavailable: {}", e);
            }
        }

        self.shared.running.store(true, Ordering::Release);
        self.started_at = Some(Instant::now());
        self.stopped_after = None;

        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let started_at = Instant::now();
        let spawned = std::thread::Builder::new()
            .name("system-monitor".into())
            .spawn(move || sampling_loop(&shared, interval, started_at));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                debug!("System monitor started ({:?} interval)", self.interval);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.started_at = None;
                Err(e).context("Failed to spawn system monitor thread")
            }
        }
    }

    /// Stop sampling and join the thread; no-op when idle
    pub fn stop_monitoring(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            warn!("System monitor thread panicked");
        }
        self.stopped_after = self.started_at.map(|t| t.elapsed());
        debug!("System monitor stopped with {} samples", self.sample_count());
    }

    pub fn is_monitoring(&self) -> bool {
        self.handle.is_some()
    }

    /// Clear samples and the delta baseline
    pub fn reset(&mut self) {
        self.shared.samples.lock().clear();
        self.shared.sampler.lock().reset();
        if self.handle.is_none() {
            self.started_at = None;
            self.stopped_after = None;
        }
    }

    pub fn sample_count(&self) -> usize {
        self.shared.samples.lock().len()
    }

    pub fn all_samples(&self) -> Vec<ResourceMetrics> {
        self.shared.samples.lock().clone()
    }

    /// Monitoring time so far, frozen once stopped
    pub fn monitoring_duration(&self) -> Duration {
        match (self.stopped_after, self.started_at) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    /// Mean of all samples; zeroed when there are none
    pub fn average_metrics(&self) -> ResourceMetrics {
        let samples = self.shared.samples.lock();
        let mut avg = ResourceMetrics::average(&samples);
        if !samples.is_empty() {
            avg.monitoring_duration_seconds = self.monitoring_duration().as_secs_f64();
        }
        avg
    }

    /// Maximum of all samples; zeroed when there are none
    pub fn peak_metrics(&self) -> ResourceMetrics {
        let samples = self.shared.samples.lock();
        let mut peak = ResourceMetrics::peak(&samples);
        if !samples.is_empty() {
            peak.monitoring_duration_seconds = self.monitoring_duration().as_secs_f64();
        }
        peak
    }

    /// One reading from a fresh sampler
    ///
    /// Independent of any monitoring session. Having no baseline, its CPU,
    /// disk and network rates are zero; use [`Self::sample_cpu_usage`] for a
    /// point-in-time CPU figure.
    pub fn collect_current_metrics(&self) -> Result<ResourceMetrics> {
        let mut sampler = Sampler::new(self.procfs.clone());
        let mut metrics = sampler.collect().context("Failed to read resource counters")?;
        metrics.sample_count = 1;
        Ok(metrics)
    }

    /// Aggregate CPU usage over `window`, from two readings
    pub fn sample_cpu_usage(&self, window: Duration) -> Result<f64> {
        let mut sampler = Sampler::new(self.procfs.clone());
        sampler.collect().context("Failed to read /proc/stat")?;
        std::thread::sleep(window);
        Ok(sampler.collect()?.avg_cpu_usage_percent)
    }

    /// Judge the averaged samples against the interference thresholds
    pub fn analyze_interference(&self) -> InterferenceReport {
        let avg = self.average_metrics();
        if avg.sample_count == 0 {
            return InterferenceReport::default();
        }
        InterferenceReport::from_metrics(&avg, crate::affinity::num_cores())
    }

    pub fn performance_recommendations(&self) -> Vec<String> {
        self.analyze_interference().recommendations()
    }

    /// Whether the current 1-minute load is too high for a fair run
    pub fn is_system_busy(&self) -> bool {
        self.procfs
            .read_loadavg()
            .map(|(one, _)| one > crate::affinity::num_cores() as f64 * BUSY_LOAD_PER_CORE)
            .unwrap_or(false)
    }

    /// Dump every sample, as JSON for a `.json` path and CSV otherwise
    pub fn write_samples_to_file(&self, path: &Path) -> Result<()> {
        let samples = self.all_samples();
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create telemetry file {:?}", path))?;

        if is_json {
            serde_json::to_writer_pretty(&mut file, &samples)?;
            writeln!(file)?;
        } else {
            writeln!(file, "{}", ResourceMetrics::CSV_HEADER)?;
            for sample in &samples {
                writeln!(file, "{}", sample.csv_row())?;
            }
        }

        debug!("Wrote {} telemetry samples to {:?}", samples.len(), path);
        Ok(())
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn sampling_loop(shared: &Shared, interval: Duration, started_at: Instant) {
    let mut failures = 0usize;

    loop {
        let deadline = Instant::now() + interval;
        while shared.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::park_timeout(deadline - now);
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let collected = shared.sampler.lock().collect();
        match collected {
            Ok(mut metrics) => {
                metrics.sample_timestamp_seconds = started_at.elapsed().as_secs_f64();
                metrics.sample_count = 1;
                shared.samples.lock().push(metrics);
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!("Failed to collect resource sample: {}", e);
                } else {
                    debug!("Failed to collect resource sample ({} failures): {}", failures, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_monitor(dir: &Path, interval: Duration) -> SystemMonitor {
        let proc_root = dir.join("proc");
        std::fs::create_dir_all(&proc_root).unwrap();
        std::fs::write(proc_root.join("stat"), "cpu 10 0 10 80 0 0 0 0\ncpu0 10 0 10 80 0 0 0 0\n").unwrap();
        std::fs::write(proc_root.join("meminfo"), "MemTotal: 1000 kB\nMemAvailable: 100 kB\n").unwrap();
        std::fs::write(proc_root.join("loadavg"), "0.10 0.20 0.30 1/10 1\n").unwrap();
        SystemMonitor::with_procfs(ProcFs::new(proc_root, dir.join("sys")), interval)
    }

    #[test]
    fn test_idle_monitor_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = fixture_monitor(dir.path(), Duration::from_millis(20));
        assert!(!monitor.is_monitoring());

        let avg = monitor.average_metrics();
        let peak = monitor.peak_metrics();
        assert_eq!(avg, ResourceMetrics::default());
        assert_eq!(peak.sample_count, 0);
        assert!(!monitor.analyze_interference().has_interference());
    }

    #[test]
    fn test_start_stop_cycle_collects_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = fixture_monitor(dir.path(), Duration::from_millis(20));

        monitor.start_monitoring().unwrap();
        assert!(monitor.is_monitoring());
        // Second start is a no-op
        monitor.start_monitoring().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());

        let count = monitor.sample_count();
        assert!(count >= 2, "expected samples, got {}", count);

        let avg = monitor.average_metrics();
        assert_eq!(avg.sample_count, count);
        assert!((avg.memory_usage_percent - 90.0).abs() < 1e-9);
        assert!(avg.monitoring_duration_seconds > 0.0);

        // Static counters mean no CPU ticks elapsed between samples
        assert_eq!(avg.avg_cpu_usage_percent, 0.0);

        // The duration is frozen after stop
        let first = monitor.monitoring_duration();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(first, monitor.monitoring_duration());

        let report = monitor.analyze_interference();
        assert!(report.memory_pressure);

        // Stopping twice is harmless
        monitor.stop_monitoring();
    }

    #[test]
    fn test_reset_clears_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = fixture_monitor(dir.path(), Duration::from_millis(10));
        monitor.start_monitoring().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        monitor.stop_monitoring();
        assert!(monitor.sample_count() > 0);

        monitor.reset();
        assert_eq!(monitor.sample_count(), 0);
        assert_eq!(monitor.monitoring_duration(), Duration::ZERO);
    }

    #[test]
    fn test_stop_is_prompt_with_long_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = fixture_monitor(dir.path(), Duration::from_secs(30));
        monitor.start_monitoring().unwrap();

        let started = Instant::now();
        monitor.stop_monitoring();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(monitor.sample_count(), 0);
    }

    #[test]
    fn test_failed_samples_do_not_stop_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = SystemMonitor::with_procfs(ProcFs::new(dir.path(), dir.path()), Duration::from_millis(10));
        monitor.start_monitoring().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(monitor.is_monitoring());
        monitor.stop_monitoring();
        assert_eq!(monitor.sample_count(), 0);
        assert!(monitor.collect_current_metrics().is_err());
    }

    #[test]
    fn test_collect_current_metrics_is_independent() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = fixture_monitor(dir.path(), Duration::from_millis(10));
        let metrics = monitor.collect_current_metrics().unwrap();
        assert_eq!(metrics.sample_count, 1);
        assert_eq!(metrics.load_average_1min, 0.1);
        assert_eq!(monitor.sample_count(), 0);
    }

    #[test]
    fn test_write_samples_json_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = fixture_monitor(dir.path(), Duration::from_millis(10));
        monitor.start_monitoring().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        monitor.stop_monitoring();
        let count = monitor.sample_count();

        let json_path = dir.path().join("samples.json");
        monitor.write_samples_to_file(&json_path).unwrap();
        let parsed: Vec<ResourceMetrics> =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.len(), count);

        let csv_path = dir.path().join("samples.csv");
        monitor.write_samples_to_file(&csv_path).unwrap();
        let csv = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(csv.lines().count(), count + 1);
        assert!(csv.starts_with("timestamp_seconds,"));
    }
}
