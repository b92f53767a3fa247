//! # Performance Context
//!
//! Wraps a module run with system monitoring so the result can be judged
//! against what else the host was doing. A contextual run is:
//!
//! 1. a light CPU warmup to settle frequency scaling
//! 2. monitoring and (optionally) hardware counters around the module run
//! 3. a cooldown pause
//! 4. a reliability score plus warnings and suggestions derived from the
//!    averaged resource metrics and the interference report
//!
//! The score starts at 100 and loses fixed penalties for each kind of
//! interference, for thin monitoring data and for high load. A failed run
//! always scores 0.

use crate::benchmark::BenchmarkModule;
use crate::monitor::resource::serialize_as_record;
use crate::monitor::{InterferenceReport, ResourceMetrics, SystemMonitor};
use crate::perf::{attach_to_result, CounterRequest, PerfCounterSet};
use crate::results::BenchmarkResult;
use anyhow::Result;
use serde::{Serialize, Serializer};
use std::hint::black_box;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reliability below which two runs are not compared
pub const MIN_COMPARABLE_RELIABILITY: f64 = 50.0;

/// A module result together with the conditions it was measured under
#[derive(Debug, Clone)]
pub struct ContextualBenchmarkResult {
    pub benchmark_result: BenchmarkResult,
    pub resource_metrics_avg: ResourceMetrics,
    pub resource_metrics_peak: ResourceMetrics,
    pub interference: InterferenceReport,
    /// 0 to 100; how far the result can be trusted
    pub reliability_score: f64,
    pub context_warnings: Vec<String>,
    pub optimization_suggestions: Vec<String>,
}

#[derive(Serialize)]
struct ContextRecord<'a> {
    benchmark_result: &'a BenchmarkResult,
    #[serde(serialize_with = "metrics_record")]
    resource_metrics_avg: &'a ResourceMetrics,
    #[serde(serialize_with = "metrics_record")]
    resource_metrics_peak: &'a ResourceMetrics,
    reliability_score: f64,
    interference_detected: bool,
    interference_summary: String,
    context_warnings: &'a [String],
    optimization_suggestions: &'a [String],
}

fn metrics_record<S: Serializer>(metrics: &&ResourceMetrics, serializer: S) -> Result<S::Ok, S::Error> {
    serialize_as_record(metrics, serializer)
}

impl Serialize for ContextualBenchmarkResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ContextRecord {
            benchmark_result: &self.benchmark_result,
            resource_metrics_avg: &self.resource_metrics_avg,
            resource_metrics_peak: &self.resource_metrics_peak,
            reliability_score: self.reliability_score,
            interference_detected: self.interference.has_interference(),
            interference_summary: self.interference.summary(),
            context_warnings: &self.context_warnings,
            optimization_suggestions: &self.optimization_suggestions,
        }
        .serialize(serializer)
    }
}

impl ContextualBenchmarkResult {
    /// Judge `result` against the metrics it was measured under
    pub fn analyze(
        result: BenchmarkResult,
        avg: ResourceMetrics,
        peak: ResourceMetrics,
        interference: InterferenceReport,
        cores: usize,
    ) -> Self {
        let reliability_score = calculate_reliability_score(&result, &avg, &interference, cores);
        let context_warnings = context_warnings(&result, &avg, &interference);
        let optimization_suggestions = optimization_suggestions(&result, &avg, cores);
        Self {
            benchmark_result: result,
            resource_metrics_avg: avg,
            resource_metrics_peak: peak,
            interference,
            reliability_score,
            context_warnings,
            optimization_suggestions,
        }
    }
}

/// Score from 0 to 100 for how trustworthy a measurement is
pub fn calculate_reliability_score(
    result: &BenchmarkResult,
    metrics: &ResourceMetrics,
    interference: &InterferenceReport,
    cores: usize,
) -> f64 {
    if !result.is_success() {
        return 0.0;
    }

    let penalties = [
        (interference.high_background_cpu_usage, 20.0),
        (interference.memory_pressure, 15.0),
        (interference.high_io_wait, 25.0),
        (interference.thermal_throttling, 30.0),
        (interference.network_congestion, 10.0),
        (metrics.sample_count < 10, 10.0),
        (metrics.monitoring_duration_seconds < 3.0, 15.0),
        (metrics.load_average_1min > cores as f64 * 0.8, 10.0),
    ];
    let score: f64 = penalties
        .iter()
        .filter(|(applies, _)| *applies)
        .fold(100.0, |score, (_, penalty)| score - penalty);
    score.clamp(0.0, 100.0)
}

pub fn context_warnings(
    result: &BenchmarkResult,
    metrics: &ResourceMetrics,
    interference: &InterferenceReport,
) -> Vec<String> {
    let mut warnings = Vec::new();
    if !result.is_success() {
        warnings.push("Benchmark failed to complete successfully".to_string());
    }
    if interference.has_interference() {
        warnings.push("System interference detected during benchmark".to_string());
    }
    if metrics.monitoring_duration_seconds < 5.0 {
        warnings.push("Short benchmark duration - results may be less reliable".to_string());
    }
    if metrics.thermal_throttling_detected {
        warnings.push("CPU thermal throttling detected - performance limited by temperature".to_string());
    }
    if metrics.memory_usage_percent > 90.0 {
        warnings.push("High memory usage - potential memory pressure affecting performance".to_string());
    }
    if metrics.avg_io_wait_percent > 20.0 {
        warnings.push("High I/O wait time - storage bottleneck detected".to_string());
    }
    warnings
}

pub fn optimization_suggestions(result: &BenchmarkResult, metrics: &ResourceMetrics, cores: usize) -> Vec<String> {
    let mut suggestions = Vec::new();
    if metrics.memory_usage_percent > 80.0 {
        suggestions.push("Close unnecessary applications to free memory".to_string());
    }
    if metrics.load_average_1min > cores as f64 * 0.5 {
        suggestions.push("Reduce background system load for more accurate benchmarks".to_string());
    }
    if result.name.contains("CPU") {
        suggestions.push("Pin benchmark threads to specific CPU cores for consistent results".to_string());
    }
    if result.name.contains("Disk") && metrics.avg_io_wait_percent > 10.0 {
        suggestions.push("Ensure disk benchmarks run on dedicated storage to avoid interference".to_string());
    }
    suggestions
}

/// Two runs can be compared when both are reliable and they saw the same
/// kind of environment
pub fn results_comparable(a: &ContextualBenchmarkResult, b: &ContextualBenchmarkResult) -> bool {
    if a.reliability_score < MIN_COMPARABLE_RELIABILITY || b.reliability_score < MIN_COMPARABLE_RELIABILITY {
        return false;
    }
    a.interference.has_interference() == b.interference.has_interference()
}

pub fn interpret_throughput(throughput: f64, unit: &str) -> String {
    let verdict = if unit.contains("MB/s") {
        Some(if throughput > 10_000.0 {
            "Excellent - High-end NVMe SSD performance"
        } else if throughput > 1000.0 {
            "Good - SSD performance"
        } else if throughput > 100.0 {
            "Fair - Standard disk performance"
        } else {
            "Poor - Consider storage upgrade"
        })
    } else if unit.contains("GOPS") {
        Some(if throughput > 10.0 {
            "Excellent - High-performance CPU"
        } else if throughput > 5.0 {
            "Good - Modern CPU performance"
        } else if throughput > 1.0 {
            "Fair - Standard performance"
        } else {
            "Poor - Low-end or throttled CPU"
        })
    } else {
        None
    };
    with_verdict(throughput, unit, verdict)
}

pub fn interpret_latency(latency: f64, unit: &str) -> String {
    let excellent = if unit.contains("us") {
        Some("Excellent - Sub-microsecond latency")
    } else if unit.contains("ms") {
        Some("Excellent - Sub-millisecond latency")
    } else {
        None
    };
    let verdict = excellent.map(|excellent| {
        if latency < 1.0 {
            excellent
        } else if latency < 10.0 {
            "Good - Low latency"
        } else if latency < 100.0 {
            "Fair - Acceptable latency"
        } else {
            "Poor - High latency detected"
        }
    });
    with_verdict(latency, unit, verdict)
}

fn with_verdict(value: f64, unit: &str, verdict: Option<&str>) -> String {
    match verdict {
        Some(verdict) => format!("{} {} ({})", value, unit, verdict),
        None => format!("{} {}", value, unit),
    }
}

pub fn interpret_reliability_score(score: f64) -> &'static str {
    if score >= 90.0 {
        "Excellent - Results highly reliable"
    } else if score >= 75.0 {
        "Good - Results reliable with minor caveats"
    } else if score >= 60.0 {
        "Fair - Results usable but consider optimization"
    } else if score >= 40.0 {
        "Poor - Results unreliable, significant interference"
    } else {
        "Very Poor - Results invalid due to system issues"
    }
}

/// Runs modules under monitoring and scores the outcome
pub struct PerformanceContextAnalyzer {
    monitor: SystemMonitor,
    warmup: Duration,
    cooldown: Duration,
    cores: usize,
}

impl Default for PerformanceContextAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceContextAnalyzer {
    pub fn new() -> Self {
        Self::with_monitor(SystemMonitor::new())
    }

    pub fn with_monitor(monitor: SystemMonitor) -> Self {
        Self {
            monitor,
            warmup: crate::defaults::WARMUP,
            cooldown: crate::defaults::COOLDOWN,
            cores: crate::affinity::num_cores(),
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Monitor of the most recent run, for telemetry export
    pub fn monitor(&self) -> &SystemMonitor {
        &self.monitor
    }

    /// Run `module` with monitoring and optional hardware counters
    ///
    /// Never fails: a module error becomes an error result scored 0, and a
    /// monitor that cannot start leaves the run with empty metrics.
    pub fn run_with_context(
        &mut self,
        module: &BenchmarkModule,
        duration_seconds: u32,
        iterations: u32,
        verbose: bool,
        collect_perf_counters: bool,
    ) -> ContextualBenchmarkResult {
        debug!("Warming up for {:?} before {}", self.warmup, module.name());
        warmup_system(self.warmup);

        if let Err(e) = self.monitor.start_monitoring() {
            warn!("System monitoring unavailable for {}: {:#}", module.name(), e);
        }

        let mut counters = PerfCounterSet::new();
        let request = if collect_perf_counters {
            let started = match counters.start() {
                Ok(opened) => {
                    debug!("Opened {} hardware counters", opened);
                    true
                }
                Err(e) => {
                    debug!("Hardware counters unavailable: {}", e);
                    false
                }
            };
            CounterRequest::Requested { started }
        } else {
            CounterRequest::Disabled
        };

        if verbose {
            info!("Running benchmark: {}", module.name());
        }
        let mut result = module.run(duration_seconds, iterations, verbose);

        let sample = counters.stop();
        attach_to_result(&mut result, &sample, request);
        self.monitor.stop_monitoring();
        result.add_build_metadata();

        let avg = self.monitor.average_metrics();
        let peak = self.monitor.peak_metrics();
        let interference = self.monitor.analyze_interference();

        debug!("Cooling down for {:?}", self.cooldown);
        thread::sleep(self.cooldown);

        let contextual = ContextualBenchmarkResult::analyze(result, avg, peak, interference, self.cores);
        debug!(
            "{} reliability {:.0}/100 with {} warnings",
            contextual.benchmark_result.name,
            contextual.reliability_score,
            contextual.context_warnings.len()
        );
        contextual
    }

    /// Averaged metrics of an otherwise idle sampling window
    pub fn system_baseline(&mut self, duration: Duration) -> Result<ResourceMetrics> {
        self.monitor.start_monitoring()?;
        thread::sleep(duration);
        self.monitor.stop_monitoring();
        Ok(self.monitor.average_metrics())
    }
}

/// Light spinning interleaved with short sleeps to settle CPU frequency
pub fn warmup_system(duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut acc = 0u64;
    while Instant::now() < deadline {
        for i in 0..1000u64 {
            acc = black_box(acc.wrapping_add(i));
        }
        thread::sleep(Duration::from_micros(100));
    }
    black_box(acc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::CpuBenchmark;
    use crate::metrics::LatencySummary;
    use crate::monitor::procfs::ProcFs;

    fn steady_metrics() -> ResourceMetrics {
        ResourceMetrics {
            sample_count: 40,
            monitoring_duration_seconds: 10.0,
            memory_usage_percent: 30.0,
            load_average_1min: 0.1,
            ..Default::default()
        }
    }

    fn success() -> BenchmarkResult {
        BenchmarkResult::new("Memory").with_latency(
            LatencySummary {
                avg: 1.0,
                min: 1.0,
                max: 1.0,
                p50: 1.0,
                p90: 1.0,
                p99: 1.0,
            },
            "us",
        )
    }

    #[test]
    fn test_clean_run_scores_full_marks() {
        let score = calculate_reliability_score(&success(), &steady_metrics(), &InterferenceReport::default(), 4);
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_failed_run_scores_zero() {
        let failed = BenchmarkResult::from_error("Memory", "boom");
        let score = calculate_reliability_score(&failed, &steady_metrics(), &InterferenceReport::default(), 4);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_penalties_accumulate() {
        let interference = InterferenceReport {
            high_background_cpu_usage: true,
            high_io_wait: true,
            ..Default::default()
        };
        let score = calculate_reliability_score(&success(), &steady_metrics(), &interference, 4);
        assert_eq!(score, 55.0);

        let thin = ResourceMetrics {
            sample_count: 3,
            monitoring_duration_seconds: 1.0,
            load_average_1min: 4.0,
            ..Default::default()
        };
        let score = calculate_reliability_score(&success(), &thin, &InterferenceReport::default(), 4);
        assert_eq!(score, 65.0);
    }

    #[test]
    fn test_score_never_negative() {
        let interference = InterferenceReport {
            high_background_cpu_usage: true,
            memory_pressure: true,
            high_io_wait: true,
            network_congestion: true,
            thermal_throttling: true,
            performance_warnings: Vec::new(),
        };
        let score = calculate_reliability_score(&success(), &ResourceMetrics::default(), &interference, 1);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_warnings_follow_metrics() {
        let metrics = ResourceMetrics {
            monitoring_duration_seconds: 2.0,
            thermal_throttling_detected: true,
            memory_usage_percent: 95.0,
            avg_io_wait_percent: 25.0,
            ..Default::default()
        };
        let warnings = context_warnings(&success(), &metrics, &InterferenceReport::default());
        assert_eq!(warnings.len(), 4);
        assert!(warnings[0].starts_with("Short benchmark duration"));
        assert!(context_warnings(&success(), &steady_metrics(), &InterferenceReport::default()).is_empty());
    }

    #[test]
    fn test_suggestions_depend_on_module() {
        let cpu = BenchmarkResult::new("CPU");
        let suggestions = optimization_suggestions(&cpu, &steady_metrics(), 4);
        assert_eq!(
            suggestions,
            vec!["Pin benchmark threads to specific CPU cores for consistent results".to_string()]
        );

        let disk = BenchmarkResult::new("Disk I/O");
        let busy_disk = ResourceMetrics {
            avg_io_wait_percent: 15.0,
            ..steady_metrics()
        };
        assert_eq!(optimization_suggestions(&disk, &busy_disk, 4).len(), 1);
        assert!(optimization_suggestions(&disk, &steady_metrics(), 4).is_empty());
    }

    #[test]
    fn test_comparability() {
        let clean = ContextualBenchmarkResult::analyze(
            success(),
            steady_metrics(),
            steady_metrics(),
            InterferenceReport::default(),
            4,
        );
        let mut noisy = clean.clone();
        noisy.interference.memory_pressure = true;
        assert!(results_comparable(&clean, &clean.clone()));
        assert!(!results_comparable(&clean, &noisy));

        let mut unreliable = clean.clone();
        unreliable.reliability_score = 30.0;
        assert!(!results_comparable(&clean, &unreliable));
    }

    #[test]
    fn test_interpretations() {
        assert_eq!(interpret_reliability_score(95.0), "Excellent - Results highly reliable");
        assert_eq!(interpret_reliability_score(40.0), "Poor - Results unreliable, significant interference");
        assert_eq!(interpret_reliability_score(10.0), "Very Poor - Results invalid due to system issues");
        assert_eq!(interpret_throughput(2.5, "GOPS"), "2.5 GOPS (Fair - Standard performance)");
        assert_eq!(interpret_throughput(42.0, "ops/sec"), "42 ops/sec");
        assert_eq!(interpret_latency(0.5, "ms"), "0.5 ms (Excellent - Sub-millisecond latency)");
        assert_eq!(interpret_latency(50.0, "us"), "50 us (Fair - Acceptable latency)");
    }

    #[test]
    fn test_serialized_context_carries_interference_summary() {
        let contextual = ContextualBenchmarkResult::analyze(
            success(),
            steady_metrics(),
            steady_metrics(),
            InterferenceReport::default(),
            4,
        );
        let value = serde_json::to_value(&contextual).unwrap();
        assert_eq!(value["reliability_score"], 100.0);
        assert_eq!(value["interference_detected"], false);
        assert_eq!(value["interference_summary"], "No significant system interference detected");
        assert!(value["resource_metrics_avg"].get("cpu_usage_percent").is_some());
    }

    #[test]
    fn test_run_with_context_annotates_result() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = SystemMonitor::with_procfs(ProcFs::new(dir.path(), dir.path()), Duration::from_millis(50));
        let mut analyzer = PerformanceContextAnalyzer::with_monitor(monitor)
            .with_warmup(Duration::ZERO)
            .with_cooldown(Duration::ZERO);
        let module = BenchmarkModule::Cpu(CpuBenchmark::new().with_threads(1));

        let contextual = analyzer.run_with_context(&module, 1, 1, false, false);
        let result = &contextual.benchmark_result;
        assert!(result.is_success());
        assert_eq!(result.extra_info["perf.counters"], "disabled");
        assert!(result.extra_info.contains_key("build.version"));
        // No readable /proc: no samples, so the thin-data penalties apply
        assert_eq!(contextual.resource_metrics_avg.sample_count, 0);
        assert_eq!(contextual.reliability_score, 75.0);
    }
}
