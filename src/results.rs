use crate::context::ContextualBenchmarkResult;
use crate::metrics::LatencySummary;
use crate::monitor::procfs::ProcFs;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of a module run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkStatus {
    Success,
    Error,
}

impl std::fmt::Display for BenchmarkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkStatus::Success => write!(f, "success"),
            BenchmarkStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one benchmark module invocation
///
/// Produced once per run and handed to the caller, which may annotate it
/// with counter readings and build metadata before reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub name: String,
    pub throughput: f64,
    pub throughput_unit: String,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub p50_latency: f64,
    pub p90_latency: f64,
    pub p99_latency: f64,
    pub latency_unit: String,
    pub extra_metrics: BTreeMap<String, f64>,
    pub extra_info: BTreeMap<String, String>,
    pub status: BenchmarkStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl BenchmarkResult {
    /// Empty successful result for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            throughput: 0.0,
            throughput_unit: String::new(),
            avg_latency: 0.0,
            min_latency: 0.0,
            max_latency: 0.0,
            p50_latency: 0.0,
            p90_latency: 0.0,
            p99_latency: 0.0,
            latency_unit: String::new(),
            extra_metrics: BTreeMap::new(),
            extra_info: BTreeMap::new(),
            status: BenchmarkStatus::Success,
            error_message: String::new(),
        }
    }

    /// Failed result carrying a human readable message
    pub fn from_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: BenchmarkStatus::Error,
            error_message: message.into(),
            ..Self::new(name)
        }
    }

    pub fn with_throughput(mut self, value: f64, unit: &str) -> Self {
        self.throughput = value;
        self.throughput_unit = unit.to_string();
        self
    }

    pub fn with_latency(mut self, summary: LatencySummary, unit: &str) -> Self {
        self.avg_latency = summary.avg;
        self.min_latency = summary.min;
        self.max_latency = summary.max;
        self.p50_latency = summary.p50;
        self.p90_latency = summary.p90;
        self.p99_latency = summary.p99;
        self.latency_unit = unit.to_string();
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.extra_metrics.insert(key.into(), value);
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_info.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == BenchmarkStatus::Success
    }

    /// Record how this binary was built
    pub fn add_build_metadata(&mut self) {
        let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
        self.extra_info.insert("build.version".into(), crate::VERSION.into());
        self.extra_info.insert("build.profile".into(), profile.into());
        self.extra_info
            .insert("build.target_os".into(), std::env::consts::OS.into());
        self.extra_info
            .insert("build.target_arch".into(), std::env::consts::ARCH.into());
    }
}

/// Host description stored with every report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub memory_gb: f64,
    pub benchmark_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let memory_gb = ProcFs::default()
            .read_meminfo()
            .map(|mem| mem.total_kb as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::affinity::num_cores(),
            memory_gb,
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Pass/fail tally across the whole suite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_modules: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Document written to the JSON report file
#[derive(Debug, Serialize)]
pub struct SuiteReport<'a> {
    pub metadata: ReportMetadata,
    pub results: &'a [BenchmarkResult],
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub contexts: &'a [ContextualBenchmarkResult],
    pub summary: SuiteSummary,
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

/// Collects results for the run and writes the final report
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    results: Vec<BenchmarkResult>,
    contexts: Vec<ContextualBenchmarkResult>,
}

impl ResultsManager {
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            results: Vec::new(),
            contexts: Vec::new(),
        }
    }

    pub fn add_result(&mut self, result: BenchmarkResult) {
        debug!("Recording result for {} ({})", result.name, result.status);
        self.results.push(result);
    }

    /// Record a contextual run; its plain result joins the result list too
    pub fn add_contextual(&mut self, contextual: ContextualBenchmarkResult) {
        self.add_result(contextual.benchmark_result.clone());
        self.contexts.push(contextual);
    }

    pub fn results(&self) -> &[BenchmarkResult] {
        &self.results
    }

    pub fn summary(&self) -> SuiteSummary {
        let failed_modules: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.name.clone())
            .collect();

        SuiteSummary {
            total: self.results.len(),
            succeeded: self.results.len() - failed_modules.len(),
            failed: failed_modules.len(),
            failed_modules,
        }
    }

    /// Render the report as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        let report = SuiteReport {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::collect(),
            },
            results: &self.results,
            contexts: &self.contexts,
            summary: self.summary(),
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    /// Print the console table and write the JSON report if requested
    pub fn finalize(&self) -> Result<()> {
        self.print_summary();

        if let Some(path) = &self.output_file {
            std::fs::write(path, self.to_json()?)?;
            info!("Results written to: {:?}", path);
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        let widths = [20, 8, 22, 22, 22];
        println!();
        crate::utils::print_table_separator(&widths);
        crate::utils::print_table_row(&["Module", "Status", "Throughput", "Avg latency", "P99 latency"], &widths);
        crate::utils::print_table_separator(&widths);

        for result in &self.results {
            let status = result.status.to_string();
            let (throughput, avg, p99) = if result.is_success() {
                (
                    crate::utils::format_value(result.throughput, &result.throughput_unit),
                    crate::utils::format_value(result.avg_latency, &result.latency_unit),
                    crate::utils::format_value(result.p99_latency, &result.latency_unit),
                )
            } else {
                (result.error_message.clone(), String::new(), String::new())
            };
            crate::utils::print_table_row(&[&result.name, &status, &throughput, &avg, &p99], &widths);
        }
        crate::utils::print_table_separator(&widths);

        for context in &self.contexts {
            println!(
                "{}: reliability {:.0}/100 ({})",
                context.benchmark_result.name,
                context.reliability_score,
                crate::context::interpret_reliability_score(context.reliability_score)
            );
            for warning in &context.context_warnings {
                println!("  warning: {}", warning);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> LatencySummary {
        LatencySummary {
            avg: 2.0,
            min: 1.0,
            max: 5.0,
            p50: 2.0,
            p90: 4.0,
            p99: 5.0,
        }
    }

    #[test]
    fn test_result_builders() {
        let result = BenchmarkResult::new("CPU")
            .with_throughput(3.5, "GOPS")
            .with_latency(sample_summary(), "us")
            .with_metric("threads_used", 4.0)
            .with_info("note", "pinned");

        assert!(result.is_success());
        assert_eq!(result.throughput_unit, "GOPS");
        assert_eq!(result.p90_latency, 4.0);
        assert_eq!(result.latency_unit, "us");
        assert_eq!(result.extra_metrics["threads_used"], 4.0);
        assert_eq!(result.extra_info["note"], "pinned");
    }

    #[test]
    fn test_error_result_serializes_status() {
        let result = BenchmarkResult::from_error("Disk I/O", "Insufficient disk space for test");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error_message"], "Insufficient disk space for test");

        let ok = serde_json::to_value(BenchmarkResult::new("CPU")).unwrap();
        assert_eq!(ok["status"], "success");
        assert!(ok.get("error_message").is_none());
    }

    #[test]
    fn test_build_metadata() {
        let mut result = BenchmarkResult::new("Memory");
        result.add_build_metadata();
        assert_eq!(result.extra_info["build.version"], crate::VERSION);
        assert!(result.extra_info.contains_key("build.profile"));
    }

    #[test]
    fn test_summary_counts_failures() {
        let mut manager = ResultsManager::new(None);
        manager.add_result(BenchmarkResult::new("CPU"));
        manager.add_result(BenchmarkResult::from_error("IPC Shared Memory", "fork failed"));

        let summary = manager.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_modules, vec!["IPC Shared Memory".to_string()]);
    }

    #[test]
    fn test_finalize_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut manager = ResultsManager::new(Some(&path));
        manager.add_result(BenchmarkResult::new("CPU").with_throughput(1.0, "GOPS"));
        manager.finalize().unwrap();

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["results"][0]["name"], "CPU");
        assert_eq!(written["summary"]["succeeded"], 1);
        assert_eq!(written["metadata"]["version"], crate::VERSION);
        assert!(written.get("contexts").is_none());
    }
}
