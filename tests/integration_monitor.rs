#![cfg(target_os = "linux")]

use anyhow::Result;
use perf_suite::monitor::{ResourceMetrics, SystemMonitor};
use std::time::Duration;

fn monitored_window(interval: Duration, window: Duration) -> Result<SystemMonitor> {
    let mut monitor = SystemMonitor::with_interval(interval);
    monitor.start_monitoring()?;
    std::thread::sleep(window);
    monitor.stop_monitoring();
    Ok(monitor)
}

/// Sampling the live host yields bounded averages dominated by the peaks.
#[test]
fn live_host_samples_are_consistent() -> Result<()> {
    let monitor = monitored_window(Duration::from_millis(50), Duration::from_millis(400))?;
    assert!(monitor.sample_count() >= 3, "only {} samples", monitor.sample_count());

    let avg = monitor.average_metrics();
    let peak = monitor.peak_metrics();
    assert_eq!(avg.sample_count, monitor.sample_count());
    assert!((0.0..=100.0).contains(&avg.avg_cpu_usage_percent));
    assert!((0.0..=100.0).contains(&avg.memory_usage_percent));
    assert!(avg.memory_used_mb > 0.0);
    assert!(peak.avg_cpu_usage_percent >= avg.avg_cpu_usage_percent);
    assert!(peak.memory_usage_percent >= avg.memory_usage_percent);
    assert!(avg.monitoring_duration_seconds >= 0.4);
    Ok(())
}

/// Telemetry is written as a JSON array or as CSV with a header row.
#[test]
fn telemetry_files_round_trip() -> Result<()> {
    let monitor = monitored_window(Duration::from_millis(30), Duration::from_millis(200))?;
    let dir = tempfile::tempdir()?;

    let json_path = dir.path().join("samples.json");
    monitor.write_samples_to_file(&json_path)?;
    let samples: Vec<ResourceMetrics> = serde_json::from_str(&std::fs::read_to_string(&json_path)?)?;
    assert_eq!(samples.len(), monitor.sample_count());

    let csv_path = dir.path().join("samples.csv");
    monitor.write_samples_to_file(&csv_path)?;
    let csv = std::fs::read_to_string(&csv_path)?;
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some(ResourceMetrics::CSV_HEADER));
    assert_eq!(lines.count(), monitor.sample_count());
    Ok(())
}

/// A one-off reading needs no running session.
#[test]
fn current_metrics_without_session() -> Result<()> {
    let monitor = SystemMonitor::new();
    let metrics = monitor.collect_current_metrics()?;
    assert_eq!(metrics.sample_count, 1);
    assert!(metrics.memory_usage_percent > 0.0);
    assert!(!monitor.is_monitoring());
    Ok(())
}
