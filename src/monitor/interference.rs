use super::resource::ResourceMetrics;
use serde::{Deserialize, Serialize};

/// Average CPU usage above which background load is assumed
pub const HIGH_CPU_PERCENT: f64 = 20.0;
/// Memory usage above which pressure is assumed
pub const HIGH_MEMORY_PERCENT: f64 = 80.0;
/// I/O wait above which storage contention is assumed
pub const HIGH_IO_WAIT_PERCENT: f64 = 10.0;
/// Combined rx+tx rate on physical interfaces treated as congestion, roughly
/// 80% of a gigabit link
pub const HIGH_NETWORK_MBPS: f64 = 100.0;
/// 1-minute load average per core above which the host is loaded
pub const HIGH_LOAD_PER_CORE: f64 = 0.8;

/// Background activity that may have biased a measurement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterferenceReport {
    pub high_background_cpu_usage: bool,
    pub memory_pressure: bool,
    pub high_io_wait: bool,
    pub network_congestion: bool,
    pub thermal_throttling: bool,
    pub performance_warnings: Vec<String>,
}

impl InterferenceReport {
    /// Judge averaged metrics against the fixed thresholds
    ///
    /// A high load average only adds a warning; it has no flag of its own.
    pub fn from_metrics(avg: &ResourceMetrics, cores: usize) -> Self {
        let mut report = InterferenceReport {
            high_background_cpu_usage: avg.avg_cpu_usage_percent > HIGH_CPU_PERCENT,
            memory_pressure: avg.memory_usage_percent > HIGH_MEMORY_PERCENT,
            high_io_wait: avg.avg_io_wait_percent > HIGH_IO_WAIT_PERCENT,
            network_congestion: avg.network_rx_mbps + avg.network_tx_mbps > HIGH_NETWORK_MBPS,
            thermal_throttling: avg.thermal_throttling_detected,
            performance_warnings: Vec::new(),
        };

        let warnings = &mut report.performance_warnings;
        if report.high_background_cpu_usage {
            warnings.push(format!(
                "High background CPU usage detected ({}%)",
                avg.avg_cpu_usage_percent as i64
            ));
        }
        if report.memory_pressure {
            warnings.push(format!(
                "High memory usage detected ({}%)",
                avg.memory_usage_percent as i64
            ));
        }
        if report.high_io_wait {
            warnings.push(format!(
                "High I/O wait detected ({}%)",
                avg.avg_io_wait_percent as i64
            ));
        }
        if report.network_congestion {
            warnings.push(format!(
                "High network traffic detected ({:.1} MB/s)",
                avg.network_rx_mbps + avg.network_tx_mbps
            ));
        }
        if report.thermal_throttling {
            warnings.push("CPU thermal throttling detected".to_string());
        }
        if avg.load_average_1min > cores as f64 * HIGH_LOAD_PER_CORE {
            warnings.push(format!("High system load detected ({:.2})", avg.load_average_1min));
        }

        report
    }

    pub fn has_interference(&self) -> bool {
        self.high_background_cpu_usage
            || self.memory_pressure
            || self.high_io_wait
            || self.network_congestion
            || self.thermal_throttling
    }

    /// One-line description, e.g. "... detected: memory pressure and high I/O wait"
    pub fn summary(&self) -> String {
        if !self.has_interference() {
            return "No significant system interference detected".to_string();
        }

        let issues: Vec<&str> = [
            (self.high_background_cpu_usage, "high background CPU usage"),
            (self.memory_pressure, "memory pressure"),
            (self.high_io_wait, "high I/O wait"),
            (self.network_congestion, "network congestion"),
            (self.thermal_throttling, "thermal throttling"),
        ]
        .iter()
        .filter(|(flagged, _)| *flagged)
        .map(|(_, label)| *label)
        .collect();

        let listed = match issues.split_last() {
            Some((last, rest)) if !rest.is_empty() => format!("{} and {}", rest.join(", "), last),
            Some((last, _)) => (*last).to_string(),
            None => String::new(),
        };
        format!("Performance interference detected: {}", listed)
    }

    /// Operator advice for the flagged conditions plus general guidance
    pub fn recommendations(&self) -> Vec<String> {
        let mut advice: Vec<&str> = Vec::new();

        if self.high_background_cpu_usage {
            advice.push("Close unnecessary applications to reduce background CPU usage");
            advice.push("Check for resource-intensive processes with 'top' or 'htop'");
        }
        if self.memory_pressure {
            advice.push("Close memory-intensive applications");
            advice.push("Consider increasing system RAM or enabling swap");
        }
        if self.high_io_wait {
            advice.push("Check for disk-intensive processes");
            advice.push("Consider using faster storage (SSD vs HDD)");
            advice.push("Verify disk health and available space");
        }
        if self.network_congestion {
            advice.push("Pause bulk transfers or backups while benchmarking");
        }
        if self.thermal_throttling {
            advice.push("Check CPU cooling and reduce ambient temperature");
            advice.push("Clean dust from cooling system");
        }
        advice.push("Run benchmarks with minimal background activity");
        advice.push("Ensure consistent power settings (performance mode)");

        advice.into_iter().map(String::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_system_has_no_interference() {
        let report = InterferenceReport::from_metrics(&ResourceMetrics::default(), 4);
        assert!(!report.has_interference());
        assert!(report.performance_warnings.is_empty());
        assert_eq!(report.summary(), "No significant system interference detected");
        assert_eq!(report.recommendations().len(), 2);
    }

    #[test]
    fn test_each_threshold_flags_independently() {
        let metrics = ResourceMetrics {
            avg_cpu_usage_percent: 35.0,
            avg_io_wait_percent: 12.0,
            ..Default::default()
        };
        let report = InterferenceReport::from_metrics(&metrics, 4);
        assert!(report.high_background_cpu_usage);
        assert!(report.high_io_wait);
        assert!(!report.memory_pressure);
        assert!(!report.network_congestion);
        assert!(!report.thermal_throttling);
        assert_eq!(report.performance_warnings.len(), 2);
        assert_eq!(report.performance_warnings[0], "High background CPU usage detected (35%)");
        assert_eq!(
            report.summary(),
            "Performance interference detected: high background CPU usage and high I/O wait"
        );
    }

    #[test]
    fn test_summary_lists_three_issues() {
        let report = InterferenceReport {
            memory_pressure: true,
            network_congestion: true,
            thermal_throttling: true,
            ..Default::default()
        };
        assert_eq!(
            report.summary(),
            "Performance interference detected: memory pressure, network congestion and thermal throttling"
        );
    }

    #[test]
    fn test_load_average_warns_without_flag() {
        let metrics = ResourceMetrics {
            load_average_1min: 3.5,
            ..Default::default()
        };
        let report = InterferenceReport::from_metrics(&metrics, 4);
        assert!(!report.has_interference());
        assert_eq!(report.performance_warnings, vec!["High system load detected (3.50)".to_string()]);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let metrics = ResourceMetrics {
            avg_cpu_usage_percent: HIGH_CPU_PERCENT,
            memory_usage_percent: HIGH_MEMORY_PERCENT,
            avg_io_wait_percent: HIGH_IO_WAIT_PERCENT,
            ..Default::default()
        };
        assert!(!InterferenceReport::from_metrics(&metrics, 1).has_interference());
    }
}
