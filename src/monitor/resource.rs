use serde::{Deserialize, Serialize};

/// System-wide resource usage at one sampling instant, or a reduction of
/// several samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub avg_cpu_usage_percent: f64,
    pub per_core_usage_percent: Vec<f64>,
    pub cpu_frequency_mhz: f64,
    pub thermal_throttling_detected: bool,
    pub memory_used_mb: f64,
    pub memory_available_mb: f64,
    pub memory_usage_percent: f64,
    pub disk_read_mbps: f64,
    pub disk_write_mbps: f64,
    pub avg_io_wait_percent: f64,
    pub disk_operations: u64,
    pub network_rx_mbps: f64,
    pub network_tx_mbps: f64,
    pub load_average_1min: f64,
    pub load_average_5min: f64,
    pub active_processes: u32,
    pub context_switches: u64,
    pub monitoring_duration_seconds: f64,
    pub sample_count: usize,
    /// Seconds since monitoring started when this sample was taken
    pub sample_timestamp_seconds: f64,
}

/// Stable on-disk field layout consumed by the reporting layer
#[derive(Serialize)]
struct ResourceMetricsRecord {
    cpu_usage_percent: f64,
    cpu_frequency_mhz: f64,
    thermal_throttling: bool,
    memory_used_mb: f64,
    memory_usage_percent: f64,
    disk_read_mbps: f64,
    disk_write_mbps: f64,
    io_wait_percent: f64,
    network_rx_mbps: f64,
    network_tx_mbps: f64,
    load_average_1min: f64,
    load_average_5min: f64,
    active_processes: u32,
    monitoring_duration_seconds: f64,
    sample_count: usize,
}

impl From<&ResourceMetrics> for ResourceMetricsRecord {
    fn from(m: &ResourceMetrics) -> Self {
        Self {
            cpu_usage_percent: m.avg_cpu_usage_percent,
            cpu_frequency_mhz: m.cpu_frequency_mhz,
            thermal_throttling: m.thermal_throttling_detected,
            memory_used_mb: m.memory_used_mb,
            memory_usage_percent: m.memory_usage_percent,
            disk_read_mbps: m.disk_read_mbps,
            disk_write_mbps: m.disk_write_mbps,
            io_wait_percent: m.avg_io_wait_percent,
            network_rx_mbps: m.network_rx_mbps,
            network_tx_mbps: m.network_tx_mbps,
            load_average_1min: m.load_average_1min,
            load_average_5min: m.load_average_5min,
            active_processes: m.active_processes,
            monitoring_duration_seconds: m.monitoring_duration_seconds,
            sample_count: m.sample_count,
        }
    }
}

/// `serialize_with` adapter writing the report layout
pub fn serialize_as_record<S>(metrics: &ResourceMetrics, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    ResourceMetricsRecord::from(metrics).serialize(serializer)
}

impl ResourceMetrics {
    /// Ordered JSON field dump used in reports
    ///
    /// Field names and order are part of the report format.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&ResourceMetricsRecord::from(self)).unwrap_or_else(|_| "{}".to_string())
    }

    /// Field-wise arithmetic mean; the throttle flag is OR-ed
    ///
    /// Returns an all-zero value with `sample_count == 0` for no samples.
    pub fn average(samples: &[ResourceMetrics]) -> ResourceMetrics {
        if samples.is_empty() {
            return ResourceMetrics::default();
        }
        let n = samples.len() as f64;
        let mean = |f: fn(&ResourceMetrics) -> f64| samples.iter().map(f).sum::<f64>() / n;

        ResourceMetrics {
            avg_cpu_usage_percent: mean(|m| m.avg_cpu_usage_percent),
            per_core_usage_percent: per_core(samples, |values| {
                values.iter().sum::<f64>() / values.len() as f64
            }),
            cpu_frequency_mhz: mean(|m| m.cpu_frequency_mhz),
            thermal_throttling_detected: samples.iter().any(|m| m.thermal_throttling_detected),
            memory_used_mb: mean(|m| m.memory_used_mb),
            memory_available_mb: mean(|m| m.memory_available_mb),
            memory_usage_percent: mean(|m| m.memory_usage_percent),
            disk_read_mbps: mean(|m| m.disk_read_mbps),
            disk_write_mbps: mean(|m| m.disk_write_mbps),
            avg_io_wait_percent: mean(|m| m.avg_io_wait_percent),
            disk_operations: samples.iter().map(|m| m.disk_operations).sum::<u64>() / samples.len() as u64,
            network_rx_mbps: mean(|m| m.network_rx_mbps),
            network_tx_mbps: mean(|m| m.network_tx_mbps),
            load_average_1min: mean(|m| m.load_average_1min),
            load_average_5min: mean(|m| m.load_average_5min),
            active_processes: (samples.iter().map(|m| m.active_processes as u64).sum::<u64>()
                / samples.len() as u64) as u32,
            context_switches: samples.iter().map(|m| m.context_switches).sum::<u64>() / samples.len() as u64,
            monitoring_duration_seconds: 0.0,
            sample_count: samples.len(),
            sample_timestamp_seconds: samples.last().map(|m| m.sample_timestamp_seconds).unwrap_or(0.0),
        }
    }

    /// Field-wise maximum; the throttle flag is OR-ed
    pub fn peak(samples: &[ResourceMetrics]) -> ResourceMetrics {
        if samples.is_empty() {
            return ResourceMetrics::default();
        }
        let max = |f: fn(&ResourceMetrics) -> f64| samples.iter().map(f).fold(0.0, f64::max);

        ResourceMetrics {
            avg_cpu_usage_percent: max(|m| m.avg_cpu_usage_percent),
            per_core_usage_percent: per_core(samples, |values| values.iter().copied().fold(0.0, f64::max)),
            cpu_frequency_mhz: max(|m| m.cpu_frequency_mhz),
            thermal_throttling_detected: samples.iter().any(|m| m.thermal_throttling_detected),
            memory_used_mb: max(|m| m.memory_used_mb),
            memory_available_mb: max(|m| m.memory_available_mb),
            memory_usage_percent: max(|m| m.memory_usage_percent),
            disk_read_mbps: max(|m| m.disk_read_mbps),
            disk_write_mbps: max(|m| m.disk_write_mbps),
            avg_io_wait_percent: max(|m| m.avg_io_wait_percent),
            disk_operations: samples.iter().map(|m| m.disk_operations).max().unwrap_or(0),
            network_rx_mbps: max(|m| m.network_rx_mbps),
            network_tx_mbps: max(|m| m.network_tx_mbps),
            load_average_1min: max(|m| m.load_average_1min),
            load_average_5min: max(|m| m.load_average_5min),
            active_processes: samples.iter().map(|m| m.active_processes).max().unwrap_or(0),
            context_switches: samples.iter().map(|m| m.context_switches).max().unwrap_or(0),
            monitoring_duration_seconds: 0.0,
            sample_count: samples.len(),
            sample_timestamp_seconds: samples.last().map(|m| m.sample_timestamp_seconds).unwrap_or(0.0),
        }
    }

    /// Header matching [`ResourceMetrics::csv_row`]
    pub const CSV_HEADER: &'static str = "timestamp_seconds,cpu_usage_percent,cpu_frequency_mhz,thermal_throttling,\
memory_used_mb,memory_usage_percent,disk_read_mbps,disk_write_mbps,io_wait_percent,disk_operations,\
network_rx_mbps,network_tx_mbps,load_average_1min,load_average_5min,active_processes,context_switches";

    pub fn csv_row(&self) -> String {
        format!(
            "{:.3},{:.2},{:.1},{},{:.1},{:.2},{:.3},{:.3},{:.2},{},{:.3},{:.3},{:.2},{:.2},{},{}",
            self.sample_timestamp_seconds,
            self.avg_cpu_usage_percent,
            self.cpu_frequency_mhz,
            self.thermal_throttling_detected,
            self.memory_used_mb,
            self.memory_usage_percent,
            self.disk_read_mbps,
            self.disk_write_mbps,
            self.avg_io_wait_percent,
            self.disk_operations,
            self.network_rx_mbps,
            self.network_tx_mbps,
            self.load_average_1min,
            self.load_average_5min,
            self.active_processes,
            self.context_switches,
        )
    }
}

/// Reduce per-core series index by index; cores missing from a sample are
/// skipped rather than treated as idle
fn per_core(samples: &[ResourceMetrics], reduce: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    let cores = samples
        .iter()
        .map(|m| m.per_core_usage_percent.len())
        .max()
        .unwrap_or(0);

    (0..cores)
        .map(|core| {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|m| m.per_core_usage_percent.get(core).copied())
                .collect();
            reduce(&values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, mem: f64, throttled: bool, cores: Vec<f64>) -> ResourceMetrics {
        ResourceMetrics {
            avg_cpu_usage_percent: cpu,
            memory_usage_percent: mem,
            thermal_throttling_detected: throttled,
            per_core_usage_percent: cores,
            active_processes: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_reducers_on_empty_input_are_zero() {
        let avg = ResourceMetrics::average(&[]);
        let peak = ResourceMetrics::peak(&[]);
        assert_eq!(avg, ResourceMetrics::default());
        assert_eq!(peak, ResourceMetrics::default());
        assert_eq!(avg.sample_count, 0);
        assert_eq!(peak.avg_cpu_usage_percent, 0.0);
    }

    #[test]
    fn test_average_and_peak() {
        let samples = vec![
            sample(10.0, 40.0, false, vec![10.0, 20.0]),
            sample(30.0, 60.0, true, vec![30.0, 40.0]),
        ];
        let avg = ResourceMetrics::average(&samples);
        assert_eq!(avg.sample_count, 2);
        assert_eq!(avg.avg_cpu_usage_percent, 20.0);
        assert_eq!(avg.memory_usage_percent, 50.0);
        assert!(avg.thermal_throttling_detected);
        assert_eq!(avg.per_core_usage_percent, vec![20.0, 30.0]);
        assert_eq!(avg.active_processes, 3);

        let peak = ResourceMetrics::peak(&samples);
        assert_eq!(peak.avg_cpu_usage_percent, 30.0);
        assert_eq!(peak.per_core_usage_percent, vec![30.0, 40.0]);
        assert!(peak.thermal_throttling_detected);
    }

    #[test]
    fn test_per_core_tolerates_uneven_lengths() {
        let samples = vec![sample(0.0, 0.0, false, vec![50.0]), sample(0.0, 0.0, false, vec![70.0, 10.0])];
        let avg = ResourceMetrics::average(&samples);
        assert_eq!(avg.per_core_usage_percent, vec![60.0, 10.0]);
    }

    #[test]
    fn test_to_json_field_order() {
        let json = sample(12.5, 33.0, false, vec![]).to_json();
        let keys = [
            "cpu_usage_percent",
            "cpu_frequency_mhz",
            "thermal_throttling",
            "memory_used_mb",
            "memory_usage_percent",
            "disk_read_mbps",
            "disk_write_mbps",
            "io_wait_percent",
            "network_rx_mbps",
            "network_tx_mbps",
            "load_average_1min",
            "load_average_5min",
            "active_processes",
            "monitoring_duration_seconds",
            "sample_count",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| json.find(&format!("\"{}\"", k)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cpu_usage_percent"], 12.5);
        assert_eq!(value["thermal_throttling"], false);
    }

    #[test]
    fn test_csv_row_matches_header() {
        let row = sample(1.0, 2.0, false, vec![]).csv_row();
        let header_columns = ResourceMetrics::CSV_HEADER.split(',').count();
        assert_eq!(row.split(',').count(), header_columns);
    }
}
