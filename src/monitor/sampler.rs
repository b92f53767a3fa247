//! Delta-based resource sampling
//!
//! CPU, disk and network figures are rates between two cumulative counter
//! snapshots, so the sampler keeps the previous raw snapshot between calls.
//! The first call after construction or [`Sampler::reset`] has nothing to
//! compare against and reports those rates as zero.

use super::procfs::{CpuTicks, DiskCounters, NetCounters, ProcFs, StatSnapshot, DISKSTATS_SECTOR_BYTES};
use super::resource::ResourceMetrics;
use std::collections::BTreeMap;
use std::io;
use std::time::Instant;

/// Thermal zone temperature above which the CPU is assumed to throttle
pub const THROTTLE_MILLICELSIUS: i64 = 85_000;

const MIB: f64 = 1024.0 * 1024.0;

/// Share of `prev -> curr` ticks spent active, in percent
///
/// Returns 0 when no ticks elapsed; the result is clamped to `[0, 100]`.
pub fn core_usage_percent(prev: &CpuTicks, curr: &CpuTicks) -> f64 {
    let total = curr.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }
    let active = curr.active().saturating_sub(prev.active());
    (active as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Share of `prev -> curr` ticks spent waiting on I/O, in percent
pub fn io_wait_percent(prev: &CpuTicks, curr: &CpuTicks) -> f64 {
    let total = curr.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }
    let iowait = curr.iowait.saturating_sub(prev.iowait);
    (iowait as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
struct RawSnapshot {
    taken_at: Instant,
    stat: StatSnapshot,
    disks: Option<BTreeMap<String, DiskCounters>>,
    interfaces: Option<BTreeMap<String, NetCounters>>,
}

/// Turns successive kernel counter readings into [`ResourceMetrics`]
#[derive(Debug, Clone)]
pub struct Sampler {
    procfs: ProcFs,
    previous: Option<RawSnapshot>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(ProcFs::default())
    }
}

impl Sampler {
    pub fn new(procfs: ProcFs) -> Self {
        Self {
            procfs,
            previous: None,
        }
    }

    /// Forget the previous snapshot so the next sample starts a new series
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }

    /// Read every counter source and compute one sample
    ///
    /// Only `/proc/stat` is required; the other sources leave their fields
    /// at zero when they cannot be read.
    pub fn collect(&mut self) -> io::Result<ResourceMetrics> {
        self.collect_at(Instant::now())
    }

    fn collect_at(&mut self, now: Instant) -> io::Result<ResourceMetrics> {
        let stat = self.procfs.read_stat()?;
        let disks = self.procfs.read_diskstats().ok();
        let interfaces = self.procfs.read_net_dev().ok();

        let mut metrics = ResourceMetrics {
            active_processes: stat.procs_running,
            ..Default::default()
        };

        if let Ok(mem) = self.procfs.read_meminfo() {
            let used_kb = mem.total_kb.saturating_sub(mem.available_kb);
            metrics.memory_used_mb = used_kb as f64 / 1024.0;
            metrics.memory_available_mb = mem.available_kb as f64 / 1024.0;
            if mem.total_kb > 0 {
                metrics.memory_usage_percent = used_kb as f64 / mem.total_kb as f64 * 100.0;
            }
        }
        if let Ok((one, five)) = self.procfs.read_loadavg() {
            metrics.load_average_1min = one;
            metrics.load_average_5min = five;
        }
        metrics.cpu_frequency_mhz = self.procfs.read_cpu_mhz().unwrap_or(0.0);
        metrics.thermal_throttling_detected = self
            .procfs
            .read_max_thermal_millicelsius()
            .map_or(false, |t| t > THROTTLE_MILLICELSIUS);

        let current = RawSnapshot {
            taken_at: now,
            stat,
            disks,
            interfaces,
        };

        match &self.previous {
            Some(previous) => apply_deltas(&mut metrics, previous, &current),
            None => {
                metrics.per_core_usage_percent = vec![0.0; current.stat.per_core.len()];
            }
        }

        self.previous = Some(current);
        Ok(metrics)
    }
}

fn apply_deltas(metrics: &mut ResourceMetrics, previous: &RawSnapshot, current: &RawSnapshot) {
    let (prev, curr) = (&previous.stat, &current.stat);

    metrics.avg_cpu_usage_percent = core_usage_percent(&prev.total, &curr.total);
    metrics.avg_io_wait_percent = io_wait_percent(&prev.total, &curr.total);
    metrics.per_core_usage_percent = curr
        .per_core
        .iter()
        .enumerate()
        .map(|(i, core)| prev.per_core.get(i).map_or(0.0, |before| core_usage_percent(before, core)))
        .collect();
    metrics.context_switches = curr.context_switches.saturating_sub(prev.context_switches);

    let elapsed = current
        .taken_at
        .saturating_duration_since(previous.taken_at)
        .as_secs_f64();
    if elapsed <= 0.0 {
        return;
    }

    if let (Some(before), Some(after)) = (&previous.disks, &current.disks) {
        let (mut read_sectors, mut written_sectors, mut operations) = (0u64, 0u64, 0u64);
        for (name, now) in after {
            let Some(then) = before.get(name) else { continue };
            read_sectors += now.sectors_read.saturating_sub(then.sectors_read);
            written_sectors += now.sectors_written.saturating_sub(then.sectors_written);
            operations += now.reads_completed.saturating_sub(then.reads_completed)
                + now.writes_completed.saturating_sub(then.writes_completed);
        }
        metrics.disk_read_mbps = (read_sectors * DISKSTATS_SECTOR_BYTES) as f64 / MIB / elapsed;
        metrics.disk_write_mbps = (written_sectors * DISKSTATS_SECTOR_BYTES) as f64 / MIB / elapsed;
        metrics.disk_operations = operations;
    }

    if let (Some(before), Some(after)) = (&previous.interfaces, &current.interfaces) {
        let (mut rx, mut tx) = (0u64, 0u64);
        for (name, now) in after {
            let Some(then) = before.get(name) else { continue };
            rx += now.rx_bytes.saturating_sub(then.rx_bytes);
            tx += now.tx_bytes.saturating_sub(then.tx_bytes);
        }
        metrics.network_rx_mbps = rx as f64 / MIB / elapsed;
        metrics.network_tx_mbps = tx as f64 / MIB / elapsed;
    }
}
