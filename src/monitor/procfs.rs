//! Raw kernel counter readers
//!
//! The parsers are pure functions over file contents so they can be tested
//! against captured snapshots. [`ProcFs`] binds them to a `/proc` and `/sys`
//! root, which tests point at fixture trees.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Cumulative tick counters of one `cpu` line in `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTicks {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Ticks spent doing work; idle and I/O wait are excluded
    pub fn active(&self) -> u64 {
        self.total().saturating_sub(self.idle + self.iowait)
    }

    fn parse(fields: &[&str]) -> Option<Self> {
        let value = |i: usize| fields.get(i).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        // user, nice, system and idle are always present
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            user: value(0),
            nice: value(1),
            system: value(2),
            idle: value(3),
            iowait: value(4),
            irq: value(5),
            softirq: value(6),
            steal: value(7),
        })
    }
}

/// Parsed `/proc/stat`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub total: CpuTicks,
    pub per_core: Vec<CpuTicks>,
    pub context_switches: u64,
    pub procs_running: u32,
}

pub fn parse_stat(content: &str) -> Option<StatSnapshot> {
    let mut total = None;
    let mut per_core = Vec::new();
    let mut context_switches = 0;
    let mut procs_running = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        let fields: Vec<&str> = parts.collect();

        if key == "cpu" {
            total = CpuTicks::parse(&fields);
        } else if key.starts_with("cpu") && key[3..].chars().all(|c| c.is_ascii_digit()) {
            if let Some(ticks) = CpuTicks::parse(&fields) {
                per_core.push(ticks);
            }
        } else if key == "ctxt" {
            context_switches = fields.first().and_then(|v| v.parse().ok()).unwrap_or(0);
        } else if key == "procs_running" {
            procs_running = fields.first().and_then(|v| v.parse().ok()).unwrap_or(0);
        }
    }

    Some(StatSnapshot {
        total: total?,
        per_core,
        context_switches,
        procs_running,
    })
}

/// Memory totals from `/proc/meminfo`, in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut fields: BTreeMap<&str, u64> = BTreeMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else { continue };
        if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) {
            fields.insert(key.trim(), value);
        }
    }

    let total_kb = *fields.get("MemTotal")?;
    // Kernels before 3.14 have no MemAvailable
    let available_kb = fields.get("MemAvailable").copied().unwrap_or_else(|| {
        ["MemFree", "Buffers", "Cached"]
            .iter()
            .filter_map(|k| fields.get(k))
            .sum()
    });

    Some(MemInfo {
        total_kb,
        available_kb: available_kb.min(total_kb),
    })
}

/// Cumulative counters of one block device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
}

/// Bytes per sector as reported by `/proc/diskstats`, independent of the
/// device's physical sector size
pub const DISKSTATS_SECTOR_BYTES: u64 = 512;

fn is_virtual_block_device(name: &str) -> bool {
    ["loop", "ram", "zram"].iter().any(|prefix| name.starts_with(prefix))
}

fn is_partition_of(name: &str, disk: &str) -> bool {
    if name == disk {
        return false;
    }
    let Some(rest) = name.strip_prefix(disk) else {
        return false;
    };
    let digits = rest.strip_prefix('p').unwrap_or(rest);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Parse `/proc/diskstats`, keeping whole physical devices only
///
/// Synthetic devices (loop, ram, zram) are dropped, and so are partitions
/// whose parent disk is listed, so traffic is not counted twice.
pub fn parse_diskstats(content: &str) -> BTreeMap<String, DiskCounters> {
    let mut devices = BTreeMap::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || is_virtual_block_device(fields[2]) {
            continue;
        }
        let value = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        devices.insert(
            fields[2].to_string(),
            DiskCounters {
                reads_completed: value(3),
                sectors_read: value(5),
                writes_completed: value(7),
                sectors_written: value(9),
            },
        );
    }

    let names: Vec<String> = devices.keys().cloned().collect();
    devices.retain(|name, _| !names.iter().any(|disk| is_partition_of(name, disk)));
    devices
}

/// Cumulative byte counters of one network interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Parse `/proc/net/dev`, skipping the loopback interface
pub fn parse_net_dev(content: &str) -> BTreeMap<String, NetCounters> {
    let mut interfaces = BTreeMap::new();

    for line in content.lines() {
        let Some((name, rest)) = line.split_once(':') else { continue };
        let name = name.trim();
        if name.is_empty() || name == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if fields.len() < 9 {
            continue;
        }
        interfaces.insert(
            name.to_string(),
            NetCounters {
                rx_bytes: fields[0],
                tx_bytes: fields[8],
            },
        );
    }

    interfaces
}

/// 1- and 5-minute load averages from `/proc/loadavg`
pub fn parse_loadavg(content: &str) -> Option<(f64, f64)> {
    let mut fields = content.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    Some((one, five))
}

/// Mean of every `cpu MHz` entry in `/proc/cpuinfo`
pub fn parse_cpu_mhz(content: &str) -> Option<f64> {
    let values: Vec<f64> = content
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .filter_map(|line| line.split_once(':'))
        .filter_map(|(_, value)| value.trim().parse().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Reader bound to a `/proc` and `/sys` tree
#[derive(Debug, Clone)]
pub struct ProcFs {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc", "/sys")
    }
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unrecognized {} format", what))
}

impl ProcFs {
    pub fn new(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn read_proc(&self, relative: &str) -> io::Result<String> {
        fs::read_to_string(self.proc_root.join(relative))
    }

    pub fn read_stat(&self) -> io::Result<StatSnapshot> {
        parse_stat(&self.read_proc("stat")?).ok_or_else(|| invalid("/proc/stat"))
    }

    pub fn read_meminfo(&self) -> io::Result<MemInfo> {
        parse_meminfo(&self.read_proc("meminfo")?).ok_or_else(|| invalid("/proc/meminfo"))
    }

    pub fn read_diskstats(&self) -> io::Result<BTreeMap<String, DiskCounters>> {
        Ok(parse_diskstats(&self.read_proc("diskstats")?))
    }

    pub fn read_net_dev(&self) -> io::Result<BTreeMap<String, NetCounters>> {
        Ok(parse_net_dev(&self.read_proc("net/dev")?))
    }

    pub fn read_loadavg(&self) -> io::Result<(f64, f64)> {
        parse_loadavg(&self.read_proc("loadavg")?).ok_or_else(|| invalid("/proc/loadavg"))
    }

    /// Current CPU frequency, from cpuinfo or else cpufreq
    pub fn read_cpu_mhz(&self) -> Option<f64> {
        if let Some(mhz) = self.read_proc("cpuinfo").ok().and_then(|c| parse_cpu_mhz(&c)) {
            return Some(mhz);
        }
        let khz: f64 = fs::read_to_string(
            self.sys_root
                .join("devices/system/cpu/cpu0/cpufreq/scaling_cur_freq"),
        )
        .ok()?
        .trim()
        .parse()
        .ok()?;
        Some(khz / 1000.0)
    }

    /// Hottest thermal zone in millidegrees Celsius
    pub fn read_max_thermal_millicelsius(&self) -> Option<i64> {
        let zones = fs::read_dir(self.sys_root.join("class/thermal")).ok()?;
        zones
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("thermal_zone"))
            .filter_map(|entry| fs::read_to_string(entry.path().join("temp")).ok())
            .filter_map(|temp| temp.trim().parse::<i64>().ok())
            .max()
    }
}
