//! Hardware performance counters
//!
//! On Linux the counters come from `perf_event_open` via `perf-event2`.
//! Each counter is opened on its own so one unsupported event (common on
//! virtual machines) does not hide the others. Counters are created with
//! `inherit` so threads spawned by a benchmark after `start()` are included
//! in the totals once they have been joined.
//!
//! Requirements on Linux:
//! - `kernel.perf_event_paranoid <= 2`, or `CAP_PERFMON`
//! - a PMU that is exposed to the guest when virtualized

use crate::results::BenchmarkResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Reasons a counter session could not be started
#[derive(Debug, Error)]
pub enum PerfCounterError {
    #[error("hardware performance counters are not supported on this platform")]
    Unsupported,

    #[error("no hardware performance counter could be opened (last error: {last_error})")]
    NoCountersAvailable { last_error: String },
}

/// Hardware events collected by a [`PerfCounterSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterKind {
    Cycles,
    Instructions,
    CacheMisses,
    Branches,
    BranchMisses,
}

impl CounterKind {
    pub const ALL: [CounterKind; 5] = [
        CounterKind::Cycles,
        CounterKind::Instructions,
        CounterKind::CacheMisses,
        CounterKind::Branches,
        CounterKind::BranchMisses,
    ];
}

/// One delta reading of the counter set
///
/// When `valid` is false the numeric fields carry no meaning; they are zero
/// only because nothing was read, not because nothing happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfCounterSample {
    pub valid: bool,
    pub cycles: u64,
    pub instructions: u64,
    pub cache_misses: u64,
    pub branches: u64,
    pub branch_misses: u64,
}

impl PerfCounterSample {
    fn set(&mut self, kind: CounterKind, value: u64) {
        match kind {
            CounterKind::Cycles => self.cycles = value,
            CounterKind::Instructions => self.instructions = value,
            CounterKind::CacheMisses => self.cache_misses = value,
            CounterKind::Branches => self.branches = value,
            CounterKind::BranchMisses => self.branch_misses = value,
        }
    }

    /// Cycles per instruction, if both counters were read
    pub fn cpi(&self) -> Option<f64> {
        if self.valid && self.instructions > 0 {
            Some(self.cycles as f64 / self.instructions as f64)
        } else {
            None
        }
    }
}

/// How counters were requested for a run, for result annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterRequest {
    /// Counters were turned off by the user
    Disabled,
    /// Counters were requested; `started` says whether `start()` succeeded
    Requested { started: bool },
}

/// Group of independently opened hardware counters
pub struct PerfCounterSet {
    kinds: Vec<CounterKind>,
    #[cfg(target_os = "linux")]
    active: Vec<(CounterKind, perf_event2::Counter)>,
}

impl Default for PerfCounterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounterSet {
    /// Counter set covering all five hardware events
    pub fn new() -> Self {
        Self::with_kinds(&CounterKind::ALL)
    }

    pub fn with_kinds(kinds: &[CounterKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            #[cfg(target_os = "linux")]
            active: Vec::new(),
        }
    }

    /// Whether a session is currently open
    pub fn is_active(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            !self.active.is_empty()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    /// Open and enable every configured counter
    ///
    /// Returns the number of counters that opened. A previous session is
    /// torn down first. When nothing opens the set stays inert.
    #[cfg(target_os = "linux")]
    pub fn start(&mut self) -> Result<usize, PerfCounterError> {
        use perf_event2::events::Hardware;
        use perf_event2::Builder;

        self.active.clear();
        let mut last_error = String::from("no counters requested");

        for &kind in &self.kinds {
            let event = match kind {
                CounterKind::Cycles => Hardware::CPU_CYCLES,
                CounterKind::Instructions => Hardware::INSTRUCTIONS,
                CounterKind::CacheMisses => Hardware::CACHE_MISSES,
                CounterKind::Branches => Hardware::BRANCH_INSTRUCTIONS,
                CounterKind::BranchMisses => Hardware::BRANCH_MISSES,
            };

            let opened = Builder::new(event).inherit(true).build().and_then(|mut counter| {
                counter.reset()?;
                counter.enable()?;
                Ok(counter)
            });

            match opened {
                Ok(counter) => self.active.push((kind, counter)),
                Err(e) => {
                    debug!("Perf counter {:?} unavailable: {}", kind, e);
                    last_error = e.to_string();
                }
            }
        }

        if self.active.is_empty() {
            return Err(PerfCounterError::NoCountersAvailable { last_error });
        }
        debug!("Opened {} of {} perf counters", self.active.len(), self.kinds.len());
        Ok(self.active.len())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn start(&mut self) -> Result<usize, PerfCounterError> {
        Err(PerfCounterError::Unsupported)
    }

    /// Disable, read and release every open counter
    #[cfg(target_os = "linux")]
    pub fn stop(&mut self) -> PerfCounterSample {
        let mut sample = PerfCounterSample::default();

        for (kind, mut counter) in self.active.drain(..) {
            if let Err(e) = counter.disable() {
                debug!("Failed to disable perf counter {:?}: {}", kind, e);
            }
            match counter.read() {
                Ok(value) => {
                    sample.set(kind, value);
                    sample.valid = true;
                }
                Err(e) => debug!("Failed to read perf counter {:?}: {}", kind, e),
            }
        }

        sample
    }

    #[cfg(not(target_os = "linux"))]
    pub fn stop(&mut self) -> PerfCounterSample {
        PerfCounterSample::default()
    }
}

/// Record a counter sample and its provenance on a result
pub fn attach_to_result(result: &mut BenchmarkResult, sample: &PerfCounterSample, request: CounterRequest) {
    let provenance = match request {
        CounterRequest::Disabled => "disabled",
        CounterRequest::Requested { .. } if sample.valid => "perf_event_open",
        CounterRequest::Requested { started: true } => "unavailable",
        CounterRequest::Requested { started: false } => "insufficient_permissions",
    };

    if sample.valid {
        let metrics = &mut result.extra_metrics;
        metrics.insert("perf_cpu_cycles".into(), sample.cycles as f64);
        metrics.insert("perf_cpu_instructions".into(), sample.instructions as f64);
        metrics.insert("perf_l3_cache_misses".into(), sample.cache_misses as f64);
        metrics.insert("perf_branches".into(), sample.branches as f64);
        metrics.insert("perf_branch_misses".into(), sample.branch_misses as f64);
        if let Some(cpi) = sample.cpi() {
            metrics.insert("perf_cpi".into(), cpi);
        }
    }

    result
        .extra_info
        .insert("perf.counters".into(), provenance.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_without_counters_fails_and_stop_is_invalid() {
        let mut set = PerfCounterSet::with_kinds(&[]);
        assert!(set.start().is_err());
        assert!(!set.is_active());

        let sample = set.stop();
        assert!(!sample.valid);
        assert_eq!(sample, PerfCounterSample::default());
    }

    #[test]
    fn test_stop_without_start_is_invalid() {
        let mut set = PerfCounterSet::new();
        let sample = set.stop();
        assert!(!sample.valid);
        assert_eq!(sample.cycles, 0);
        assert_eq!(sample.branch_misses, 0);
    }

    #[test]
    fn test_restart_tears_down_previous_session() {
        let mut set = PerfCounterSet::new();
        // Either outcome is fine; privileges vary between hosts.
        let first = set.start();
        let second = set.start();
        if let (Ok(a), Ok(b)) = (first, second) {
            assert_eq!(a, b);
        }
        let _ = set.stop();
        assert!(!set.is_active());
    }

    #[test]
    fn test_cpi_requires_instructions() {
        let sample = PerfCounterSample {
            valid: true,
            cycles: 300,
            instructions: 100,
            ..Default::default()
        };
        assert_eq!(sample.cpi(), Some(3.0));

        let empty = PerfCounterSample {
            valid: true,
            cycles: 300,
            ..Default::default()
        };
        assert_eq!(empty.cpi(), None);
    }

    #[test]
    fn test_attach_records_provenance() {
        let mut result = BenchmarkResult::new("CPU");
        attach_to_result(&mut result, &PerfCounterSample::default(), CounterRequest::Disabled);
        assert_eq!(result.extra_info["perf.counters"], "disabled");
        assert!(!result.extra_metrics.contains_key("perf_cpu_cycles"));

        attach_to_result(
            &mut result,
            &PerfCounterSample::default(),
            CounterRequest::Requested { started: false },
        );
        assert_eq!(result.extra_info["perf.counters"], "insufficient_permissions");

        let sample = PerfCounterSample {
            valid: true,
            cycles: 2_000,
            instructions: 1_000,
            cache_misses: 7,
            branches: 50,
            branch_misses: 2,
        };
        attach_to_result(&mut result, &sample, CounterRequest::Requested { started: true });
        assert_eq!(result.extra_info["perf.counters"], "perf_event_open");
        assert_eq!(result.extra_metrics["perf_cpu_cycles"], 2_000.0);
        assert_eq!(result.extra_metrics["perf_cpi"], 2.0);
    }
}
