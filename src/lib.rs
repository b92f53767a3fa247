//! # Host Performance Suite Library
//!
//! Benchmarks for the main subsystems of a host (CPU, memory, disk,
//! network and shared-memory IPC) together with a background resource
//! monitor that tells whether a measurement was disturbed by other
//! activity on the machine.
//!
//! ## Architecture Overview
//!
//! - `benchmark`: the six benchmark modules behind one closed
//!   [`BenchmarkModule`] enum whose `run` never fails
//! - `metrics`: timers, latency sample sets and adaptive iteration scaling
//! - `affinity`: pinning worker threads to cores
//! - `perf`: optional hardware counters around a run
//! - `ipc`: named semaphores and a shared segment with a fixed control block
//! - `monitor`: `/proc` and `/sys` sampling, averages, peaks and
//!   interference detection
//! - `context`: a module run wrapped in monitoring, with a reliability score
//! - `results`: result collection, console table and JSON report
//! - `cli` and `logging`: argument parsing and the colourised log format
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use perf_suite::{BenchmarkModule, ModuleKind, ResultsManager};
//!
//! let mut results = ResultsManager::new(None);
//! if let Some(module) = BenchmarkModule::from_kind(ModuleKind::Memory) {
//!     results.add_result(module.run(5, 3, false));
//! }
//! results.print_summary();
//! ```

/// Benchmark modules and the worker pool they share
pub mod benchmark;

/// Command-line interface and run configuration
pub mod cli;

/// Monitored module runs and reliability scoring
pub mod context;

/// Shared-memory transfer primitives used by the IPC module
#[cfg(unix)]
pub mod ipc;

/// Colourised log output
pub mod logging;

/// Timing and latency statistics
pub mod metrics;

/// Background system resource monitoring
pub mod monitor;

/// Hardware performance counters
pub mod perf;

/// Result collection, aggregation, and output formatting
pub mod results;

/// CPU core pinning helpers
pub mod affinity;

pub mod utils;

pub use benchmark::BenchmarkModule;
pub use cli::{Args, ModuleKind, RunConfiguration};
pub use context::{ContextualBenchmarkResult, PerformanceContextAnalyzer};
pub use metrics::{LatencyStats, LatencySummary, Timer};
pub use monitor::{InterferenceReport, ResourceMetrics, SystemMonitor};
pub use perf::{PerfCounterSample, PerfCounterSet};
pub use results::{BenchmarkResult, BenchmarkStatus, ResultsManager};

/// The current version of the suite, recorded in every report
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Per-module time budget in seconds
    pub const DURATION_SECONDS: u32 = 30;

    /// Iterations per module
    pub const ITERATIONS: u32 = 10;

    /// Interval between monitor samples
    pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

    /// Shortest timed region adaptive measurement accepts
    ///
    /// Below this the clock resolution dominates the reading.
    pub const MIN_MEASURABLE_DURATION: Duration = Duration::from_millis(1);

    /// Throughput above which a memory measurement is treated as a timing
    /// artifact and clamped
    pub const THROUGHPUT_CEILING_MB_S: f64 = 100_000.0;

    /// CPU warmup before a contextual run
    pub const WARMUP: Duration = Duration::from_secs(2);

    /// Pause after a contextual run
    pub const COOLDOWN: Duration = Duration::from_secs(1);

    /// Size of the IPC shared segment
    pub const SHM_SIZE: usize = 16 * 1024 * 1024;

    /// Latency slots in the IPC control block; later samples are counted
    /// but not stored
    pub const IPC_LATENCY_SLOTS: usize = 65_536;
}
