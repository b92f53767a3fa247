//! # Benchmark Modules
//!
//! Each module drives one concurrency topology against one subsystem and
//! reports a single [`BenchmarkResult`]:
//!
//! - **CPU**: core-pinned worker threads plus a pointer-chase cache probe
//! - **Memory**: adaptive sequential bandwidth, random access and a
//!   multithreaded pass over disjoint chunks
//! - **Disk I/O**: sequential and synced random access on a scratch file
//! - **Network**: loopback TCP and UDP echo client/server pairs
//! - **IPC Shared Memory**: a forked consumer fed through a shared segment
//! - **Integrated System**: three workflows sharing one locked buffer
//!
//! [`BenchmarkModule::run`] is the only place where failures become data:
//! errors and panics from a module are turned into an error result so one
//! failed module never aborts the suite.

/// Log module progress at `info` when the caller asked for verbose output
/// and at `debug` otherwise
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}
pub(crate) use progress;

pub mod cpu;
pub mod disk;
pub mod integrated;
#[cfg(unix)]
pub mod ipc;
pub mod memory;
pub mod network;
pub mod workers;

use crate::cli::ModuleKind;
use crate::results::BenchmarkResult;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

pub use cpu::{CacheLatencyProfile, CpuBenchmark};
pub use disk::DiskBenchmark;
pub use integrated::IntegratedBenchmark;
#[cfg(unix)]
pub use ipc::IpcBenchmark;
pub use memory::MemoryBenchmark;
pub use network::NetworkBenchmark;

/// Closed set of benchmark modules
#[derive(Debug, Clone)]
pub enum BenchmarkModule {
    Cpu(CpuBenchmark),
    Memory(MemoryBenchmark),
    Disk(DiskBenchmark),
    Network(NetworkBenchmark),
    #[cfg(unix)]
    Ipc(IpcBenchmark),
    Integrated(IntegratedBenchmark),
}

impl BenchmarkModule {
    /// Module for a CLI selection; `None` for `all` or for a module the
    /// platform cannot run
    pub fn from_kind(kind: ModuleKind) -> Option<Self> {
        match kind {
            ModuleKind::Cpu => Some(Self::Cpu(CpuBenchmark::new())),
            ModuleKind::Memory => Some(Self::Memory(MemoryBenchmark::new())),
            ModuleKind::Disk => Some(Self::Disk(DiskBenchmark::new())),
            ModuleKind::Network => Some(Self::Network(NetworkBenchmark::new())),
            #[cfg(unix)]
            ModuleKind::Ipc => Some(Self::Ipc(IpcBenchmark::new())),
            #[cfg(not(unix))]
            ModuleKind::Ipc => None,
            ModuleKind::Integrated => Some(Self::Integrated(IntegratedBenchmark::new())),
            ModuleKind::All => None,
        }
    }

    /// Name used in results and reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu(_) => cpu::NAME,
            Self::Memory(_) => memory::NAME,
            Self::Disk(_) => disk::NAME,
            Self::Network(_) => network::NAME,
            #[cfg(unix)]
            Self::Ipc(_) => ipc::NAME,
            Self::Integrated(_) => integrated::NAME,
        }
    }

    /// Run the module; never fails and never unwinds past this call
    ///
    /// `duration_seconds` and `iterations` are expected to be positive;
    /// zero is treated as one.
    pub fn run(&self, duration_seconds: u32, iterations: u32, verbose: bool) -> BenchmarkResult {
        let duration_seconds = duration_seconds.max(1);
        let iterations = iterations.max(1);
        debug!(
            "Running {} for {}s with {} iterations",
            self.name(),
            duration_seconds,
            iterations
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            Self::Cpu(m) => m.execute(duration_seconds, iterations, verbose),
            Self::Memory(m) => m.execute(duration_seconds, iterations, verbose),
            Self::Disk(m) => m.execute(duration_seconds, iterations, verbose),
            Self::Network(m) => m.execute(duration_seconds, iterations, verbose),
            #[cfg(unix)]
            Self::Ipc(m) => m.execute(duration_seconds, iterations, verbose),
            Self::Integrated(m) => m.execute(duration_seconds, iterations, verbose),
        }));

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("{} benchmark failed: {:#}", self.name(), e);
                BenchmarkResult::from_error(self.name(), format!("{:#}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} benchmark panicked: {}", self.name(), message);
                BenchmarkResult::from_error(self.name(), format!("benchmark panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Seconds as a float fraction of a whole-second budget
pub(crate) fn fraction_of(duration_seconds: u32, divisor: u32) -> std::time::Duration {
    std::time::Duration::from_secs_f64(duration_seconds as f64 / divisor.max(1) as f64)
}
