use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host Performance Suite - CPU, memory, disk, network and IPC benchmarks
/// with system context
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Modules to run (space-separated: cpu, memory, disk, network, ipc, integrated, or all)
    #[clap(short = 'm', long = "modules", value_enum, default_values_t = vec![ModuleKind::All], help_heading = "Core Options", num_args = 1..)]
    pub modules: Vec<ModuleKind>,

    /// Duration budget per module in seconds
    #[clap(short = 'd', long, default_value_t = crate::defaults::DURATION_SECONDS, value_parser = clap::value_parser!(u32).range(1..), help_heading = "Core Options")]
    pub duration: u32,

    /// Iterations per module
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATIONS, value_parser = clap::value_parser!(u32).range(1..), help_heading = "Core Options")]
    pub iterations: u32,

    /// Output file for the JSON report
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Run each module under system monitoring and score its reliability
    #[clap(long, default_value_t = false)]
    pub context: bool,

    /// Write monitor samples to this file (JSON for .json, CSV otherwise)
    #[clap(long)]
    pub telemetry_file: Option<PathBuf>,

    /// Do not open hardware performance counters
    #[clap(long, default_value_t = false)]
    pub no_perf_counters: bool,

    /// Quick pass with a one second budget and a single iteration
    #[clap(long, default_value_t = false)]
    pub dry_run: bool,

    /// Only measure the system baseline and print recommendations
    #[clap(long, default_value_t = false)]
    pub system_check: bool,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Benchmark modules selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Floating point, integer and cache latency
    #[clap(name = "cpu")]
    Cpu,

    /// Sequential bandwidth and random access
    #[clap(name = "memory")]
    Memory,

    /// Sequential and random file I/O
    #[clap(name = "disk")]
    Disk,

    /// Loopback TCP and UDP echo
    #[clap(name = "network")]
    Network,

    /// Shared memory between processes
    #[clap(name = "ipc")]
    Ipc,

    /// Workflows spanning several subsystems
    #[clap(name = "integrated")]
    Integrated,

    /// All available modules
    #[clap(name = "all")]
    All,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Cpu => write!(f, "CPU"),
            ModuleKind::Memory => write!(f, "Memory"),
            ModuleKind::Disk => write!(f, "Disk I/O"),
            ModuleKind::Network => write!(f, "Network"),
            ModuleKind::Ipc => write!(f, "IPC Shared Memory"),
            ModuleKind::Integrated => write!(f, "Integrated System"),
            ModuleKind::All => write!(f, "All Modules"),
        }
    }
}

impl ModuleKind {
    /// Expand the "All" variant to every module, dropping duplicates
    pub fn expand_all(modules: Vec<ModuleKind>) -> Vec<ModuleKind> {
        if modules.contains(&ModuleKind::All) {
            return vec![
                ModuleKind::Cpu,
                ModuleKind::Memory,
                ModuleKind::Disk,
                ModuleKind::Network,
                ModuleKind::Ipc,
                ModuleKind::Integrated,
            ];
        }
        let mut expanded = Vec::with_capacity(modules.len());
        for module in modules {
            if !expanded.contains(&module) {
                expanded.push(module);
            }
        }
        expanded
    }
}

/// Effective settings for one suite run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub modules: Vec<ModuleKind>,
    pub duration_seconds: u32,
    pub iterations: u32,
    pub with_context: bool,
    pub collect_perf_counters: bool,
    pub verbose: bool,
}

impl From<&Args> for RunConfiguration {
    fn from(args: &Args) -> Self {
        let (duration_seconds, iterations) = if args.dry_run {
            (1, 1)
        } else {
            (args.duration, args.iterations)
        };
        Self {
            modules: ModuleKind::expand_all(args.modules.clone()),
            duration_seconds,
            iterations,
            with_context: args.context,
            collect_perf_counters: !args.no_perf_counters,
            verbose: args.verbose,
        }
    }
}
