//! # Host Performance Suite - Main Entry Point
//!
//! The main function performs these operations:
//! 1. **Parse arguments** and initialize logging
//! 2. **System check** (optional): sample an idle baseline, print the
//!    interference verdict and recommendations, then exit
//! 3. **Run modules**: each selected module runs either plainly (with
//!    optional hardware counters) or inside the context analyzer
//! 4. **Telemetry** (optional): dump the monitor samples to a file
//! 5. **Finalize**: print the summary table and write the JSON report
//!
//! A failed module is recorded as an error result; the suite always runs
//! every selected module.

use anyhow::Result;
use clap::Parser;
use perf_suite::{
    benchmark::BenchmarkModule,
    cli::{Args, RunConfiguration},
    context::PerformanceContextAnalyzer,
    logging::init_logging,
    monitor::SystemMonitor,
    perf::{attach_to_result, CounterRequest, PerfCounterSet},
    results::{BenchmarkResult, ResultsManager},
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sampling window of `--system-check`
const SYSTEM_CHECK_WINDOW: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("Starting Host Performance Suite v{}", perf_suite::VERSION);
    debug!("Arguments: {:?}", args);

    if args.system_check {
        return system_check();
    }

    let config = RunConfiguration::from(&args);
    debug!("Configuration: {:?}", config);

    let mut results_manager = ResultsManager::new(args.output_file.as_deref());
    let mut analyzer = PerformanceContextAnalyzer::new();
    let mut telemetry_monitor = SystemMonitor::new();

    let modules: Vec<BenchmarkModule> = config
        .modules
        .iter()
        .filter_map(|&kind| {
            let module = BenchmarkModule::from_kind(kind);
            if module.is_none() {
                warn!("{} is not supported on this platform, skipping", kind);
            }
            module
        })
        .collect();

    if args.telemetry_file.is_some() && !config.with_context {
        if let Err(e) = telemetry_monitor.start_monitoring() {
            warn!("Telemetry monitoring unavailable: {:#}", e);
        }
    }

    for module in &modules {
        info!(
            "Running {} ({}s, {} iterations)",
            module.name(),
            config.duration_seconds,
            config.iterations
        );

        if config.with_context {
            let contextual = analyzer.run_with_context(
                module,
                config.duration_seconds,
                config.iterations,
                config.verbose,
                config.collect_perf_counters,
            );
            info!(
                "{} finished with reliability {:.0}/100",
                module.name(),
                contextual.reliability_score
            );
            results_manager.add_contextual(contextual);
        } else {
            results_manager.add_result(run_plain(module, &config));
        }
    }

    if let Some(path) = &args.telemetry_file {
        let monitor = if config.with_context {
            analyzer.monitor()
        } else {
            telemetry_monitor.stop_monitoring();
            &telemetry_monitor
        };
        match monitor.write_samples_to_file(path) {
            Ok(()) => info!("Telemetry written to: {:?}", path),
            Err(e) => warn!("Failed to write telemetry: {:#}", e),
        }
    }

    results_manager.finalize()?;

    let summary = results_manager.summary();
    info!(
        "Host Performance Suite completed: {} of {} modules succeeded",
        summary.succeeded, summary.total
    );
    Ok(())
}

/// Run a module with optional counters and annotate the result
fn run_plain(module: &BenchmarkModule, config: &RunConfiguration) -> BenchmarkResult {
    let mut counters = PerfCounterSet::new();
    let request = if config.collect_perf_counters {
        let started = match counters.start() {
            Ok(_) => true,
            Err(e) => {
                debug!("Hardware counters unavailable: {}", e);
                false
            }
        };
        CounterRequest::Requested { started }
    } else {
        CounterRequest::Disabled
    };

    let mut result = module.run(config.duration_seconds, config.iterations, config.verbose);
    let sample = counters.stop();
    attach_to_result(&mut result, &sample, request);
    result.add_build_metadata();
    result
}

/// Sample an idle window and report whether the host is fit to benchmark
fn system_check() -> Result<()> {
    info!("Sampling system baseline for {:?}", SYSTEM_CHECK_WINDOW);
    let mut analyzer = PerformanceContextAnalyzer::new();
    let baseline = analyzer.system_baseline(SYSTEM_CHECK_WINDOW)?;
    println!("{}", baseline.to_json());

    let monitor = analyzer.monitor();
    let interference = monitor.analyze_interference();
    println!("{}", interference.summary());
    for warning in &interference.performance_warnings {
        println!("  warning: {}", warning);
    }
    if monitor.is_system_busy() {
        println!("System load is high for benchmarking");
    }
    println!("Recommendations:");
    for recommendation in monitor.performance_recommendations() {
        println!("  - {}", recommendation);
    }
    Ok(())
}
