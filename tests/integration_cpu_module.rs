use perf_suite::{BenchmarkModule, ModuleKind};

/// A short CPU run reports GOPS throughput and the full cache profile.
#[test]
fn cpu_module_short_run() {
    let module = BenchmarkModule::from_kind(ModuleKind::Cpu).expect("cpu module is always available");
    let result = module.run(2, 1, false);

    assert!(result.is_success(), "cpu run failed: {}", result.error_message);
    assert_eq!(result.name, "CPU");
    assert_eq!(result.throughput_unit, "GOPS");
    assert!(result.throughput > 0.0);
    assert_eq!(result.latency_unit, "us/op");

    for key in [
        "l1_cache_latency_ns",
        "l2_cache_latency_ns",
        "l3_cache_latency_ns",
        "mem_latency_ns",
    ] {
        let value = result.extra_metrics.get(key).copied();
        assert!(value.map_or(false, |v| v > 0.0), "{} = {:?}", key, value);
    }
    assert!(result.extra_metrics["threads_used"] >= 1.0);
    assert!(result.extra_metrics["threads_used"] <= result.extra_metrics["cpu_cores"]);
}
