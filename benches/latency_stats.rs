use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use perf_suite::LatencyStats;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sample_set(n: usize) -> LatencyStats {
    let mut rng = StdRng::seed_from_u64(42);
    LatencyStats::from_samples((0..n).map(|_| rng.gen_range(0.01..50.0)).collect())
}

fn bench_latency_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("LatencyStats");

    group.bench_function("add_sample", |b| {
        let mut stats = LatencyStats::with_capacity(1024);
        b.iter(|| {
            if stats.count() == 1024 {
                stats.clear();
            }
            stats.add_sample(black_box(1.25));
        });
    });

    // summary() sorts a copy, so cost grows with the sample count
    for n in [1_000, 65_536] {
        let stats = sample_set(n);
        group.bench_with_input(BenchmarkId::new("summary", n), &stats, |b, stats| {
            b.iter(|| black_box(stats.summary()));
        });
        group.bench_with_input(BenchmarkId::new("p99", n), &stats, |b, stats| {
            b.iter(|| black_box(stats.percentile(99.0)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_latency_stats);
criterion_main!(benches);
