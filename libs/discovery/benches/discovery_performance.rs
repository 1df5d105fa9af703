//! Discovery hot-path benchmarks
//!
//! Measures selection cost per strategy over a 100-node service, the
//! cached path for hash-based lookups, and the lean configuration with
//! optional features disabled.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use discovery::{DiscoveryEngine, DiscoveryRequest, NodeInfo, RegistryConfig, ServiceKey, Strategy};

const NODES: u16 = 100;

fn populated(config: RegistryConfig) -> DiscoveryEngine {
    let engine = DiscoveryEngine::new(config).expect("valid config");
    let key = ServiceKey::new("bench").with_namespace("perf");
    for port in 1..=NODES {
        let info = NodeInfo::new("10.0.0.1", port)
            .with_weight(u32::from(port % 10) + 1)
            .with_tag(if port % 2 == 0 { "even" } else { "odd" })
            .with_location(f64::from(port % 90), f64::from(port % 180));
        engine.register(&key, &info).expect("register");
        engine.record_response_time(&format!("10.0.0.1:{}", port), f64::from(port));
    }
    engine
}

fn bench_strategies(c: &mut Criterion) {
    let mut config = RegistryConfig::default();
    config.cache.enabled = false;
    config.store.rng_seed = Some(1);
    let engine = populated(config);

    let mut group = c.benchmark_group("strategy_selection");
    for strategy in Strategy::ALL {
        let request = DiscoveryRequest::new("perf:bench")
            .with_strategy(strategy)
            .with_client("client-42");
        group.bench_with_input(BenchmarkId::from_parameter(strategy), &request, |b, request| {
            b.iter(|| black_box(engine.discover(black_box(request)).expect("node")));
        });
    }
    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_discovery");
    let request = DiscoveryRequest::new("perf:bench")
        .with_strategy(Strategy::ConsistentHash)
        .with_client("client-42");

    let cached = populated(RegistryConfig::default());
    group.bench_function("consistent_hash_cached", |b| {
        b.iter(|| black_box(cached.discover(black_box(&request)).expect("node")));
    });

    let mut config = RegistryConfig::default();
    config.cache.enabled = false;
    let uncached = populated(config);
    group.bench_function("consistent_hash_uncached", |b| {
        b.iter(|| black_box(uncached.discover(black_box(&request)).expect("node")));
    });
    group.finish();
}

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filtered_discovery");
    let request = DiscoveryRequest::new("perf:bench")
        .with_strategy(Strategy::RoundRobin)
        .with_tag("even");

    let indexed = populated(RegistryConfig::default());
    group.bench_function("indexed", |b| {
        b.iter(|| black_box(indexed.discover(black_box(&request)).expect("node")));
    });

    let lean = populated(RegistryConfig::lightning());
    group.bench_function("lightning_scan", |b| {
        b.iter(|| black_box(lean.discover(black_box(&request)).expect("node")));
    });
    group.finish();
}

fn bench_feedback(c: &mut Criterion) {
    let engine = populated(RegistryConfig::default());
    c.bench_function("record_response_time", |b| {
        b.iter(|| engine.record_response_time(black_box("10.0.0.1:50"), black_box(12.5)));
    });
    c.bench_function("heartbeat", |b| {
        b.iter(|| engine.heartbeat(black_box("10.0.0.1:50")));
    });
}

criterion_group!(benches, bench_strategies, bench_cache, bench_filters, bench_feedback);
criterion_main!(benches);
