/// Result cache benchmarks
///
/// 1. Hit path on a warm cache
/// 2. Insert under eviction pressure, by capacity
/// 3. Mixed hot/cold lookups
///
/// Run with: cargo bench --bench cache_throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prediction_gateway::cache::{CacheKey, PredictionCache};
use prediction_gateway::engine::FeatureValue;
use prediction_gateway::registry::VersionTag;
use std::time::Duration;

fn key(i: u64) -> CacheKey {
    CacheKey::new(
        VersionTag::new("bench", 1),
        vec![FeatureValue::Number(i as f64), FeatureValue::Number(0.5), FeatureValue::Category("red".into())],
    )
}

fn bench_hit(c: &mut Criterion) {
    let cache = PredictionCache::new(1024, Duration::from_secs(600));
    for i in 0..1024 {
        cache.insert(key(i), i as f64);
    }
    let probe = key(512);
    c.bench_function("cache_get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box(&probe))));
    });
}

fn bench_insert_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_insert_evicting");
    for capacity in [128usize, 1024, 16384] {
        let cache = PredictionCache::new(capacity, Duration::from_secs(600));
        let mut next = 0u64;
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            b.iter(|| {
                cache.insert(key(next), 1.0);
                next += 1;
            });
        });
    }
    group.finish();
}

fn bench_mixed(c: &mut Criterion) {
    let cache = PredictionCache::new(4096, Duration::from_secs(600));
    let mut i = 0u64;
    c.bench_function("cache_mixed_hot_cold", |b| {
        b.iter(|| {
            // 3 of 4 lookups go to a small hot set
            let k = if i % 4 == 0 { key(10_000 + i) } else { key(i % 64) };
            if cache.get(&k).is_none() {
                cache.insert(k, 1.0);
            }
            i += 1;
        });
    });
}

criterion_group!(benches, bench_hit, bench_insert_evicting, bench_mixed);
criterion_main!(benches);
