use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use skyboard_core::{CategoryKey, DescriptorCache, NoProperties, Schema, SourceSelector};
use std::hint::black_box;

const KEYS: &[&str] = &[
    "environment.temperature.temperature",
    "environment.humidity.humidity",
    "environment.pressure.absolute",
    "environment.wind.speed",
    "environment.wind.gust",
    "environment.lightning.strike.distance",
];

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    // Warm: every key is already in the pool
    for key in KEYS {
        CategoryKey::parse(key).unwrap();
    }
    group.bench_function("interned", |b| {
        b.iter(|| {
            for key in KEYS {
                black_box(CategoryKey::parse(black_box(key)).unwrap());
            }
        })
    });

    let mut fresh = 0u64;
    group.bench_function("new", |b| {
        b.iter(|| {
            fresh += 1;
            black_box(CategoryKey::parse(&format!("bench.fresh.k{fresh}")).unwrap());
        })
    });
    group.finish();
}

fn bench_matches(c: &mut Criterion) {
    let pattern = CategoryKey::parse("environment.*.speed").unwrap();
    let concrete = CategoryKey::parse("environment.wind.speed").unwrap();
    c.bench_function("matches", |b| {
        b.iter(|| black_box(black_box(&pattern).matches(black_box(&concrete))))
    });
}

fn bench_resolve(c: &mut Criterion) {
    let schema = Schema::from_value(&json!({
        "environment": { "type": "number" },
        "environment.wind": { "type": "speed", "sourceUnit": "m/s" },
        "environment.wind.speed": { "title": "Wind Speed", "sourceKey": "wind_avg" },
        "environment.wind.gust": { "sourceKey": "wind_gust" }
    }))
    .unwrap();
    let key = CategoryKey::parse("environment.wind.speed").unwrap();
    let mut group = c.benchmark_group("resolve");

    group.bench_function(BenchmarkId::from_parameter("uncached"), |b| {
        b.iter(|| black_box(schema.resolve_uncached(black_box(&key), &NoProperties).unwrap()))
    });

    let cache = DescriptorCache::new();
    let source = SourceSelector::named("bench");
    group.bench_function(BenchmarkId::from_parameter("cached"), |b| {
        b.iter(|| black_box(cache.resolve(&schema, black_box(&key), &source, &NoProperties).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_matches, bench_resolve);
criterion_main!(benches);
