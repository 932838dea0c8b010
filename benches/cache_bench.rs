//! Benchmarks for the cache subsystem.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use tiered_cache::cache::codec::Codec;
use tiered_cache::cache::entry::{CacheEntry, EntryMetadata, Layer, Priority};
use tiered_cache::cache::eviction::{EvictionPolicy, Evictor};
use tiered_cache::cache::tracker::AccessTracker;
use tiered_cache::cache::{CacheManager, SetOptions};
use tiered_cache::config::Config;

fn bench_eviction_scoring(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let tracker = AccessTracker::new();
    let entries: Vec<CacheEntry<u64>> = (0..10_000u64)
        .map(|i| {
            let key = format!("key-{i}");
            for _ in 0..(i % 13) {
                tracker.record(&key);
            }
            let metadata = EntryMetadata {
                tags: HashSet::new(),
                priority: Priority::Normal,
                source: Layer::Hot,
            };
            CacheEntry::new(key, i, Duration::from_secs(60 + i % 600), 128 + (i as usize % 4096), metadata)
        })
        .collect();

    for policy in [EvictionPolicy::Lru, EvictionPolicy::Adaptive] {
        let evictor = Evictor::new(policy);
        c.bench_function(&format!("eviction_select_100_from_10k_{policy}"), |b| {
            b.iter(|| {
                let now = tokio::time::Instant::now();
                let victims = evictor.select_victims(
                    black_box(entries.iter().enumerate().map(|(i, e)| (i as u64, e))),
                    &tracker,
                    100,
                    now,
                );
                black_box(victims);
            })
        });
    }
}

fn bench_codec(c: &mut Criterion) {
    let codec = Codec::new(true, 1024, 3);
    let doc = json!({
        "id": 42,
        "name": "benchmark",
        "scores": (0..8192).map(|i| i % 97).collect::<Vec<u32>>(),
    });

    c.bench_function("codec_encode_compressed_8k", |b| {
        b.iter(|| black_box(codec.encode(black_box(&doc)).unwrap()))
    });

    let encoded = codec.encode(&doc).unwrap();
    c.bench_function("codec_decode_compressed_8k", |b| {
        b.iter(|| {
            let value: serde_json::Value = codec
                .decode(black_box(&encoded.payload), encoded.compressed)
                .unwrap();
            black_box(value);
        })
    });
}

fn bench_set_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::default();
    config.layers.hot.max_entries = 1_000;
    let cache = rt
        .block_on(async { CacheManager::<String>::new(Arc::new(config)) })
        .unwrap();

    rt.block_on(async {
        for i in 0..1_000 {
            cache
                .set(&format!("key-{i}"), format!("value-{i}"), SetOptions::default())
                .await
                .unwrap();
        }
    });

    c.bench_function("manager_get_hot_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 1_000;
            let key = format!("key-{i}");
            black_box(rt.block_on(cache.get(&key)));
        })
    });

    c.bench_function("manager_set_with_eviction", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("new-{i}");
            rt.block_on(cache.set(&key, "payload".to_string(), SetOptions::default()))
                .unwrap();
        })
    });
}

criterion_group!(benches, bench_eviction_scoring, bench_codec, bench_set_get);
criterion_main!(benches);
