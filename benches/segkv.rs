// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use criterion::{criterion_group, criterion_main, Criterion};
use rand::RngCore;
use segkv::{Config, Store};

fn config() -> Config {
    Config::new(8_192, 4 * 1_024 * 1_024)
}

fn sequential_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential put");

    let sizes = [128usize, 1_024, 16_000, 128_000];

    for size in sizes {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let store = Store::create_preallocated(&path, 512 * 1_024 * 1_024, config()).unwrap();

        let mut rng = rand::thread_rng();
        let mut value = vec![0u8; size];
        rng.fill_bytes(&mut value);

        let mut i = 0u64;
        group.bench_function(format!("{size} bytes"), |b| {
            b.iter(|| {
                let key = i.to_le_bytes();
                store.put(&key, &value).unwrap();
                i += 1;
            })
        });

        store.close().unwrap();
    }
}

fn random_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("random get");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    let store = Store::create_preallocated(&path, 512 * 1_024 * 1_024, config()).unwrap();

    let count = 10_000u64;
    let mut rng = rand::thread_rng();
    let mut value = vec![0u8; 512];

    for i in 0..count {
        rng.fill_bytes(&mut value);
        store.put(&i.to_le_bytes(), &value).unwrap();
    }

    group.bench_function("512 bytes, cold cache", |b| {
        b.iter(|| {
            let key = (rng.next_u64() % count).to_le_bytes();
            store.get(&key).unwrap();
        })
    });

    // Warm a single key into the value cache, then measure a repeat hit.
    let hot_key = 0u64.to_le_bytes();
    store.get(&hot_key).unwrap();
    group.bench_function("512 bytes, cache hit", |b| {
        b.iter(|| {
            store.get(&hot_key).unwrap();
        })
    });

    store.close().unwrap();
}

criterion_group!(benches, sequential_put, random_get);
criterion_main!(benches);
