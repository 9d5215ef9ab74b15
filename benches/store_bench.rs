//! Benchmarks for the SimpleFS store.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use simplefs_cache::cache::codec::{Codec, Compression};
use simplefs_cache::cache::index::{EntryValue, Expiry, TtlIndex};
use simplefs_cache::config::{DirectorySize, StorageConfig};
use simplefs_cache::{SimpleFs, Storer};

fn bench_codecs(c: &mut Criterion) {
    // 64KB of semi-repetitive text, roughly an HTML page.
    let data: Vec<u8> = (0..64 * 1024).map(|i| b"<div class=\"row\">"[i % 17]).collect();

    for compression in [Compression::Lz4, Compression::Zstd] {
        let codec = Codec::with_compression(compression, 3);
        let encoded = codec.encode(&data).unwrap();

        c.bench_function(&format!("{compression}_encode_64kb"), |b| {
            b.iter(|| black_box(codec.encode(black_box(&data)).unwrap()))
        });
        c.bench_function(&format!("{compression}_decode_64kb"), |b| {
            b.iter(|| black_box(codec.decode(black_box(&encoded)).unwrap()))
        });
    }
}

fn bench_index(c: &mut Criterion) {
    let index = TtlIndex::new(10_000);
    for i in 0..10_000 {
        index.set(
            &format!("key-{i}"),
            EntryValue::File(format!("/cache/key-{i}").into()),
            Expiry::After(Duration::from_secs(3600)),
        );
    }

    c.bench_function("index_get_10k", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            black_box(index.get(&format!("key-{i}")));
        })
    });

    c.bench_function("index_range_backwards_first", |b| {
        b.iter(|| {
            let mut coldest = None;
            index.range_backwards(|key, _| {
                coldest = Some(key.to_string());
                false
            });
            black_box(coldest);
        })
    });
}

fn bench_store(c: &mut Criterion) {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = StorageConfig {
        path: Some(tmp.path().to_path_buf()),
        directory_size: DirectorySize::Bytes(4 * 1024 * 1024),
        ..Default::default()
    };
    let store = SimpleFs::provision(&config).unwrap();
    store.init().unwrap();

    let payload = vec![7u8; 16 * 1024];
    let ttl = Duration::from_secs(3600);

    c.bench_function("store_set_16kb_under_quota", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store.set(&format!("bench-{}", i % 512), black_box(&payload), ttl).unwrap();
        })
    });

    store.set("hot", &payload, ttl).unwrap();
    c.bench_function("store_get_16kb", |b| {
        b.iter(|| black_box(store.get("hot")))
    });
}

criterion_group!(benches, bench_codecs, bench_index, bench_store);
criterion_main!(benches);
