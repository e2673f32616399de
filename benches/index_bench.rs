//! Benchmarks for Feedline indexes
//!
//! Run with: cargo bench

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use feedline::index::{PrimaryIndex, VectorIndex, VectorIndexConfig};
use feedline::storage::{ChunkStore, Feed, FeedRef, Labels};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const DIMENSION: usize = 64;

fn random_vectors(count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..DIMENSION).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn build_index(vectors: &[Vec<f32>]) -> VectorIndex {
    let index = VectorIndex::with_seed(VectorIndexConfig::default(), 7);
    for (i, v) in vectors.iter().enumerate() {
        index.add(i as u64 + 1, vec![v.clone()]).unwrap();
    }
    index
}

fn bench_vector_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_insert");
    group.sample_size(10);

    for size in [1000, 5000] {
        let vectors = random_vectors(size, 1);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("insert_{}", size), |b| {
            b.iter(|| build_index(black_box(&vectors)))
        });
    }

    group.finish();
}

fn bench_vector_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_search");

    let index = build_index(&random_vectors(10_000, 2));
    let queries = random_vectors(100, 3);

    for limit in [10, 100] {
        group.bench_function(format!("search_top{}", limit), |b| {
            let mut i = 0;
            b.iter(|| {
                let q = &queries[i % queries.len()];
                i += 1;
                index
                    .search(black_box(std::slice::from_ref(q)), 0.0, limit)
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_vector_encode(c: &mut Criterion) {
    let index = build_index(&random_vectors(5000, 4));

    c.bench_function("vector_encode_5000", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            index.encode_to(&mut buf).unwrap();
            buf
        })
    });
}

fn bench_primary(c: &mut Criterion) {
    let mut group = c.benchmark_group("primary");
    let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let index = PrimaryIndex::new();
    for id in 0..100_000u64 {
        index.add(
            id,
            FeedRef {
                chunk: (id / 1000) as u32,
                offset: id * 512,
                time,
            },
        );
    }

    group.bench_function("search", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id = (id + 7919) % 100_000;
            index.search(black_box(id))
        })
    });

    let mut encoded = Vec::new();
    index.encode_to(&mut encoded).unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("decode_100000", |b| {
        b.iter_batched(
            PrimaryIndex::new,
            |restored| {
                restored.decode_from(&mut encoded.as_slice()).unwrap();
                restored
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_chunk_append(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = ChunkStore::open(dir.path(), 64 * 1024 * 1024).unwrap();
    let vectors = random_vectors(1, 5);
    let mut id = 0u64;

    c.bench_function("chunk_append", |b| {
        b.iter(|| {
            id += 1;
            let feed = Feed::new(
                id,
                Labels::new()
                    .with("source", "bench")
                    .with("content", "lorem ipsum dolor sit amet ".repeat(20)),
            );
            store.append(black_box(&feed), &vectors).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_vector_insert,
    bench_vector_search,
    bench_vector_encode,
    bench_primary,
    bench_chunk_append
);
criterion_main!(benches);
