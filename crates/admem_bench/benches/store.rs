//! Store adapter benchmarks.

use admem_bench::random_payload;
use admem_store::{FileStore, MemoryStore, Region, StoreAdapter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Benchmark MemoryStore WAL submission.
fn bench_memory_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_submit_wal");

    for size in [64, 256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = MemoryStore::new(4096);
            let payload = random_payload(size);
            b.iter(|| {
                let id = store.reserve_wal_id().unwrap();
                store.submit_wal(id, black_box(&payload)).unwrap();
                if id % 1024 == 0 {
                    store.discard_wal(id).unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark FileStore WAL submission, fsync included.
fn bench_file_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_submit_wal");

    // Use larger sample size for file operations
    group.sample_size(20);

    for size in [64, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let store = FileStore::create(&temp_dir.path().join("bench.blob"), 1 << 20).unwrap();
            let payload = random_payload(size);
            b.iter(|| {
                let id = store.reserve_wal_id().unwrap();
                store.submit_wal(id, black_box(&payload)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark FileStore region writes, as used by checkpoints.
fn bench_file_header_write(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::create(&temp_dir.path().join("bench.blob"), 1 << 20).unwrap();
    let header = random_payload(32 << 10);

    let mut group = c.benchmark_group("file_region_write");
    group.sample_size(20);
    group.throughput(Throughput::Bytes(header.len() as u64));
    group.bench_function("32KiB", |b| {
        b.iter(|| {
            store
                .write(Region::new(0, header.len() as u64), black_box(&header))
                .unwrap();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_memory_submit,
    bench_file_submit,
    bench_file_header_write
);
criterion_main!(benches);
