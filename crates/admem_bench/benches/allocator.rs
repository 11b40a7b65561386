//! Allocator benchmarks.

use admem_bench::{memory_blob, random_sizes};
use admem_core::ArenaHint;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark a reserve immediately undone by cancel.
fn bench_reserve_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_cancel");

    for size in [64u64, 1024, 65536].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let blob = memory_blob();
            b.iter(|| {
                let r = blob.reserve(ArenaHint::Any, black_box(size)).unwrap().unwrap();
                blob.cancel(r).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark publish + commit of one reservation per transaction.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for batch in [1usize, 8, 64].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            let mut blob = memory_blob();
            let mut committed = Vec::new();
            b.iter(|| {
                // Recreate before the blob fills up.
                if committed.len() > 100_000 {
                    blob = memory_blob();
                    committed.clear();
                }
                let held: Vec<_> = (0..batch)
                    .map(|_| blob.reserve(ArenaHint::Any, 64).unwrap().unwrap())
                    .collect();
                let mut tx = blob.begin().unwrap();
                for r in &held {
                    tx.publish(r).unwrap();
                }
                tx.commit().unwrap();
                committed.extend(held.iter().map(|r| r.addr()));
            });
        });
    }

    group.finish();
}

/// Benchmark reuse of freed space in a fragmented arena.
fn bench_fragmented_reuse(c: &mut Criterion) {
    let sizes = random_sizes(2_000, 512);
    let blob = memory_blob();

    let mut addrs = Vec::with_capacity(sizes.len());
    for &size in &sizes {
        let r = blob.reserve(ArenaHint::Any, size).unwrap().unwrap();
        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        tx.commit().unwrap();
        addrs.push(r.addr());
    }
    let mut tx = blob.begin().unwrap();
    for addr in addrs.iter().step_by(2) {
        tx.free(*addr).unwrap();
    }
    tx.commit().unwrap();

    c.bench_function("fragmented_reserve_cancel", |b| {
        let mut i = 0;
        b.iter(|| {
            let size = sizes[i % sizes.len()];
            i += 1;
            let r = blob.reserve(ArenaHint::Any, black_box(size)).unwrap().unwrap();
            blob.cancel(r).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_cancel,
    bench_commit,
    bench_fragmented_reuse
);
criterion_main!(benches);
