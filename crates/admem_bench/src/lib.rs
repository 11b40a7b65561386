//! Benchmark utilities.

#![warn(missing_docs)]

use admem_core::{Blob, BlobConfig};
use admem_store::MemoryStore;
use rand::Rng;
use std::sync::Arc;

/// Blob size used by the allocator benchmarks.
pub const BENCH_BLOB_SIZE: u64 = 64 << 20;

/// Creates a memory-backed blob of [`BENCH_BLOB_SIZE`] bytes.
pub fn memory_blob() -> Blob {
    let store = Arc::new(MemoryStore::new(BENCH_BLOB_SIZE as usize));
    Blob::prepare_create("bench", BENCH_BLOB_SIZE, BlobConfig::new())
        .unwrap()
        .post_create(store)
        .unwrap()
}

/// Generates `count` reservation sizes between 8 and `max` bytes.
pub fn random_sizes(count: usize, max: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(8..=max)).collect()
}

/// Generates a payload of `size` random bytes.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}
