//! Test fixtures and blob helpers.
//!
//! Provides convenience functions for setting up test blobs and common
//! allocation scenarios.

use admem_core::{AllocResult, ArenaHint, Blob, BlobConfig};
use admem_store::{FileStore, MemoryStore, StoreAdapter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Identifier used by every fixture blob.
pub const TEST_IDENTIFIER: &str = "testkit-blob";

/// Default fixture blob size: a 32 KiB header, three 1 MiB arenas, a
/// clipped fourth one and the arenas' metadata blocks.
pub const TEST_BLOB_SIZE: u64 = 4 << 20;

/// Layout used by fixtures unless a test asks for another one.
pub fn test_config() -> BlobConfig {
    BlobConfig::new().arena_size(1 << 20).header_size(32 << 10)
}

/// A test blob with its store and automatic cleanup.
///
/// The blob can be crashed (dropped without close) and reopened against
/// the same store to exercise recovery.
pub struct TestBlob {
    blob: Option<Blob>,
    store: Arc<dyn StoreAdapter>,
    path: Option<PathBuf>,
    /// Kept alive to prevent cleanup.
    _temp_dir: Option<TempDir>,
}

impl TestBlob {
    /// Creates a blob of the default size over a memory store.
    pub fn memory() -> Self {
        Self::memory_with(TEST_BLOB_SIZE, test_config())
    }

    /// Creates a blob of `size` bytes over a memory store.
    pub fn memory_with(size: u64, config: BlobConfig) -> Self {
        let store = Arc::new(MemoryStore::new(size as usize));
        Self::with_store(store, size, config)
    }

    /// Creates a blob of the default size over a file store in a temp dir.
    pub fn file() -> Self {
        Self::file_with(TEST_BLOB_SIZE, test_config())
    }

    /// Creates a blob of `size` bytes over a file store in a temp dir.
    pub fn file_with(size: u64, config: BlobConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.blob");
        let store = Arc::new(FileStore::create(&path, size).expect("Failed to create file store"));
        let mut test_blob = Self::with_store(store, size, config);
        test_blob.path = Some(path);
        test_blob._temp_dir = Some(temp_dir);
        test_blob
    }

    /// Creates a blob over an existing store.
    pub fn with_store(store: Arc<dyn StoreAdapter>, size: u64, config: BlobConfig) -> Self {
        let blob = Blob::prepare_create(TEST_IDENTIFIER, size, config)
            .expect("Failed to prepare blob")
            .post_create(Arc::clone(&store))
            .expect("Failed to create blob");
        Self {
            blob: Some(blob),
            store,
            path: None,
            _temp_dir: None,
        }
    }

    /// Returns the open blob.
    pub fn blob(&self) -> &Blob {
        self.blob.as_ref().expect("Blob is crashed; call reopen first")
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    /// Returns the region file path if file-based.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drops the blob without closing it.
    pub fn crash(&mut self) {
        self.blob = None;
    }

    /// Crashes the blob if still open, then opens it again.
    ///
    /// # Errors
    ///
    /// Returns whatever `post_open` returns; the fixture then stays crashed.
    pub fn try_reopen(&mut self) -> AllocResult<&Blob> {
        self.crash();
        let blob = Blob::prepare_open(TEST_IDENTIFIER)?.post_open(Arc::clone(&self.store))?;
        let blob: &Blob = self.blob.insert(blob);
        Ok(blob)
    }

    /// Crashes the blob if still open, then opens it again.
    pub fn reopen(&mut self) -> &Blob {
        self.try_reopen().expect("Failed to reopen blob")
    }

    /// Closes the blob cleanly, then opens it again.
    pub fn close_and_reopen(&mut self) -> &Blob {
        self.blob().close().expect("Failed to close blob");
        self.reopen()
    }

    /// Crashes the blob, drops the file store and opens both from disk.
    ///
    /// # Panics
    ///
    /// Panics on a memory-backed fixture.
    pub fn reload_from_disk(&mut self) -> &Blob {
        let path = self.path.clone().expect("Fixture is not file-based");
        self.crash();
        // Releases the region file lock before reopening.
        self.store = Arc::new(MemoryStore::new(0));
        self.store = Arc::new(FileStore::open(&path).expect("Failed to reopen file store"));
        self.reopen()
    }
}

impl std::ops::Deref for TestBlob {
    type Target = Blob;

    fn deref(&self) -> &Self::Target {
        self.blob()
    }
}

/// Runs a test with a temporary memory-backed blob.
///
/// # Example
///
/// ```rust
/// use admem_testkit::fixtures::with_temp_blob;
///
/// with_temp_blob(|blob| {
///     assert_eq!(blob.arena_count(), 0);
/// });
/// ```
pub fn with_temp_blob<F, R>(f: F) -> R
where
    F: FnOnce(&Blob) -> R,
{
    let test_blob = TestBlob::memory();
    f(test_blob.blob())
}

/// Runs a test with a temporary file-backed blob.
pub fn with_file_blob<F, R>(f: F) -> R
where
    F: FnOnce(&Blob, &Path) -> R,
{
    let test_blob = TestBlob::file();
    let path = test_blob.path().expect("File blob should have a path");
    f(test_blob.blob(), path)
}

/// Reserves `size` bytes and commits them in a transaction of their own.
///
/// Returns the address, or `None` if the blob had no room.
///
/// # Errors
///
/// Returns the first error from reserve, publish or commit.
pub fn try_commit_alloc(blob: &Blob, hint: ArenaHint, size: u64) -> AllocResult<Option<u64>> {
    let Some(reservation) = blob.reserve(hint, size)? else {
        return Ok(None);
    };
    let addr = reservation.addr();
    let mut tx = blob.begin()?;
    tx.publish(&reservation)?;
    tx.commit()?;
    Ok(Some(addr))
}

/// Reserves and commits `size` bytes anywhere; panics on failure.
pub fn commit_alloc(blob: &Blob, size: u64) -> u64 {
    try_commit_alloc(blob, ArenaHint::Any, size)
        .expect("Failed to commit allocation")
        .expect("Blob is full")
}

/// Frees `addr` in a transaction of its own.
///
/// # Errors
///
/// Returns the error from free or commit.
pub fn commit_free(blob: &Blob, addr: u64) -> AllocResult<()> {
    let mut tx = blob.begin()?;
    tx.free(addr)?;
    tx.commit()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a memory blob holding `count` committed allocations of
    /// `size` bytes each; returns their addresses in commit order.
    pub fn populated_blob(count: usize, size: u64) -> (TestBlob, Vec<u64>) {
        let test_blob = TestBlob::memory();
        let addrs = (0..count).map(|_| commit_alloc(&test_blob, size)).collect();
        (test_blob, addrs)
    }

    /// Like [`populated_blob`], then frees every other allocation.
    pub fn fragmented_blob(count: usize, size: u64) -> (TestBlob, Vec<u64>) {
        let (test_blob, addrs) = populated_blob(count, size);
        let mut kept = Vec::with_capacity(count / 2 + 1);
        for (i, addr) in addrs.into_iter().enumerate() {
            if i % 2 == 0 {
                commit_free(&test_blob, addr).expect("Failed to free allocation");
            } else {
                kept.push(addr);
            }
        }
        (test_blob, kept)
    }
}
