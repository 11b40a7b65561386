//! In-memory store for testing.

use crate::adapter::{Region, StoreAdapter, WalEntryBytes};
use crate::error::StoreResult;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory store.
///
/// The region is a zero-filled byte vector of fixed capacity and the WAL is
/// an ordered map of submitted entries. Share it behind an `Arc` and drop
/// the blob handle without closing it to simulate a crash: everything the
/// store acknowledged is still there for the next open.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use admem_store::{MemoryStore, StoreAdapter};
///
/// let store = MemoryStore::new(1024);
/// let a = store.reserve_wal_id().unwrap();
/// let b = store.reserve_wal_id().unwrap();
/// assert!(b > a);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    region: RwLock<Vec<u8>>,
    wal: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_wal_id: AtomicU64,
}

impl MemoryStore {
    /// Creates a store with a zero-filled region of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            region: RwLock::new(vec![0u8; capacity]),
            wal: Mutex::new(BTreeMap::new()),
            next_wal_id: AtomicU64::new(1),
        }
    }

    /// Returns a copy of the region bytes.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn region_snapshot(&self) -> Vec<u8> {
        self.region.read().clone()
    }

    /// Returns the number of WAL entries currently retained.
    #[must_use]
    pub fn wal_len(&self) -> usize {
        self.wal.lock().len()
    }

    /// Overwrites bytes of the region without any checks.
    ///
    /// Used by tests to corrupt a header.
    pub fn poke(&self, addr: usize, bytes: &[u8]) {
        let mut region = self.region.write();
        region[addr..addr + bytes.len()].copy_from_slice(bytes);
    }
}

impl StoreAdapter for MemoryStore {
    fn capacity(&self) -> u64 {
        self.region.read().len() as u64
    }

    fn read(&self, region: Region, buf: &mut [u8]) -> StoreResult<()> {
        let data = self.region.read();
        region.check(data.len() as u64, buf.len())?;
        let start = region.addr as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, region: Region, buf: &[u8]) -> StoreResult<()> {
        let mut data = self.region.write();
        region.check(data.len() as u64, buf.len())?;
        let start = region.addr as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn reserve_wal_id(&self) -> StoreResult<u64> {
        Ok(self.next_wal_id.fetch_add(1, Ordering::SeqCst))
    }

    fn submit_wal(&self, id: u64, payload: &[u8]) -> StoreResult<()> {
        self.wal.lock().insert(id, payload.to_vec());
        Ok(())
    }

    fn read_wal(&self, after: u64) -> StoreResult<Vec<WalEntryBytes>> {
        let wal = self.wal.lock();
        Ok(wal
            .range(after.saturating_add(1)..)
            .map(|(id, payload)| (*id, payload.clone()))
            .collect())
    }

    fn discard_wal(&self, upto: u64) -> StoreResult<()> {
        let mut wal = self.wal.lock();
        let kept = wal.split_off(&upto.saturating_add(1));
        *wal = kept;
        self.next_wal_id.fetch_max(upto.saturating_add(1), Ordering::SeqCst);
        Ok(())
    }
}
