//! Store adapter trait definition.

use crate::error::{StoreError, StoreResult};

/// A WAL entry as handed back during recovery: `(wal_id, payload)`.
pub type WalEntryBytes = (u64, Vec<u8>);

/// A contiguous range of the store's durable region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Start address within the store.
    pub addr: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Region {
    /// Creates a region descriptor.
    #[must_use]
    pub const fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    /// Returns the exclusive end address, or `None` on overflow.
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.size)
    }

    /// Checks that the region fits in `capacity` and matches `buf_len`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SizeMismatch`] or [`StoreError::OutOfBounds`].
    pub fn check(&self, capacity: u64, buf_len: usize) -> StoreResult<()> {
        if buf_len as u64 != self.size {
            return Err(StoreError::SizeMismatch {
                region_size: self.size,
                buf_len,
            });
        }
        match self.end() {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                addr: self.addr,
                size: self.size,
                capacity,
            }),
        }
    }
}

/// The durable backing store of a blob.
///
/// A store is an **opaque region plus a write-ahead log**. The allocator
/// owns every format decision: the store never looks inside the header bytes
/// or the WAL payloads it persists.
///
/// # Invariants
///
/// - `read`/`write` buffers are exactly `region.size` bytes long
/// - `write` is durable when it returns `Ok`
/// - `reserve_wal_id` is strictly increasing and never reuses an id
/// - `submit_wal` is atomic: after a crash the entry is whole or absent
/// - `read_wal` returns entries in ascending id order
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent blobs
pub trait StoreAdapter: Send + Sync {
    /// Returns the number of addressable bytes of the region.
    fn capacity(&self) -> u64;

    /// Reads `region` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `buf.len()` differs from `region.size`
    /// - The region extends beyond the capacity
    /// - An I/O error occurs
    fn read(&self, region: Region, buf: &mut [u8]) -> StoreResult<()>;

    /// Writes `buf` to `region`, durably.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StoreAdapter::read`].
    fn write(&self, region: Region, buf: &[u8]) -> StoreResult<()>;

    /// Returns a fresh WAL id, strictly greater than every id handed out
    /// before by this store.
    ///
    /// # Errors
    ///
    /// Returns an error if the id counter cannot be advanced.
    fn reserve_wal_id(&self) -> StoreResult<u64>;

    /// Durably persists `payload` tagged with `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be made durable. In that case
    /// no trace of the entry may survive a crash.
    fn submit_wal(&self, id: u64, payload: &[u8]) -> StoreResult<()>;

    /// Returns every persisted entry with an id greater than `after`, in
    /// ascending id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    fn read_wal(&self, after: u64) -> StoreResult<Vec<WalEntryBytes>>;

    /// Discards every persisted entry with an id less than or equal to
    /// `upto`.
    ///
    /// Called after the allocator has checkpointed the state those entries
    /// describe. Ids handed out later must still be greater than `upto`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be rewritten.
    fn discard_wal(&self, upto: u64) -> StoreResult<()>;
}
