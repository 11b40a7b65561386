//! Blob lifecycle and the public allocator surface.

use crate::arena::{ArenaInfo, ArenaTable};
use crate::config::BlobConfig;
use crate::error::{AllocError, AllocResult};
use crate::header::{
    ArenaRecord, BlobHeader, HeaderPrefix, HEADER_PREFIX_SIZE, MAX_IDENTIFIER_LEN,
};
use crate::layout::{BlobLayout, HEADER_SLOTS};
use crate::metadata::{ArenaMetadata, MetadataSlot};
use crate::reservation::{Reservation, ReserveAttrs};
use crate::stats::{BlobStats, StatsSnapshot};
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{align_up, ArenaHint, ArenaId, WalId};
use admem_store::{Region, StoreAdapter};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

fn validate_identifier(identifier: &str) -> AllocResult<()> {
    if identifier.is_empty() {
        return Err(AllocError::invalid_argument("blob identifier is empty"));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(AllocError::invalid_argument(format!(
            "blob identifier is {} bytes, limit is {MAX_IDENTIFIER_LEN}",
            identifier.len()
        )));
    }
    Ok(())
}

/// Checks that a header slot can name every arena of `layout`.
fn check_slot_capacity(layout: &BlobLayout, identifier: &str) -> AllocResult<()> {
    let needed = BlobHeader::required_slot_size(identifier.len(), layout.max_arenas());
    if needed > layout.slot_size() {
        return Err(AllocError::invalid_argument(format!(
            "{} arenas need {needed}-byte header slots, header size {} gives {}",
            layout.max_arenas(),
            layout.header_size(),
            layout.slot_size()
        )));
    }
    Ok(())
}

/// Reads the allocation table a header record references.
fn load_metadata(
    store: &dyn StoreAdapter,
    layout: &BlobLayout,
    record: &ArenaRecord,
) -> AllocResult<BTreeMap<u64, u64>> {
    let slot = record.metadata();
    if slot.is_none() {
        return Ok(BTreeMap::new());
    }
    let region = layout
        .metadata_region(record.index, slot.copy)
        .ok_or_else(|| {
            AllocError::corrupt_header(format!("arena {} has no metadata block", record.index))
        })?;
    let len = usize::try_from(region.size)
        .map_err(|_| AllocError::corrupt_header("metadata block overflows memory"))?;
    let mut buf = vec![0u8; len];
    store
        .read(region, &mut buf)
        .map_err(|source| AllocError::StoreRead { source })?;

    let metadata = ArenaMetadata::decode(&buf, layout.arena_size(), layout.alignment())?;
    if metadata.arena != record.index
        || metadata.checkpoint_wal_id != slot.wal_id
        || metadata.watermark != record.watermark
        || metadata.allocations.len() != record.alloc_count as usize
    {
        return Err(AllocError::corrupt_header(format!(
            "arena {} metadata copy {} does not match the header",
            record.index, slot.copy
        )));
    }
    Ok(metadata.allocations)
}

/// First phase of blob creation: a validated layout, no store I/O yet.
///
/// Dropping it leaves no trace anywhere.
#[derive(Debug)]
pub struct PreparedCreate {
    header: BlobHeader,
    checkpoint_on_close: bool,
}

impl PreparedCreate {
    /// The identity the blob will be created with.
    #[must_use]
    pub fn blob_id(&self) -> Uuid {
        self.header.blob_id
    }

    /// Formats the blob on `store` and opens it.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidArgument`] if the store is smaller than the blob
    /// - [`AllocError::WalReserve`] if no checkpoint id can be obtained
    /// - [`AllocError::StoreWrite`] if the header cannot be written
    pub fn post_create(self, store: Arc<dyn StoreAdapter>) -> AllocResult<Blob> {
        let mut header = self.header;
        let layout = header.layout()?;
        if store.capacity() < header.total_size {
            return Err(AllocError::invalid_argument(format!(
                "store holds {} bytes, blob needs {}",
                store.capacity(),
                header.total_size
            )));
        }

        // Anything already in the log predates this blob.
        let floor = store
            .reserve_wal_id()
            .map_err(|source| AllocError::WalReserve { source })?;
        header.checkpoint_wal_id = floor;

        let bytes = header.encode()?;
        for slot in 0..HEADER_SLOTS {
            store
                .write(layout.slot_region(slot), &bytes)
                .map_err(|source| AllocError::StoreWrite { source })?;
        }
        store
            .discard_wal(floor)
            .map_err(|source| AllocError::StoreWrite { source })?;

        let arenas = ArenaTable::new(layout);
        info!(
            identifier = %header.identifier,
            blob_id = %header.blob_id,
            size = header.total_size,
            arenas = arenas.max_arenas(),
            "created blob"
        );
        Ok(Blob::assemble(header, store, arenas, 0, self.checkpoint_on_close))
    }
}

/// First phase of opening a blob: the identifier to expect, no store I/O.
#[derive(Debug, Clone)]
pub struct PreparedOpen {
    identifier: String,
    checkpoint_on_close: bool,
}

impl PreparedOpen {
    /// Sets whether `close` checkpoints. Defaults to `true`.
    #[must_use]
    pub fn checkpoint_on_close(mut self, value: bool) -> Self {
        self.checkpoint_on_close = value;
        self
    }

    /// Reads the newest valid header slot and the arena metadata it
    /// references, replays the WAL and opens the blob.
    ///
    /// # Errors
    ///
    /// - [`AllocError::StoreRead`] if the header or the log cannot be read
    /// - [`AllocError::CorruptHeader`] for a bad magic, checksum, layout or
    ///   identifier in both slots, or a damaged arena metadata block
    /// - [`AllocError::IncompatibleVersion`] for an unknown header version
    /// - [`AllocError::WalCorruption`] if a logged entry cannot be replayed
    pub fn post_open(self, store: Arc<dyn StoreAdapter>) -> AllocResult<Blob> {
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        store
            .read(Region::new(0, HEADER_PREFIX_SIZE as u64), &mut prefix)
            .map_err(|source| AllocError::StoreRead { source })?;
        let header_size = HeaderPrefix::decode(&prefix)?.header_size;
        if header_size > store.capacity() {
            return Err(AllocError::corrupt_header(format!(
                "header region of {header_size} bytes exceeds the store's {}",
                store.capacity()
            )));
        }

        let len = usize::try_from(header_size)
            .map_err(|_| AllocError::corrupt_header("header region overflows memory"))?;
        let mut buf = vec![0u8; len];
        store
            .read(Region::new(0, header_size), &mut buf)
            .map_err(|source| AllocError::StoreRead { source })?;
        let (slot, header) = BlobHeader::decode_newest(&buf)?;

        if header.identifier != self.identifier {
            return Err(AllocError::corrupt_header(format!(
                "store holds blob {:?}, expected {:?}",
                header.identifier, self.identifier
            )));
        }
        if store.capacity() < header.total_size {
            return Err(AllocError::corrupt_header(format!(
                "header describes {} bytes, store holds {}",
                header.total_size,
                store.capacity()
            )));
        }

        let layout = header
            .layout()
            .map_err(|e| AllocError::corrupt_header(e.to_string()))?;
        check_slot_capacity(&layout, &header.identifier)
            .map_err(|e| AllocError::corrupt_header(e.to_string()))?;
        let mut restored = Vec::with_capacity(header.arenas.len());
        for record in &header.arenas {
            let allocations = load_metadata(store.as_ref(), &layout, record)?;
            restored.push((record.clone(), allocations));
        }

        let arenas = ArenaTable::restore(layout, restored);
        let checkpoint = WalId::new(header.checkpoint_wal_id);
        let blob = Blob::assemble(header, store, arenas, slot, self.checkpoint_on_close);
        let replayed = blob.txns.recover(checkpoint)?;

        info!(
            identifier = %blob.identifier,
            blob_id = %blob.blob_id,
            checkpoint = checkpoint.as_u64(),
            header_slot = slot,
            replayed,
            arenas = blob.arena_count(),
            "opened blob"
        );
        Ok(blob)
    }
}

/// A durable byte-addressable region managed as arenas.
///
/// All allocator state hangs off this handle. Dropping it without
/// [`Blob::close`] behaves like a crash: committed transactions survive in
/// the store, everything else is forgotten.
///
/// # Example
///
/// ```rust
/// use admem_core::{ArenaHint, Blob, BlobConfig};
/// use admem_store::MemoryStore;
/// use std::sync::Arc;
///
/// let config = BlobConfig::new().arena_size(1 << 16).header_size(4096);
/// let store = Arc::new(MemoryStore::new(1 << 20));
/// let blob = Blob::prepare_create("example", 1 << 20, config)
///     .unwrap()
///     .post_create(store)
///     .unwrap();
///
/// let reservation = blob.reserve(ArenaHint::Any, 100).unwrap().unwrap();
/// let mut tx = blob.begin().unwrap();
/// tx.publish(&reservation).unwrap();
/// tx.commit().unwrap();
///
/// assert_eq!(blob.allocated_bytes(), 104);
/// blob.close().unwrap();
/// ```
#[derive(Debug)]
pub struct Blob {
    identifier: String,
    blob_id: Uuid,
    header_size: u64,
    total_size: u64,
    alignment: u64,
    checkpoint_on_close: bool,
    arenas: Arc<ArenaTable>,
    stats: Arc<BlobStats>,
    txns: TransactionManager,
    next_cookie: AtomicU64,
    /// Header slot holding the newest durable checkpoint.
    header_slot: AtomicUsize,
}

impl Blob {
    /// Validates a layout for a new blob of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] for an empty or overlong
    /// identifier, a zero size, an invalid config, a header region that
    /// does not leave room for arenas, or header slots too small to record
    /// every arena.
    pub fn prepare_create(
        identifier: &str,
        size: u64,
        config: BlobConfig,
    ) -> AllocResult<PreparedCreate> {
        validate_identifier(identifier)?;
        if size == 0 {
            return Err(AllocError::invalid_argument("blob size is zero"));
        }
        config.validate()?;
        if config.header_size >= size {
            return Err(AllocError::invalid_argument(format!(
                "header size {} leaves no room in a {size}-byte blob",
                config.header_size
            )));
        }
        let layout = BlobLayout::new(
            config.header_size,
            size,
            config.arena_size,
            config.alignment,
        )?;
        check_slot_capacity(&layout, identifier)?;

        let header = BlobHeader {
            header_size: config.header_size,
            total_size: size,
            arena_size: config.arena_size,
            alignment: config.alignment,
            blob_id: Uuid::new_v4(),
            checkpoint_wal_id: 0,
            identifier: identifier.to_string(),
            arenas: Vec::new(),
        };

        Ok(PreparedCreate {
            header,
            checkpoint_on_close: config.checkpoint_on_close,
        })
    }

    /// Prepares to open the blob named `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] for an empty or overlong
    /// identifier.
    pub fn prepare_open(identifier: &str) -> AllocResult<PreparedOpen> {
        validate_identifier(identifier)?;
        Ok(PreparedOpen {
            identifier: identifier.to_string(),
            checkpoint_on_close: true,
        })
    }

    fn assemble(
        header: BlobHeader,
        store: Arc<dyn StoreAdapter>,
        arenas: ArenaTable,
        header_slot: usize,
        checkpoint_on_close: bool,
    ) -> Self {
        let arenas = Arc::new(arenas);
        let stats = Arc::new(BlobStats::new());
        let txns = TransactionManager::new(
            store,
            Arc::clone(&arenas),
            Arc::clone(&stats),
            WalId::new(header.checkpoint_wal_id),
        );
        Self {
            identifier: header.identifier,
            blob_id: header.blob_id,
            header_size: header.header_size,
            total_size: header.total_size,
            alignment: header.alignment,
            checkpoint_on_close,
            arenas,
            stats,
            txns,
            next_cookie: AtomicU64::new(1),
            header_slot: AtomicUsize::new(header_slot),
        }
    }

    // === Accessors ===

    /// The blob's name.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Identity assigned at create time.
    #[must_use]
    pub fn blob_id(&self) -> Uuid {
        self.blob_id
    }

    /// Total size in bytes, header included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// Bytes reserved for the header at address 0.
    #[must_use]
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Size of every arena except possibly the last.
    #[must_use]
    pub fn arena_size(&self) -> u64 {
        self.arenas.arena_size()
    }

    /// Allocation granularity.
    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Returns `true` until [`Blob::close`] succeeds.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.txns.is_closed()
    }

    /// Number of arenas materialized so far.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.arenas.count()
    }

    /// Number of arenas the blob can hold.
    #[must_use]
    pub fn max_arenas(&self) -> u32 {
        self.arenas.max_arenas()
    }

    /// WAL id of the last committed transaction.
    #[must_use]
    pub fn last_committed(&self) -> WalId {
        self.txns.last_committed()
    }

    /// Number of transactions begun and not yet resolved.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.txns.open_transactions()
    }

    /// Bytes covered by committed allocations. Lock-free.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.stats.allocated_bytes()
    }

    /// Snapshot of the blob's counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// State of arena `id`, or `None` if it is not materialized yet.
    ///
    /// # Errors
    ///
    /// - [`AllocError::UseAfterClose`] if the blob is closed
    /// - [`AllocError::InvalidArgument`] if `id` is beyond the blob
    pub fn arena_info(&self, id: ArenaId) -> AllocResult<Option<ArenaInfo>> {
        self.txns.ensure_open()?;
        if id.as_u32() >= self.arenas.max_arenas() {
            return Err(AllocError::invalid_argument(format!(
                "{id} is beyond the blob's {} arenas",
                self.arenas.max_arenas()
            )));
        }
        Ok(self.arenas.get(id).map(|a| a.lock().info()))
    }

    // === Reservations ===

    /// Reserves `size` bytes, rounded up to the blob alignment.
    ///
    /// Returns `Ok(None)` when no arena allowed by `hint` has room.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidArgument`] for a zero size, a size larger than
    ///   an arena, or a hint beyond the blob
    /// - [`AllocError::UseAfterClose`] if the blob is closed
    pub fn reserve(&self, hint: ArenaHint, size: u64) -> AllocResult<Option<Reservation>> {
        self.reserve_with(hint, size, &ReserveAttrs::default())
    }

    /// Like [`Blob::reserve`], with extra per-request constraints.
    ///
    /// # Errors
    ///
    /// As [`Blob::reserve`], plus [`AllocError::InvalidArgument`] for an
    /// alignment that is not a power of two.
    pub fn reserve_with(
        &self,
        hint: ArenaHint,
        size: u64,
        attrs: &ReserveAttrs,
    ) -> AllocResult<Option<Reservation>> {
        self.txns.ensure_open()?;
        if size == 0 {
            return Err(AllocError::invalid_argument("reservation size is zero"));
        }
        if size > self.arenas.arena_size() {
            return Err(AllocError::invalid_argument(format!(
                "reservation of {size} bytes exceeds the arena size {}",
                self.arenas.arena_size()
            )));
        }
        let align = attrs.effective_alignment(self.alignment)?;
        let len = align_up(size, self.alignment)
            .ok_or_else(|| AllocError::invalid_argument("reservation size overflows"))?;

        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        match self.arenas.reserve(hint, len, align, cookie)? {
            Some(placement) => {
                self.stats.record_reservation(len);
                let reservation = Reservation::new(
                    placement.arena,
                    placement.base,
                    placement.offset,
                    len,
                    cookie,
                    self.txns.incarnation(),
                    placement.source,
                );
                debug!(
                    addr = reservation.addr(),
                    len,
                    arena = placement.arena.as_u32(),
                    source = ?placement.source,
                    "reserved"
                );
                Ok(Some(reservation))
            }
            None => {
                self.stats.record_reservation_miss(len);
                debug!(size, ?hint, "no space for reservation");
                Ok(None)
            }
        }
    }

    /// Gives an unpublished reservation back. Never touches the store.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidOperation`] if the reservation is published in
    ///   an open transaction
    /// - [`AllocError::InvalidArgument`] if it belongs to another handle or
    ///   is no longer outstanding
    /// - [`AllocError::UseAfterClose`] if the blob is closed
    pub fn cancel(&self, reservation: Reservation) -> AllocResult<()> {
        self.txns.ensure_open()?;
        if reservation.incarnation() != self.txns.incarnation() {
            return Err(AllocError::invalid_argument(format!(
                "reservation at {:#x} belongs to another blob handle",
                reservation.addr()
            )));
        }
        self.txns
            .arena(reservation.arena())?
            .lock()
            .cancel(reservation.cookie())?;
        self.stats.record_cancel();
        debug!(addr = reservation.addr(), len = reservation.len(), "canceled reservation");
        Ok(())
    }

    // === Transactions ===

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// - [`AllocError::WalReserve`] if the store cannot hand out an id
    /// - [`AllocError::InvalidOperation`] if the store handed out an id that
    ///   does not follow the last committed one
    /// - [`AllocError::UseAfterClose`] if the blob is closed
    pub fn begin(&self) -> AllocResult<Transaction<'_>> {
        self.txns.begin()
    }

    // === Lifecycle ===

    /// Writes the committed state into the header and trims the WAL.
    ///
    /// Every arena whose allocation table changed gets its spare metadata
    /// block rewritten, then the header goes to the slot not holding the
    /// current checkpoint. The WAL is trimmed only once that slot is
    /// durable; on failure the previous checkpoint stays in force.
    ///
    /// # Errors
    ///
    /// - [`AllocError::StoreWrite`] if a metadata block, the header or the
    ///   log trim fails
    /// - [`AllocError::UseAfterClose`] if the blob is closed
    pub fn checkpoint(&self) -> AllocResult<()> {
        self.txns.ensure_open()?;
        let _commits = self.txns.lock_commits();
        self.txns.ensure_open()?;
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> AllocResult<()> {
        let last = self.txns.last_committed();
        let store = self.txns.store();
        let layout = self.arenas.layout();

        let mut records = Vec::new();
        let mut rewritten = Vec::new();
        for arena in self.arenas.snapshot() {
            let (mut record, changed) = {
                let guard = arena.lock();
                (guard.record(), guard.is_dirty().then(|| guard.metadata(last)))
            };
            if let Some(metadata) = changed {
                let slot = if metadata.allocations.is_empty() {
                    MetadataSlot::NONE
                } else {
                    let copy = record.metadata().next_copy();
                    let region = layout.metadata_region(record.index, copy).ok_or_else(|| {
                        AllocError::invalid_operation(format!(
                            "arena {} has no metadata block",
                            record.index
                        ))
                    })?;
                    let bytes = metadata.encode(layout.arena_size(), layout.alignment())?;
                    store
                        .write(region, &bytes)
                        .map_err(|source| AllocError::StoreWrite { source })?;
                    debug!(
                        arena = record.index,
                        copy,
                        wal_id = last.as_u64(),
                        "wrote arena metadata"
                    );
                    MetadataSlot {
                        wal_id: last.as_u64(),
                        copy,
                    }
                };
                record.metadata_wal_id = slot.wal_id;
                record.metadata_copy = slot.copy;
                rewritten.push((arena, slot));
            }
            records.push(record);
        }

        let header = BlobHeader {
            header_size: self.header_size,
            total_size: self.total_size,
            arena_size: layout.arena_size(),
            alignment: self.alignment,
            blob_id: self.blob_id,
            checkpoint_wal_id: last.as_u64(),
            identifier: self.identifier.clone(),
            arenas: records,
        };
        let bytes = header.encode()?;
        let slot = (self.header_slot.load(Ordering::Acquire) + 1) % HEADER_SLOTS;
        store
            .write(layout.slot_region(slot), &bytes)
            .map_err(|source| AllocError::StoreWrite { source })?;

        self.header_slot.store(slot, Ordering::Release);
        for (arena, metadata) in rewritten {
            arena.lock().mark_durable(metadata);
        }
        store
            .discard_wal(last.as_u64())
            .map_err(|source| AllocError::StoreWrite { source })?;

        self.stats.record_checkpoint();
        info!(
            identifier = %self.identifier,
            wal_id = last.as_u64(),
            header_slot = slot,
            "checkpointed blob"
        );
        Ok(())
    }

    /// Closes the blob. Idempotent.
    ///
    /// Waits for an in-flight commit, checkpoints if enabled, then releases
    /// all arena state. Later operations fail with
    /// [`AllocError::UseAfterClose`].
    ///
    /// # Errors
    ///
    /// Returns the checkpoint's error; the blob then stays open.
    pub fn close(&self) -> AllocResult<()> {
        let _commits = self.txns.lock_commits();
        if self.txns.is_closed() {
            return Ok(());
        }
        if self.checkpoint_on_close {
            self.checkpoint_locked()?;
        }
        self.txns.mark_closed();
        self.arenas.clear();
        info!(identifier = %self.identifier, "closed blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ReservationSource;
    use admem_store::MemoryStore;

    const MIB: u64 = 1 << 20;

    fn config() -> BlobConfig {
        BlobConfig::new().arena_size(MIB).header_size(32 << 10)
    }

    fn create_blob() -> (Arc<MemoryStore>, Blob) {
        let store = Arc::new(MemoryStore::new((4 * MIB) as usize));
        let blob = Blob::prepare_create("test-blob", 4 * MIB, config())
            .unwrap()
            .post_create(store.clone())
            .unwrap();
        (store, blob)
    }

    fn reopen(store: &Arc<MemoryStore>) -> Blob {
        Blob::prepare_open("test-blob")
            .unwrap()
            .post_open(store.clone())
            .unwrap()
    }

    fn commit_one(blob: &Blob, size: u64) -> u64 {
        let r = blob.reserve(ArenaHint::Any, size).unwrap().unwrap();
        let addr = r.addr();
        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        tx.commit().unwrap();
        addr
    }

    #[test]
    fn create_and_open() {
        let (store, blob) = create_blob();
        assert!(blob.is_open());
        assert_eq!(blob.identifier(), "test-blob");
        assert_eq!(blob.size(), 4 * MIB);
        assert_eq!(blob.max_arenas(), 4);
        assert_eq!(blob.arena_count(), 0);
        let id = blob.blob_id();
        blob.close().unwrap();

        let reopened = reopen(&store);
        assert_eq!(reopened.blob_id(), id);
        assert_eq!(reopened.arena_size(), MIB);
        assert_eq!(reopened.header_size(), 32 << 10);
    }

    #[test]
    fn prepare_create_validates() {
        assert!(matches!(
            Blob::prepare_create("x", 0, config()),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert!(Blob::prepare_create("", MIB, config()).is_err());
        assert!(Blob::prepare_create(&"n".repeat(300), 4 * MIB, config()).is_err());
        assert!(Blob::prepare_create("x", 16 << 10, config()).is_err());
        assert!(Blob::prepare_create("x", 4 * MIB, config().alignment(12)).is_err());
    }

    #[test]
    fn post_create_rejects_small_store() {
        let store = Arc::new(MemoryStore::new(MIB as usize));
        let result = Blob::prepare_create("test-blob", 4 * MIB, config())
            .unwrap()
            .post_create(store);
        assert!(matches!(result, Err(AllocError::InvalidArgument { .. })));
    }

    #[test]
    fn open_with_wrong_identifier_fails() {
        let (store, blob) = create_blob();
        blob.close().unwrap();
        let result = Blob::prepare_open("other").unwrap().post_open(store);
        assert!(matches!(result, Err(AllocError::CorruptHeader { .. })));
    }

    #[test]
    fn open_unformatted_store_fails() {
        let store = Arc::new(MemoryStore::new(MIB as usize));
        let result = Blob::prepare_open("test-blob").unwrap().post_open(store);
        assert!(matches!(result, Err(AllocError::CorruptHeader { .. })));
    }

    #[test]
    fn open_newer_version_is_incompatible() {
        let (store, blob) = create_blob();
        blob.close().unwrap();
        store.poke(4, &9u16.to_le_bytes());
        let result = Blob::prepare_open("test-blob").unwrap().post_open(store);
        assert!(matches!(
            result,
            Err(AllocError::IncompatibleVersion { found: 9, .. })
        ));
    }

    #[test]
    fn reserve_rounds_to_alignment() {
        let (_store, blob) = create_blob();
        let r = blob.reserve(ArenaHint::Any, 13).unwrap().unwrap();
        assert_eq!(r.len(), 16);
        assert_eq!(r.addr(), 32 << 10);
        assert_eq!(r.arena(), ArenaId::new(0));
        assert_eq!(r.source(), ReservationSource::Extension);
    }

    #[test]
    fn reserve_rejects_bad_sizes() {
        let (_store, blob) = create_blob();
        assert!(matches!(
            blob.reserve(ArenaHint::Any, 0),
            Err(AllocError::InvalidArgument { .. })
        ));
        assert!(blob.reserve(ArenaHint::Any, MIB + 1).is_err());
        assert!(blob
            .reserve(ArenaHint::Arena(ArenaId::new(4)), 8)
            .is_err());
    }

    #[test]
    fn reserve_with_alignment() {
        let (_store, blob) = create_blob();
        blob.reserve(ArenaHint::Any, 8).unwrap().unwrap();
        let attrs = ReserveAttrs::new().alignment(4096);
        let r = blob
            .reserve_with(ArenaHint::Any, 8, &attrs)
            .unwrap()
            .unwrap();
        assert_eq!(r.addr() % 4096, 0);
        assert!(blob
            .reserve_with(ArenaHint::Any, 8, &ReserveAttrs::new().alignment(3))
            .is_err());
    }

    #[test]
    fn reserve_returns_none_when_full() {
        let (_store, blob) = create_blob();
        let mut held = Vec::new();
        while let Some(r) = blob.reserve(ArenaHint::Any, MIB / 2).unwrap() {
            held.push(r);
        }
        // The clipped last arena holds one half-arena less.
        assert_eq!(held.len(), 7);
        assert_eq!(blob.stats().reservation_misses, 1);
    }

    #[test]
    fn cancel_then_reserve_returns_same_address() {
        let (_store, blob) = create_blob();
        let first = blob.reserve(ArenaHint::Any, 128).unwrap().unwrap();
        let addr = first.addr();
        blob.cancel(first).unwrap();
        let second = blob.reserve(ArenaHint::Any, 128).unwrap().unwrap();
        assert_eq!(second.addr(), addr);
    }

    #[test]
    fn commit_publishes_and_raises_watermark() {
        let (_store, blob) = create_blob();
        let addr = commit_one(&blob, 256);
        let info = blob.arena_info(ArenaId::new(0)).unwrap().unwrap();
        assert_eq!(info.watermark, 256);
        assert_eq!(info.allocations.get(&(addr - info.base)), Some(&256));
        assert_eq!(blob.allocated_bytes(), 256);
        assert_eq!(blob.stats().transactions_committed, 1);
    }

    #[test]
    fn publish_twice_is_invalid_operation() {
        let (_store, blob) = create_blob();
        let r = blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        assert!(matches!(
            tx.publish(&r),
            Err(AllocError::InvalidOperation { .. })
        ));
        tx.abort();
    }

    #[test]
    fn cancel_of_staged_reservation_fails() {
        let (_store, blob) = create_blob();
        let r = blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
        let duplicate = Reservation::new(
            r.arena(),
            r.addr() - r.offset(),
            r.offset(),
            r.len(),
            r.cookie(),
            r.incarnation(),
            r.source(),
        );
        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        assert!(matches!(
            blob.cancel(duplicate),
            Err(AllocError::InvalidOperation { .. })
        ));
        tx.abort();
        blob.cancel(r).unwrap();
    }

    #[test]
    fn abort_leaves_reservation_outstanding() {
        let (_store, blob) = create_blob();
        let r = blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
        {
            let mut tx = blob.begin().unwrap();
            tx.publish(&r).unwrap();
            // dropped: aborts
        }
        assert_eq!(blob.allocated_bytes(), 0);
        assert_eq!(blob.open_transactions(), 0);

        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        tx.end(false).unwrap();
        assert_eq!(blob.allocated_bytes(), 64);
    }

    #[test]
    fn free_then_reuse_after_commit() {
        let (_store, blob) = create_blob();
        let addr = commit_one(&blob, 256);
        let _after = commit_one(&blob, 64);

        let mut tx = blob.begin().unwrap();
        tx.free(addr).unwrap();
        // Not reusable before the free commits.
        let r = blob.reserve(ArenaHint::Any, 256).unwrap().unwrap();
        assert_ne!(r.addr(), addr);
        blob.cancel(r).unwrap();

        tx.commit().unwrap();
        let r = blob.reserve(ArenaHint::Any, 256).unwrap().unwrap();
        assert_eq!(r.addr(), addr);
        assert_eq!(r.source(), ReservationSource::FreeExtent);
    }

    #[test]
    fn invalid_frees() {
        let (_store, blob) = create_blob();
        let addr = commit_one(&blob, 256);

        let mut tx = blob.begin().unwrap();
        assert!(matches!(
            tx.free(addr + 8),
            Err(AllocError::InvalidFree { .. })
        ));
        assert!(matches!(tx.free(0), Err(AllocError::InvalidFree { .. })));
        tx.free(addr).unwrap();
        assert!(matches!(
            tx.free(addr),
            Err(AllocError::InvalidFree { .. })
        ));
        tx.commit().unwrap();

        let mut tx = blob.begin().unwrap();
        assert!(tx.free(addr).is_err());
    }

    #[test]
    fn competing_frees_second_commit_fails() {
        let (_store, blob) = create_blob();
        let addr = commit_one(&blob, 128);

        let mut first = blob.begin().unwrap();
        let mut second = blob.begin().unwrap();
        first.free(addr).unwrap();
        second.free(addr).unwrap();

        first.commit().unwrap();
        assert!(matches!(
            second.commit(),
            Err(AllocError::InvalidFree { .. })
        ));
        assert_eq!(blob.allocated_bytes(), 0);
        assert_eq!(blob.stats().transactions_aborted, 1);
    }

    #[test]
    fn same_thread_out_of_order_commit_is_rejected() {
        let (_store, blob) = create_blob();
        let first = blob.begin().unwrap();
        let second = blob.begin().unwrap();
        assert!(first.id() < second.id());

        assert!(matches!(
            second.commit(),
            Err(AllocError::InvalidOperation { .. })
        ));
        first.commit().unwrap();
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let (store, blob) = create_blob();
        let tx = blob.begin().unwrap();
        let id = tx.id();
        tx.commit().unwrap();
        assert_eq!(store.wal_len(), 0);
        assert_eq!(blob.last_committed(), id);
    }

    #[test]
    fn operations_after_close_fail() {
        let (_store, blob) = create_blob();
        blob.close().unwrap();
        blob.close().unwrap();
        assert!(!blob.is_open());
        assert!(matches!(
            blob.reserve(ArenaHint::Any, 8),
            Err(AllocError::UseAfterClose)
        ));
        assert!(matches!(blob.begin(), Err(AllocError::UseAfterClose)));
        assert!(matches!(blob.checkpoint(), Err(AllocError::UseAfterClose)));
        assert!(blob.arena_info(ArenaId::new(0)).is_err());
    }

    #[test]
    fn reservation_from_previous_open_is_rejected() {
        let (store, blob) = create_blob();
        let stale = blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
        drop(blob);

        let blob = reopen(&store);
        assert!(matches!(
            blob.cancel(stale),
            Err(AllocError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn crash_recovery_replays_wal() {
        let (store, blob) = create_blob();
        let a = commit_one(&blob, 128);
        let b = commit_one(&blob, 64);
        let _lost = blob.reserve(ArenaHint::Any, 512).unwrap().unwrap();
        let before = blob.arena_info(ArenaId::new(0)).unwrap().unwrap();
        drop(blob);

        let blob = reopen(&store);
        let after = blob.arena_info(ArenaId::new(0)).unwrap().unwrap();
        assert_eq!(after.watermark, before.watermark);
        assert_eq!(after.allocations, before.allocations);
        assert_eq!(after.tentative, after.watermark);
        assert_eq!(blob.allocated_bytes(), 192);
        assert_eq!(blob.stats().wal_entries_replayed, 2);
        assert!(after.allocations.contains_key(&(a - after.base)));
        assert!(after.allocations.contains_key(&(b - after.base)));
    }

    #[test]
    fn checkpoint_trims_wal_and_survives_reopen() {
        let (store, blob) = create_blob();
        commit_one(&blob, 128);
        commit_one(&blob, 128);
        assert_eq!(store.wal_len(), 2);

        blob.checkpoint().unwrap();
        assert_eq!(store.wal_len(), 0);
        commit_one(&blob, 128);
        drop(blob);

        let blob = reopen(&store);
        assert_eq!(blob.stats().wal_entries_replayed, 1);
        assert_eq!(blob.allocated_bytes(), 384);
    }

    #[test]
    fn header_too_small_for_every_arena_is_rejected() {
        // 4096 arenas of 1 KiB cannot be named by 512-byte header slots.
        let config = BlobConfig::new().arena_size(1024).header_size(1024);
        assert!(matches!(
            Blob::prepare_create("test-blob", 4 * MIB, config),
            Err(AllocError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn header_size_beyond_the_store_is_rejected_before_reading() {
        let (store, blob) = create_blob();
        blob.close().unwrap();

        store.poke(8, &(16 * MIB).to_le_bytes());
        assert!(matches!(
            Blob::prepare_open("test-blob").unwrap().post_open(store.clone()),
            Err(AllocError::CorruptHeader { .. })
        ));

        store.poke(8, &u64::MAX.to_le_bytes());
        assert!(matches!(
            Blob::prepare_open("test-blob").unwrap().post_open(store),
            Err(AllocError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn checkpoints_alternate_header_slots() {
        const SLOT: usize = 16 << 10;
        let slot = |store: &MemoryStore, index: usize| {
            store.region_snapshot()[index * SLOT..(index + 1) * SLOT].to_vec()
        };
        let (store, blob) = create_blob();
        assert_eq!(slot(&store, 0), slot(&store, 1));
        let created = slot(&store, 1);

        commit_one(&blob, 64);
        blob.checkpoint().unwrap();
        let first = slot(&store, 0);
        assert_ne!(slot(&store, 1), created);

        commit_one(&blob, 64);
        blob.checkpoint().unwrap();
        assert_ne!(slot(&store, 0), first);
        drop(blob);

        let blob = reopen(&store);
        assert_eq!(blob.allocated_bytes(), 128);
        assert_eq!(blob.stats().wal_entries_replayed, 0);
    }

    #[test]
    fn untouched_arenas_keep_their_metadata_block() {
        let (store, blob) = create_blob();
        let a = commit_one(&blob, 64);
        let r = blob
            .reserve(ArenaHint::Arena(ArenaId::new(1)), 64)
            .unwrap()
            .unwrap();
        let mut tx = blob.begin().unwrap();
        tx.publish(&r).unwrap();
        tx.commit().unwrap();
        blob.checkpoint().unwrap();

        // Only arena 1 changes before the next checkpoint.
        let mut tx = blob.begin().unwrap();
        tx.free(r.addr()).unwrap();
        tx.commit().unwrap();
        blob.checkpoint().unwrap();
        drop(blob);

        let blob = reopen(&store);
        let first = blob.arena_info(ArenaId::new(0)).unwrap().unwrap();
        assert_eq!(first.allocations.get(&(a - first.base)), Some(&64));
        let second = blob.arena_info(ArenaId::new(1)).unwrap().unwrap();
        assert!(second.allocations.is_empty());
        assert_eq!(second.watermark, 64);
        assert_eq!(blob.allocated_bytes(), 64);
    }

    #[test]
    fn size_class_stats_follow_requests() {
        let (_store, blob) = create_blob();
        commit_one(&blob, 100);
        let r = blob.reserve(ArenaHint::Any, 100).unwrap().unwrap();
        blob.cancel(r).unwrap();
        assert!(blob.reserve(ArenaHint::Any, MIB).unwrap().is_some());
        assert!(blob
            .reserve(ArenaHint::Arena(ArenaId::new(0)), MIB)
            .unwrap()
            .is_none());

        let stats = blob.stats();
        let small = stats.size_class(104);
        assert_eq!(small.max_size, 128);
        assert_eq!(small.reserved, 2);
        assert_eq!(small.published, 1);
        assert_eq!(small.live(), 1);
        assert_eq!(stats.size_class(MIB).failed, 1);
    }

    #[test]
    fn close_without_checkpoint_keeps_wal() {
        let (store, blob) = create_blob();
        commit_one(&blob, 64);
        blob.close().unwrap();
        assert_eq!(store.wal_len(), 0);

        let blob = Blob::prepare_open("test-blob")
            .unwrap()
            .checkpoint_on_close(false)
            .post_open(store.clone())
            .unwrap();
        commit_one(&blob, 64);
        blob.close().unwrap();
        assert_eq!(store.wal_len(), 1);
    }

    #[test]
    fn corrupt_wal_entry_fails_open() {
        let (store, blob) = create_blob();
        drop(blob);
        store.submit_wal(1 << 40, b"garbage").unwrap();
        let result = Blob::prepare_open("test-blob").unwrap().post_open(store);
        assert!(matches!(result, Err(AllocError::WalCorruption { .. })));
    }
}
