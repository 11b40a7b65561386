//! Per-arena allocation state.

use super::extents::ExtentMap;
use crate::error::{AllocError, AllocResult};
use crate::header::ArenaRecord;
use crate::metadata::{ArenaMetadata, MetadataSlot};
use crate::types::{align_up, ArenaId, WalId};
use std::collections::{BTreeMap, HashMap};

/// Where a reservation's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationSource {
    /// Carved by advancing the arena's tentative pointer.
    Extension,
    /// Reused from the arena's free-extent registry.
    FreeExtent,
}

/// Lifecycle of an outstanding reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutstandingState {
    /// Handed out, not attached to any transaction.
    Reserved,
    /// Published by the open transaction with this id.
    Staged(WalId),
}

/// An in-memory reservation record, keyed by cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outstanding {
    pub offset: u64,
    pub len: u64,
    pub source: ReservationSource,
    pub state: OutstandingState,
}

/// Point-in-time view of one arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaInfo {
    /// Arena index.
    pub id: ArenaId,
    /// Blob address of the first byte.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// Committed watermark.
    pub watermark: u64,
    /// Tentative pointer.
    pub tentative: u64,
    /// Committed allocations, arena-relative offset to length.
    pub allocations: BTreeMap<u64, u64>,
    /// Reusable extents, arena-relative `(offset, len)`, by address.
    pub free_extents: Vec<(u64, u64)>,
    /// Bytes in the free-extent registry.
    pub free_bytes: u64,
    /// Reservations not yet committed or canceled.
    pub outstanding: usize,
}

/// State of one arena.
///
/// Invariants:
/// - `watermark <= tentative <= size`
/// - allocations, free extents and outstanding reservations never overlap
/// - no free extent ends at `tentative` unless it starts below `watermark`
/// - `dirty` is set whenever allocations or watermark change after the
///   metadata block named by `durable` was written
#[derive(Debug)]
pub(crate) struct Arena {
    id: ArenaId,
    base: u64,
    size: u64,
    watermark: u64,
    tentative: u64,
    allocations: BTreeMap<u64, u64>,
    free: ExtentMap,
    outstanding: HashMap<u64, Outstanding>,
    durable: MetadataSlot,
    dirty: bool,
}

impl Arena {
    /// Creates an empty arena.
    pub(crate) fn new(id: ArenaId, base: u64, size: u64) -> Self {
        Self {
            id,
            base,
            size,
            watermark: 0,
            tentative: 0,
            allocations: BTreeMap::new(),
            free: ExtentMap::new(),
            outstanding: HashMap::new(),
            durable: MetadataSlot::NONE,
            dirty: false,
        }
    }

    /// Restores an arena from a checkpointed record and the allocations of
    /// the metadata block it references.
    pub(crate) fn restore(record: &ArenaRecord, allocations: BTreeMap<u64, u64>) -> Self {
        let mut arena = Self::new(ArenaId::new(record.index), record.offset, record.size);
        arena.watermark = record.watermark;
        arena.allocations = allocations;
        arena.durable = record.metadata();
        arena.rebuild();
        arena
    }

    pub(crate) fn id(&self) -> ArenaId {
        self.id
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn allocated_bytes(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// Returns the header record, pointing at the current metadata block.
    pub(crate) fn record(&self) -> ArenaRecord {
        ArenaRecord {
            index: self.id.as_u32(),
            offset: self.base,
            size: self.size,
            watermark: self.watermark,
            alloc_count: u32::try_from(self.allocations.len()).unwrap_or(u32::MAX),
            metadata_wal_id: self.durable.wal_id,
            metadata_copy: self.durable.copy,
        }
    }

    /// Returns `true` if the allocation table changed since it was last
    /// written.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The metadata block a checkpoint at `wal_id` would write.
    pub(crate) fn metadata(&self, wal_id: WalId) -> ArenaMetadata {
        ArenaMetadata {
            arena: self.id.as_u32(),
            checkpoint_wal_id: wal_id.as_u64(),
            watermark: self.watermark,
            allocations: self.allocations.clone(),
        }
    }

    /// Records that the header now references `slot`.
    pub(crate) fn mark_durable(&mut self, slot: MetadataSlot) {
        self.durable = slot;
        self.dirty = false;
    }

    pub(crate) fn info(&self) -> ArenaInfo {
        let mut free_extents = Vec::with_capacity(self.free.len());
        free_extents.extend(self.free.iter());
        ArenaInfo {
            id: self.id,
            base: self.base,
            size: self.size,
            watermark: self.watermark,
            tentative: self.tentative,
            allocations: self.allocations.clone(),
            free_extents,
            free_bytes: self.free.total(),
            outstanding: self.outstanding.len(),
        }
    }

    /// Drops volatile state and re-derives the registry from the durable one.
    ///
    /// The registry becomes `[0, watermark)` minus the allocations, which
    /// reclaims space of reservations that never committed.
    pub(crate) fn rebuild(&mut self) {
        self.outstanding.clear();
        self.free = ExtentMap::gaps(self.watermark, &self.allocations);
        self.tentative = self.watermark;
    }

    /// Tries to carve `len` bytes out of the free-extent registry.
    pub(crate) fn reserve_from_registry(&mut self, len: u64, align: u64, cookie: u64) -> Option<u64> {
        let offset = self.free.first_fit(len, self.base, align)?;
        if !self.free.take(offset, len) {
            return None;
        }
        self.track(cookie, offset, len, ReservationSource::FreeExtent);
        Some(offset)
    }

    /// Tries to carve `len` bytes by advancing the tentative pointer.
    ///
    /// Alignment padding is recorded in the registry.
    pub(crate) fn reserve_by_extension(&mut self, len: u64, align: u64, cookie: u64) -> Option<u64> {
        let offset = align_up(self.base + self.tentative, align)? - self.base;
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }
        if offset > self.tentative {
            self.free.insert(self.tentative, offset - self.tentative);
        }
        self.tentative = end;
        self.track(cookie, offset, len, ReservationSource::Extension);
        Some(offset)
    }

    fn track(&mut self, cookie: u64, offset: u64, len: u64, source: ReservationSource) {
        self.outstanding.insert(
            cookie,
            Outstanding {
                offset,
                len,
                source,
                state: OutstandingState::Reserved,
            },
        );
    }

    /// Returns a reservation's range to the arena.
    ///
    /// Space at the tentative frontier is absorbed back into it, never
    /// below the watermark.
    pub(crate) fn cancel(&mut self, cookie: u64) -> AllocResult<Outstanding> {
        let record = match self.outstanding.get(&cookie) {
            None => {
                return Err(AllocError::invalid_argument(format!(
                    "reservation {cookie} is not outstanding in {}",
                    self.id
                )))
            }
            Some(record) => *record,
        };
        if let OutstandingState::Staged(wal_id) = record.state {
            return Err(AllocError::invalid_operation(format!(
                "reservation {cookie} is published in open transaction {wal_id}"
            )));
        }

        self.outstanding.remove(&cookie);
        self.free.insert(record.offset, record.len);
        self.absorb_tail();
        Ok(record)
    }

    fn absorb_tail(&mut self) {
        if self.tentative == self.watermark {
            return;
        }
        // Extents are coalesced, so at most one can end at the frontier.
        if let Some((start, _)) = self.free.remove_ending_at(self.tentative) {
            if start < self.watermark {
                self.free.insert(start, self.watermark - start);
                self.tentative = self.watermark;
            } else {
                self.tentative = start;
            }
        }
    }

    /// Marks a reserved record as published by `wal_id`.
    pub(crate) fn stage(&mut self, cookie: u64, wal_id: WalId) -> AllocResult<()> {
        let record = self.outstanding.get_mut(&cookie).ok_or_else(|| {
            AllocError::invalid_operation(format!(
                "reservation {cookie} is not outstanding in {}",
                self.id
            ))
        })?;
        match record.state {
            OutstandingState::Reserved => {
                record.state = OutstandingState::Staged(wal_id);
                Ok(())
            }
            OutstandingState::Staged(owner) => Err(AllocError::invalid_operation(format!(
                "reservation {cookie} is already published in transaction {owner}"
            ))),
        }
    }

    /// Reverts a record staged by `wal_id` to reserved.
    pub(crate) fn unstage(&mut self, cookie: u64, wal_id: WalId) {
        if let Some(record) = self.outstanding.get_mut(&cookie) {
            if record.state == OutstandingState::Staged(wal_id) {
                record.state = OutstandingState::Reserved;
            }
        }
    }

    /// Returns `true` if `cookie` is staged by `wal_id` over exactly this range.
    pub(crate) fn is_staged_by(&self, cookie: u64, wal_id: WalId, offset: u64, len: u64) -> bool {
        self.outstanding.get(&cookie).is_some_and(|r| {
            r.state == OutstandingState::Staged(wal_id) && r.offset == offset && r.len == len
        })
    }

    /// Length of the committed allocation starting at `offset`.
    pub(crate) fn allocation_len(&self, offset: u64) -> Option<u64> {
        self.allocations.get(&offset).copied()
    }

    /// Turns a staged reservation into a committed allocation.
    pub(crate) fn apply_publish(&mut self, cookie: u64, offset: u64, len: u64) {
        self.outstanding.remove(&cookie);
        self.allocations.insert(offset, len);
        self.watermark = self.watermark.max(offset + len);
        self.tentative = self.tentative.max(self.watermark);
        self.dirty = true;
    }

    /// Releases a committed allocation into the registry.
    pub(crate) fn apply_free(&mut self, offset: u64, len: u64) {
        if self.allocations.remove(&offset).is_some() {
            self.free.insert(offset, len);
            self.dirty = true;
        }
    }

    /// Applies a publish read back from the WAL.
    pub(crate) fn replay_publish(&mut self, offset: u64, len: u64) -> AllocResult<()> {
        let end = offset
            .checked_add(len)
            .filter(|&end| len > 0 && end <= self.size)
            .ok_or_else(|| {
                AllocError::wal_corruption(format!(
                    "publish of [{offset}, +{len}) outside {}",
                    self.id
                ))
            })?;
        if let Some((&start, &alloc_len)) = self.allocations.range(..end).next_back() {
            if start + alloc_len > offset {
                return Err(AllocError::wal_corruption(format!(
                    "publish of [{offset}, +{len}) overlaps allocation at {start} in {}",
                    self.id
                )));
            }
        }
        self.allocations.insert(offset, len);
        self.watermark = self.watermark.max(end);
        self.dirty = true;
        Ok(())
    }

    /// Applies a free read back from the WAL.
    pub(crate) fn replay_free(&mut self, offset: u64, len: u64) -> AllocResult<()> {
        match self.allocations.get(&offset) {
            Some(&found) if found == len => {
                self.allocations.remove(&offset);
                self.dirty = true;
                Ok(())
            }
            _ => Err(AllocError::wal_corruption(format!(
                "free of [{offset}, +{len}) does not match an allocation in {}",
                self.id
            ))),
        }
    }
}
