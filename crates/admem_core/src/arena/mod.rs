//! Arena management.
//!
//! The blob's address space after the header is split into fixed-size
//! arenas; the last one may be shorter. Arenas are materialized lazily in
//! index order and each sits behind its own mutex, so reservations in
//! different arenas never contend.
//!
//! ## Reservation Policy
//!
//! With [`ArenaHint::Any`] a request first tries the free-extent registry of
//! every materialized arena (first-fit by address), then tries extending the
//! tentative pointer of each arena in index order, materializing arenas as
//! it goes. [`ArenaHint::Arena`] restricts both passes to one arena.

mod extents;
mod state;

pub(crate) use state::Arena;
pub use state::{ArenaInfo, ReservationSource};

use crate::error::{AllocError, AllocResult};
use crate::header::ArenaRecord;
use crate::layout::BlobLayout;
use crate::types::{ArenaHint, ArenaId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared handle to one arena.
pub(crate) type ArenaRef = Arc<Mutex<Arena>>;

/// Where a successful reservation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub arena: ArenaId,
    pub base: u64,
    pub offset: u64,
    pub source: ReservationSource,
}

/// The set of arenas of one blob.
#[derive(Debug)]
pub(crate) struct ArenaTable {
    layout: BlobLayout,
    arenas: RwLock<Vec<ArenaRef>>,
}

impl ArenaTable {
    /// Creates a table with no materialized arenas.
    pub(crate) fn new(layout: BlobLayout) -> Self {
        Self {
            layout,
            arenas: RwLock::new(Vec::new()),
        }
    }

    /// Rebuilds the table from checkpointed records and the allocation
    /// tables their metadata blocks hold, in index order.
    pub(crate) fn restore(
        layout: BlobLayout,
        arenas: impl IntoIterator<Item = (ArenaRecord, BTreeMap<u64, u64>)>,
    ) -> Self {
        let table = Self::new(layout);
        table
            .arenas
            .write()
            .extend(arenas.into_iter().map(|(record, allocations)| {
                Arc::new(Mutex::new(Arena::restore(&record, allocations)))
            }));
        table
    }

    pub(crate) fn layout(&self) -> &BlobLayout {
        &self.layout
    }

    pub(crate) fn max_arenas(&self) -> u32 {
        self.layout.max_arenas()
    }

    pub(crate) fn arena_size(&self) -> u64 {
        self.layout.arena_size()
    }

    /// Maps a blob address to `(arena, arena-relative offset)`.
    pub(crate) fn locate(&self, addr: u64) -> Option<(ArenaId, u64)> {
        self.layout.locate(addr)
    }

    /// Number of materialized arenas.
    pub(crate) fn count(&self) -> usize {
        self.arenas.read().len()
    }

    pub(crate) fn get(&self, id: ArenaId) -> Option<ArenaRef> {
        self.arenas.read().get(id.index()).cloned()
    }

    /// Returns arena `id`, materializing it and every lower arena first.
    pub(crate) fn ensure(&self, id: ArenaId) -> Option<ArenaRef> {
        if let Some(arena) = self.get(id) {
            return Some(arena);
        }
        if id.as_u32() >= self.max_arenas() {
            return None;
        }

        let mut arenas = self.arenas.write();
        while arenas.len() <= id.index() {
            let index = u32::try_from(arenas.len()).ok()?;
            let (base, size) = self.layout.arena_bounds(index)?;
            tracing::debug!(arena = index, base, size, "materialized arena");
            arenas.push(Arc::new(Mutex::new(Arena::new(
                ArenaId::new(index),
                base,
                size,
            ))));
        }
        arenas.get(id.index()).cloned()
    }

    /// Clones the list of materialized arenas.
    pub(crate) fn snapshot(&self) -> Vec<ArenaRef> {
        self.arenas.read().clone()
    }

    /// Re-derives every arena's volatile state; returns the allocated bytes.
    pub(crate) fn rebuild_all(&self) -> u64 {
        self.snapshot()
            .iter()
            .map(|a| {
                let mut arena = a.lock();
                arena.rebuild();
                arena.allocated_bytes()
            })
            .sum()
    }

    /// Drops every arena.
    pub(crate) fn clear(&self) {
        self.arenas.write().clear();
    }

    /// Places `len` bytes aligned to `align` according to `hint`.
    ///
    /// Returns `Ok(None)` when no arena has room.
    pub(crate) fn reserve(
        &self,
        hint: ArenaHint,
        len: u64,
        align: u64,
        cookie: u64,
    ) -> AllocResult<Option<Placement>> {
        match hint {
            ArenaHint::Any => {
                for arena in self.snapshot() {
                    if let Some(placement) = Self::try_registry(&arena, len, align, cookie) {
                        return Ok(Some(placement));
                    }
                }
                for index in 0..self.max_arenas() {
                    let Some(arena) = self.ensure(ArenaId::new(index)) else {
                        break;
                    };
                    if let Some(placement) = Self::try_extension(&arena, len, align, cookie) {
                        return Ok(Some(placement));
                    }
                }
                Ok(None)
            }
            ArenaHint::Arena(id) => {
                let arena = self.ensure(id).ok_or_else(|| {
                    AllocError::invalid_argument(format!(
                        "{id} is beyond the blob's {} arenas",
                        self.max_arenas()
                    ))
                })?;
                Ok(Self::try_registry(&arena, len, align, cookie)
                    .or_else(|| Self::try_extension(&arena, len, align, cookie)))
            }
        }
    }

    fn try_registry(arena: &ArenaRef, len: u64, align: u64, cookie: u64) -> Option<Placement> {
        let mut guard = arena.lock();
        let offset = guard.reserve_from_registry(len, align, cookie)?;
        Some(Placement {
            arena: guard.id(),
            base: guard.base(),
            offset,
            source: ReservationSource::FreeExtent,
        })
    }

    fn try_extension(arena: &ArenaRef, len: u64, align: u64, cookie: u64) -> Option<Placement> {
        let mut guard = arena.lock();
        if len > guard.size() {
            return None;
        }
        let offset = guard.reserve_by_extension(len, align, cookie)?;
        Some(Placement {
            arena: guard.id(),
            base: guard.base(),
            offset,
            source: ReservationSource::Extension,
        })
    }
}
