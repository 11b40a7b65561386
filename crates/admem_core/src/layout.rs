//! Placement of header slots, arenas and arena metadata within a blob.
//!
//! ```text
//! 0          h/2         h                                          meta_base       total
//! | slot A   | slot B    | arena 0 | arena 1 | ... | arena n-1 | .. | 0a 0b 1a 1b ... |
//! ```
//!
//! The header region holds two alternating header slots. Every arena owns
//! two fixed-size metadata blocks packed at the end of the blob. The last
//! arena is clipped when the remaining space cannot hold a full one.

use crate::error::{AllocError, AllocResult};
use crate::metadata::ArenaMetadata;
use crate::types::ArenaId;
use admem_store::Region;

/// Number of alternating header slots in the header region.
pub(crate) const HEADER_SLOTS: usize = 2;

/// Copies of each arena's metadata block.
pub(crate) const METADATA_COPIES: u8 = 2;

/// Derived placement of every durable structure of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlobLayout {
    header_size: u64,
    arena_size: u64,
    alignment: u64,
    max_arenas: u32,
    last_arena_size: u64,
    metadata_size: u64,
    metadata_base: u64,
}

impl BlobLayout {
    /// Computes the layout of a blob.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the blob cannot hold one
    /// arena with its metadata, or holds more arenas than an index can name.
    pub(crate) fn new(
        header_size: u64,
        total_size: u64,
        arena_size: u64,
        alignment: u64,
    ) -> AllocResult<Self> {
        if arena_size == 0 || !alignment.is_power_of_two() || arena_size % alignment != 0 {
            return Err(AllocError::invalid_argument(format!(
                "arena size {arena_size} is not a positive multiple of alignment {alignment}"
            )));
        }
        let no_room =
            || AllocError::invalid_argument("blob has no room for an arena and its metadata");

        let span = total_size
            .checked_sub(header_size)
            .filter(|&span| span > 0)
            .ok_or_else(no_room)?;
        let metadata_size = ArenaMetadata::block_size(arena_size, alignment);
        let metadata_pair = metadata_size * u64::from(METADATA_COPIES);
        let per_arena = arena_size.checked_add(metadata_pair).ok_or_else(no_room)?;

        let full = span / per_arena;
        let rest = span - full * per_arena;
        let clipped = rest.saturating_sub(metadata_pair) & !(alignment - 1);
        let (count, last_arena_size) = if clipped > 0 {
            (full + 1, clipped)
        } else {
            (full, arena_size)
        };
        if count == 0 {
            return Err(no_room());
        }
        let max_arenas = u32::try_from(count).map_err(|_| {
            AllocError::invalid_argument(format!("arena size {arena_size} yields too many arenas"))
        })?;

        Ok(Self {
            header_size,
            arena_size,
            alignment,
            max_arenas,
            last_arena_size,
            metadata_size,
            metadata_base: total_size - count * metadata_pair,
        })
    }

    pub(crate) fn header_size(&self) -> u64 {
        self.header_size
    }

    pub(crate) fn arena_size(&self) -> u64 {
        self.arena_size
    }

    pub(crate) fn alignment(&self) -> u64 {
        self.alignment
    }

    pub(crate) fn max_arenas(&self) -> u32 {
        self.max_arenas
    }

    /// Bytes of one header slot.
    pub(crate) fn slot_size(&self) -> u64 {
        self.header_size / HEADER_SLOTS as u64
    }

    /// Region of header slot `slot`.
    pub(crate) fn slot_region(&self, slot: usize) -> Region {
        Region::new(slot as u64 * self.slot_size(), self.slot_size())
    }

    /// Returns `(base address, size)` of arena `index`.
    pub(crate) fn arena_bounds(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.max_arenas {
            return None;
        }
        let base = self.header_size + u64::from(index) * self.arena_size;
        let size = if index + 1 == self.max_arenas {
            self.last_arena_size
        } else {
            self.arena_size
        };
        Some((base, size))
    }

    /// Region of copy `copy` of arena `index`'s metadata block.
    pub(crate) fn metadata_region(&self, index: u32, copy: u8) -> Option<Region> {
        if index >= self.max_arenas || copy >= METADATA_COPIES {
            return None;
        }
        let block = u64::from(index) * u64::from(METADATA_COPIES) + u64::from(copy);
        Some(Region::new(
            self.metadata_base + block * self.metadata_size,
            self.metadata_size,
        ))
    }

    /// Maps a blob address to `(arena, arena-relative offset)`.
    pub(crate) fn locate(&self, addr: u64) -> Option<(ArenaId, u64)> {
        let rel = addr.checked_sub(self.header_size)?;
        let index = u32::try_from(rel / self.arena_size).ok()?;
        let (_, size) = self.arena_bounds(index)?;
        let offset = rel % self.arena_size;
        (offset < size).then_some((ArenaId::new(index), offset))
    }
}
