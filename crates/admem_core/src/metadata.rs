//! Fixed-size durable allocation table of one arena.
//!
//! Every arena owns two metadata blocks. A checkpoint writes the copy the
//! current header does not reference, then points the next header at it.
//! Block size depends only on the arena size and the granule (the blob
//! alignment), never on how many allocations the arena holds.
//!
//! ## Format
//!
//! ```text
//! | magic "ADMA" (4) | version (2) | reserved (2) | arena (4) | alloc_count (4) |
//! | checkpoint_wal_id (8) | watermark (8) | words (4) |
//! | used bitmap (8 * words) | start bitmap (8 * words) | padding | crc32 (4) |
//! ```
//!
//! Bit `i` covers granule `[i * g, (i + 1) * g)`. A granule is `used` when an
//! allocation covers it and `start` when an allocation begins there.

use crate::error::{AllocError, AllocResult};
use admem_store::crc32;
use std::collections::BTreeMap;

/// Magic bytes of an arena metadata block.
pub const METADATA_MAGIC: [u8; 4] = *b"ADMA";

/// Current arena metadata format version.
pub const METADATA_VERSION: u16 = 1;

const PREFIX_SIZE: usize = 4 + 2 + 2 + 4 + 4 + 8 + 8 + 4;
const CRC_SIZE: usize = 4;

/// Which metadata copy a header record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct MetadataSlot {
    /// Checkpoint that wrote the copy; `0` when the arena has none.
    pub wal_id: u64,
    /// Copy index, `0` or `1`.
    pub copy: u8,
}

impl MetadataSlot {
    pub(crate) const NONE: Self = Self { wal_id: 0, copy: 0 };

    pub(crate) fn is_none(&self) -> bool {
        self.wal_id == 0
    }

    /// The copy a new checkpoint may overwrite.
    pub(crate) fn next_copy(&self) -> u8 {
        if self.is_none() {
            0
        } else {
            1 - self.copy
        }
    }
}

/// Allocation table of one arena as of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaMetadata {
    /// Arena index.
    pub arena: u32,
    /// Checkpoint that wrote this block.
    pub checkpoint_wal_id: u64,
    /// Committed watermark, arena-relative.
    pub watermark: u64,
    /// Committed allocations, arena-relative offset to length.
    pub allocations: BTreeMap<u64, u64>,
}

impl ArenaMetadata {
    /// Bytes of one metadata block for arenas of `arena_size` bytes split
    /// into granules of `granule` bytes.
    #[must_use]
    pub fn block_size(arena_size: u64, granule: u64) -> u64 {
        let words = bitmap_words(arena_size, granule) as u64;
        let raw = PREFIX_SIZE as u64 + 16 * words + CRC_SIZE as u64;
        raw.div_ceil(8) * 8
    }

    /// Serializes the table into a block of [`ArenaMetadata::block_size`]
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if an allocation is not
    /// granule-aligned or lies beyond the arena.
    pub fn encode(&self, arena_size: u64, granule: u64) -> AllocResult<Vec<u8>> {
        let granules = granule_count(arena_size, granule);
        let words = bitmap_words(arena_size, granule);
        let mut used = vec![0u64; words];
        let mut start = vec![0u64; words];

        for (&offset, &len) in &self.allocations {
            let end = offset.checked_add(len).unwrap_or(u64::MAX);
            if len == 0 || offset % granule != 0 || len % granule != 0 || end / granule > granules
            {
                return Err(AllocError::invalid_argument(format!(
                    "arena {} allocation [{offset}, +{len}) does not fit {granule}-byte granules",
                    self.arena
                )));
            }
            let first = (offset / granule) as usize;
            start[first / 64] |= 1 << (first % 64);
            set_range(&mut used, first, (len / granule) as usize);
        }

        let alloc_count = u32::try_from(self.allocations.len())
            .map_err(|_| AllocError::invalid_argument("too many allocations"))?;
        let word_count =
            u32::try_from(words).map_err(|_| AllocError::invalid_argument("arena too large"))?;

        let size = Self::block_size(arena_size, granule) as usize;
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&METADATA_MAGIC);
        buf.extend_from_slice(&METADATA_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.arena.to_le_bytes());
        buf.extend_from_slice(&alloc_count.to_le_bytes());
        buf.extend_from_slice(&self.checkpoint_wal_id.to_le_bytes());
        buf.extend_from_slice(&self.watermark.to_le_bytes());
        buf.extend_from_slice(&word_count.to_le_bytes());
        for word in used.iter().chain(start.iter()) {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf.resize(size - CRC_SIZE, 0);

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a block written by [`ArenaMetadata::encode`] with the same
    /// `arena_size` and `granule`.
    ///
    /// # Errors
    ///
    /// - [`AllocError::CorruptHeader`] for any structural problem
    /// - [`AllocError::IncompatibleVersion`] for an unknown version
    pub fn decode(data: &[u8], arena_size: u64, granule: u64) -> AllocResult<Self> {
        let size = Self::block_size(arena_size, granule) as usize;
        if data.len() != size {
            return Err(corrupt(format!(
                "block is {} bytes, expected {size}",
                data.len()
            )));
        }
        if data[0..4] != METADATA_MAGIC {
            return Err(corrupt("invalid magic"));
        }

        let (covered, trailer) = data.split_at(size - CRC_SIZE);
        let stored_crc = u32::from_le_bytes(
            trailer
                .try_into()
                .map_err(|_| corrupt("missing checksum"))?,
        );
        let computed_crc = crc32(covered);
        if stored_crc != computed_crc {
            return Err(corrupt(format!(
                "checksum mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
            )));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != METADATA_VERSION {
            return Err(AllocError::IncompatibleVersion {
                found: version,
                supported: METADATA_VERSION,
            });
        }
        let arena = read_u32(data, 8);
        let alloc_count = read_u32(data, 12);
        let checkpoint_wal_id = read_u64(data, 16);
        let watermark = read_u64(data, 24);
        let words = read_u32(data, 32) as usize;
        if words != bitmap_words(arena_size, granule) {
            return Err(corrupt(format!("arena {arena} bitmap has {words} words")));
        }

        let word_at = |index: usize| read_u64(data, PREFIX_SIZE + 8 * index);
        let used: Vec<u64> = (0..words).map(word_at).collect();
        let start: Vec<u64> = (0..words).map(|i| word_at(words + i)).collect();

        let granules = granule_count(arena_size, granule) as usize;
        let allocations = runs(&used, &start, granules)
            .map_err(|message| corrupt(format!("arena {arena} {message}")))?
            .into_iter()
            .map(|(first, count)| (first as u64 * granule, count as u64 * granule))
            .collect::<BTreeMap<_, _>>();

        if allocations.len() != alloc_count as usize {
            return Err(corrupt(format!(
                "arena {arena} records {alloc_count} allocations, bitmap holds {}",
                allocations.len()
            )));
        }
        let high = allocations
            .iter()
            .next_back()
            .map_or(0, |(&offset, &len)| offset + len);
        if watermark > arena_size || high > watermark {
            return Err(corrupt(format!(
                "arena {arena} watermark {watermark} does not cover its allocations"
            )));
        }

        Ok(Self {
            arena,
            checkpoint_wal_id,
            watermark,
            allocations,
        })
    }
}

fn corrupt(message: impl std::fmt::Display) -> AllocError {
    AllocError::corrupt_header(format!("arena metadata: {message}"))
}

fn granule_count(arena_size: u64, granule: u64) -> u64 {
    arena_size / granule
}

fn bitmap_words(arena_size: u64, granule: u64) -> usize {
    granule_count(arena_size, granule).div_ceil(64) as usize
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Sets bits `[first, first + count)`.
fn set_range(words: &mut [u64], first: usize, count: usize) {
    let end = first + count;
    let mut bit = first;
    while bit < end {
        let shift = bit % 64;
        let n = (64 - shift).min(end - bit);
        let mask = if n == 64 {
            u64::MAX
        } else {
            ((1u64 << n) - 1) << shift
        };
        words[bit / 64] |= mask;
        bit += n;
    }
}

/// Splits the bitmaps into `(first granule, granule count)` runs.
fn runs(used: &[u64], start: &[u64], granules: usize) -> Result<Vec<(usize, usize)>, String> {
    let mut out = Vec::new();
    let mut open: Option<usize> = None;

    for (index, (&u, &s)) in used.iter().zip(start).enumerate() {
        let base = index * 64;
        let valid = granules.saturating_sub(base).min(64);
        let valid_mask = if valid == 64 {
            u64::MAX
        } else {
            (1u64 << valid) - 1
        };
        if (u | s) & !valid_mask != 0 {
            return Err(format!("has bits past granule {granules}"));
        }
        if s & !u != 0 {
            return Err(format!("starts an allocation on a free granule in word {index}"));
        }

        // Whole-word shortcuts.
        if s == 0 && u == u64::MAX && open.is_some() {
            continue;
        }
        if s == 0 && u == 0 {
            if let Some(first) = open.take() {
                out.push((first, base - first));
            }
            continue;
        }

        for bit in 0..valid {
            let is_used = u & (1 << bit) != 0;
            let is_start = s & (1 << bit) != 0;
            let granule = base + bit;
            if is_start || !is_used {
                if let Some(first) = open.take() {
                    out.push((first, granule - first));
                }
            }
            if is_start {
                open = Some(granule);
            } else if is_used && open.is_none() {
                return Err(format!("granule {granule} is used outside an allocation"));
            }
        }
    }
    if let Some(first) = open {
        out.push((first, granules - first));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: u64 = 64 << 10;
    const GRANULE: u64 = 8;

    fn sample() -> ArenaMetadata {
        let mut allocations = BTreeMap::new();
        allocations.insert(0, 8);
        allocations.insert(8, 1024);
        allocations.insert(2048, 512);
        allocations.insert(ARENA - 64, 64);
        ArenaMetadata {
            arena: 3,
            checkpoint_wal_id: 42,
            watermark: ARENA,
            allocations,
        }
    }

    #[test]
    fn block_size_is_fixed() {
        let empty = ArenaMetadata {
            allocations: BTreeMap::new(),
            ..sample()
        };
        let size = ArenaMetadata::block_size(ARENA, GRANULE);
        assert_eq!(size % 8, 0);
        assert_eq!(empty.encode(ARENA, GRANULE).unwrap().len() as u64, size);
        assert_eq!(sample().encode(ARENA, GRANULE).unwrap().len() as u64, size);
    }

    #[test]
    fn adjacent_allocations_stay_distinct() {
        let metadata = sample();
        let bytes = metadata.encode(ARENA, GRANULE).unwrap();
        assert_eq!(&bytes[0..4], b"ADMA");
        assert_eq!(
            ArenaMetadata::decode(&bytes, ARENA, GRANULE).unwrap(),
            metadata
        );
    }

    #[test]
    fn many_allocations_fit_one_block() {
        let allocations = (0..ARENA / 16).map(|i| (i * 16, 8)).collect();
        let metadata = ArenaMetadata {
            arena: 0,
            checkpoint_wal_id: 7,
            watermark: ARENA,
            allocations,
        };
        let bytes = metadata.encode(ARENA, GRANULE).unwrap();
        let decoded = ArenaMetadata::decode(&bytes, ARENA, GRANULE).unwrap();
        assert_eq!(decoded.allocations.len(), 4096);
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn partial_last_word_round_trips() {
        let arena = 100 * GRANULE;
        let mut allocations = BTreeMap::new();
        allocations.insert(60 * GRANULE, 40 * GRANULE);
        let metadata = ArenaMetadata {
            arena: 1,
            checkpoint_wal_id: 9,
            watermark: arena,
            allocations,
        };
        let bytes = metadata.encode(arena, GRANULE).unwrap();
        assert_eq!(
            ArenaMetadata::decode(&bytes, arena, GRANULE).unwrap(),
            metadata
        );
    }

    #[test]
    fn misaligned_allocation_is_rejected() {
        let mut metadata = sample();
        metadata.allocations.insert(4096, 12);
        assert!(matches!(
            metadata.encode(ARENA, GRANULE),
            Err(AllocError::InvalidArgument { .. })
        ));

        let mut metadata = sample();
        metadata.allocations.insert(ARENA, 8);
        assert!(metadata.encode(ARENA, GRANULE).is_err());
    }

    #[test]
    fn flipped_bit_is_corrupt() {
        let mut bytes = sample().encode(ARENA, GRANULE).unwrap();
        bytes[PREFIX_SIZE + 3] ^= 0x10;
        let err = ArenaMetadata::decode(&bytes, ARENA, GRANULE).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn wrong_geometry_is_corrupt() {
        let bytes = sample().encode(ARENA, GRANULE).unwrap();
        assert!(matches!(
            ArenaMetadata::decode(&bytes, ARENA, 16),
            Err(AllocError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn unknown_version_is_incompatible() {
        let mut bytes = sample().encode(ARENA, GRANULE).unwrap();
        bytes[4..6].copy_from_slice(&9u16.to_le_bytes());
        let covered = bytes.len() - CRC_SIZE;
        let crc = crc32(&bytes[..covered]);
        bytes[covered..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            ArenaMetadata::decode(&bytes, ARENA, GRANULE),
            Err(AllocError::IncompatibleVersion { found: 9, .. })
        ));
    }

    #[test]
    fn used_granule_without_start_is_corrupt() {
        let mut used = vec![0u64; 2];
        let start = vec![0u64; 2];
        set_range(&mut used, 3, 5);
        assert!(runs(&used, &start, 128).is_err());
    }

    #[test]
    fn start_on_free_granule_is_corrupt() {
        let used = vec![0u64; 1];
        let start = vec![1u64; 1];
        assert!(runs(&used, &start, 64).is_err());
    }

    #[test]
    fn runs_cross_word_boundaries() {
        let mut used = vec![0u64; 3];
        let mut start = vec![0u64; 3];
        set_range(&mut used, 60, 80);
        start[0] |= 1 << 60;
        set_range(&mut used, 140, 4);
        start[2] |= 1 << 12;
        assert_eq!(runs(&used, &start, 192).unwrap(), vec![(60, 80), (140, 4)]);
    }

    #[test]
    fn metadata_slot_alternates() {
        assert!(MetadataSlot::NONE.is_none());
        assert_eq!(MetadataSlot::NONE.next_copy(), 0);
        let slot = MetadataSlot { wal_id: 5, copy: 0 };
        assert_eq!(slot.next_copy(), 1);
        assert_eq!(MetadataSlot { wal_id: 6, copy: 1 }.next_copy(), 0);
    }
}
