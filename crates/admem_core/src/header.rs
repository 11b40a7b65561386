//! On-media blob header.
//!
//! The header region `[0, header_size)` holds two slots of `header_size / 2`
//! bytes. A checkpoint writes the slot that is not current, so a torn write
//! leaves the other slot intact; open takes the valid slot with the highest
//! `checkpoint_wal_id`. A slot records the blob layout and, per materialized
//! arena, its watermark and which metadata block holds its allocations.
//! WAL entries newer than `checkpoint_wal_id` carry everything committed
//! since.
//!
//! ## Format
//!
//! ```text
//! prefix: | magic "ADMB" (4) | version (2) | reserved (2) | header_size (8) | body_len (4) |
//! body:   | total_size (8) | arena_size (8) | alignment (8) | blob_id (16) |
//!         | checkpoint_wal_id (8) | identifier (2 + N) | arena_count (4) | arenas... |
//!         | zero padding |
//! arena:  | index (4) | offset (8) | size (8) | watermark (8) | alloc_count (4) |
//!         | metadata_wal_id (8) | metadata_copy (1) | reserved (3) |
//! trailer:| crc32 over prefix + body (4) |
//! ```
//!
//! The prefix is identical in every slot of a blob, so a torn slot write
//! never changes it.

use crate::error::{AllocError, AllocResult};
use crate::layout::{BlobLayout, HEADER_SLOTS, METADATA_COPIES};
use crate::metadata::MetadataSlot;
use admem_store::crc32;
use uuid::Uuid;

/// Magic bytes at address 0 of every blob.
pub const HEADER_MAGIC: [u8; 4] = *b"ADMB";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

/// Size of the fixed prefix read before the rest of the header.
pub const HEADER_PREFIX_SIZE: usize = 4 + 2 + 2 + 8 + 4;

/// Smallest accepted header region.
pub const MIN_HEADER_SIZE: u64 = 1024;

/// Largest accepted header region.
pub const MAX_HEADER_SIZE: u64 = 64 << 20;

/// Longest accepted blob identifier, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Encoded size of one [`ArenaRecord`].
pub const ARENA_RECORD_SIZE: usize = 4 + 8 + 8 + 8 + 4 + 8 + 1 + 3;

const CRC_SIZE: usize = 4;
const FIXED_BODY_SIZE: usize = 8 + 8 + 8 + 16 + 8 + 2 + 4;

/// Durable state of one arena as of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaRecord {
    /// Arena index.
    pub index: u32,
    /// Blob address of the arena's first byte.
    pub offset: u64,
    /// Arena size in bytes.
    pub size: u64,
    /// Committed watermark, arena-relative.
    pub watermark: u64,
    /// Number of committed allocations.
    pub alloc_count: u32,
    /// Checkpoint that wrote the referenced metadata block, `0` for none.
    pub metadata_wal_id: u64,
    /// Which of the arena's two metadata blocks is current.
    pub metadata_copy: u8,
}

impl ArenaRecord {
    pub(crate) fn metadata(&self) -> MetadataSlot {
        MetadataSlot {
            wal_id: self.metadata_wal_id,
            copy: self.metadata_copy,
        }
    }
}

/// The fixed prefix of a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPrefix {
    /// Size of the header region, both slots.
    pub header_size: u64,
    /// Length of the body following the prefix.
    pub body_len: u32,
}

impl HeaderPrefix {
    fn for_header_size(header_size: u64) -> AllocResult<Self> {
        let slot = header_size / HEADER_SLOTS as u64;
        let body_len = slot
            .checked_sub((HEADER_PREFIX_SIZE + CRC_SIZE) as u64)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or_else(|| {
                AllocError::invalid_argument(format!("header size {header_size} too small"))
            })?;
        Ok(Self {
            header_size,
            body_len,
        })
    }

    /// Bytes of one header slot: prefix, body and checksum.
    #[must_use]
    pub fn slot_size(&self) -> u64 {
        self.header_size / HEADER_SLOTS as u64
    }

    /// Decodes and validates a header prefix.
    ///
    /// # Errors
    ///
    /// - [`AllocError::CorruptHeader`] for a bad magic or impossible lengths
    /// - [`AllocError::IncompatibleVersion`] for an unknown version
    pub fn decode(data: &[u8]) -> AllocResult<Self> {
        if data.len() < HEADER_PREFIX_SIZE {
            return Err(AllocError::corrupt_header("header prefix too short"));
        }
        if data[0..4] != HEADER_MAGIC {
            return Err(AllocError::corrupt_header("invalid header magic"));
        }

        let mut reader = Reader::new(&data[4..HEADER_PREFIX_SIZE]);
        let version = reader.u16()?;
        if version != HEADER_VERSION {
            return Err(AllocError::IncompatibleVersion {
                found: version,
                supported: HEADER_VERSION,
            });
        }
        let _reserved = reader.u16()?;
        let header_size = reader.u64()?;
        let body_len = reader.u32()?;

        if !(MIN_HEADER_SIZE..=MAX_HEADER_SIZE).contains(&header_size) || header_size % 16 != 0 {
            return Err(AllocError::corrupt_header(format!(
                "header size {header_size} is out of range"
            )));
        }
        let prefix = Self::for_header_size(header_size)
            .map_err(|e| AllocError::corrupt_header(e.to_string()))?;
        if prefix.body_len != body_len {
            return Err(AllocError::corrupt_header(format!(
                "header body of {body_len} bytes does not fill a {}-byte slot",
                prefix.slot_size()
            )));
        }
        Ok(prefix)
    }
}

/// The decoded blob header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    /// Size of the header region.
    pub header_size: u64,
    /// Total blob size, header included.
    pub total_size: u64,
    /// Size of every arena except possibly the last.
    pub arena_size: u64,
    /// Allocation granularity.
    pub alignment: u64,
    /// Identity assigned at create time.
    pub blob_id: Uuid,
    /// Last WAL id whose effects are contained in this header.
    pub checkpoint_wal_id: u64,
    /// Caller-chosen blob name.
    pub identifier: String,
    /// Materialized arenas, in index order.
    pub arenas: Vec<ArenaRecord>,
}

impl BlobHeader {
    /// Bytes a slot needs for an identifier of `identifier_len` bytes and
    /// `arena_count` arena records.
    #[must_use]
    pub fn required_slot_size(identifier_len: usize, arena_count: u32) -> u64 {
        (HEADER_PREFIX_SIZE + FIXED_BODY_SIZE + identifier_len + CRC_SIZE) as u64
            + u64::from(arena_count) * ARENA_RECORD_SIZE as u64
    }

    /// Serializes the header into one slot image of `header_size / 2`
    /// bytes, checksum included.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the records do not fit a
    /// slot or a length field overflows.
    pub fn encode(&self) -> AllocResult<Vec<u8>> {
        let prefix = HeaderPrefix::for_header_size(self.header_size)?;
        let slot = usize::try_from(prefix.slot_size())
            .map_err(|_| AllocError::invalid_argument("header size overflows"))?;
        let arena_count = u32::try_from(self.arenas.len())
            .map_err(|_| AllocError::invalid_argument("too many arenas"))?;
        let needed = Self::required_slot_size(self.identifier.len(), arena_count);
        if needed > slot as u64 {
            return Err(AllocError::invalid_argument(format!(
                "header needs {needed} bytes, a slot holds {slot}"
            )));
        }

        let mut buf = Vec::with_capacity(slot);
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&self.header_size.to_le_bytes());
        buf.extend_from_slice(&prefix.body_len.to_le_bytes());

        buf.extend_from_slice(&self.total_size.to_le_bytes());
        buf.extend_from_slice(&self.arena_size.to_le_bytes());
        buf.extend_from_slice(&self.alignment.to_le_bytes());
        buf.extend_from_slice(self.blob_id.as_bytes());
        buf.extend_from_slice(&self.checkpoint_wal_id.to_le_bytes());

        let name = self.identifier.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| AllocError::invalid_argument("identifier too long"))?;
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(name);

        buf.extend_from_slice(&arena_count.to_le_bytes());
        for arena in &self.arenas {
            buf.extend_from_slice(&arena.index.to_le_bytes());
            buf.extend_from_slice(&arena.offset.to_le_bytes());
            buf.extend_from_slice(&arena.size.to_le_bytes());
            buf.extend_from_slice(&arena.watermark.to_le_bytes());
            buf.extend_from_slice(&arena.alloc_count.to_le_bytes());
            buf.extend_from_slice(&arena.metadata_wal_id.to_le_bytes());
            buf.push(arena.metadata_copy);
            buf.extend_from_slice(&[0u8; 3]);
        }
        buf.resize(slot - CRC_SIZE, 0);

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one slot: prefix, body and checksum.
    ///
    /// # Errors
    ///
    /// - [`AllocError::CorruptHeader`] for any structural problem
    /// - [`AllocError::IncompatibleVersion`] for an unknown version
    pub fn decode(data: &[u8]) -> AllocResult<Self> {
        let prefix = HeaderPrefix::decode(data)?;
        let slot = usize::try_from(prefix.slot_size())
            .map_err(|_| AllocError::corrupt_header("header length overflow"))?;
        if data.len() < slot {
            return Err(AllocError::corrupt_header(format!(
                "header truncated: need {slot} bytes, have {}",
                data.len()
            )));
        }

        let (covered, trailer) = data[..slot].split_at(slot - CRC_SIZE);
        let stored_crc = u32::from_le_bytes(
            trailer
                .try_into()
                .map_err(|_| AllocError::corrupt_header("header truncated"))?,
        );
        let computed_crc = crc32(covered);
        if stored_crc != computed_crc {
            return Err(AllocError::corrupt_header(format!(
                "checksum mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
            )));
        }

        let mut reader = Reader::new(&covered[HEADER_PREFIX_SIZE..]);
        let total_size = reader.u64()?;
        let arena_size = reader.u64()?;
        let alignment = reader.u64()?;
        let blob_id = Uuid::from_bytes(reader.array::<16>()?);
        let checkpoint_wal_id = reader.u64()?;

        let name_len = reader.u16()? as usize;
        let identifier = String::from_utf8(reader.take(name_len)?.to_vec())
            .map_err(|_| AllocError::corrupt_header("identifier is not valid UTF-8"))?;

        let arena_count = reader.u32()?;
        if arena_count as usize > reader.remaining() / ARENA_RECORD_SIZE {
            return Err(AllocError::corrupt_header(format!(
                "{arena_count} arena records overflow the slot"
            )));
        }
        let mut arenas = Vec::with_capacity(arena_count as usize);
        for _ in 0..arena_count {
            let index = reader.u32()?;
            let offset = reader.u64()?;
            let size = reader.u64()?;
            let watermark = reader.u64()?;
            let alloc_count = reader.u32()?;
            let metadata_wal_id = reader.u64()?;
            let [metadata_copy, _, _, _] = reader.array::<4>()?;
            arenas.push(ArenaRecord {
                index,
                offset,
                size,
                watermark,
                alloc_count,
                metadata_wal_id,
                metadata_copy,
            });
        }

        if reader.rest().iter().any(|&b| b != 0) {
            return Err(AllocError::corrupt_header("trailing bytes in header body"));
        }

        let header = Self {
            header_size: prefix.header_size,
            total_size,
            arena_size,
            alignment,
            blob_id,
            checkpoint_wal_id,
            identifier,
            arenas,
        };
        header.validate()?;
        Ok(header)
    }

    /// Decodes the whole header region and returns the newest valid slot.
    ///
    /// Ties go to slot 0. If neither slot is valid, slot 0's error is
    /// returned.
    ///
    /// # Errors
    ///
    /// As [`BlobHeader::decode`].
    pub fn decode_newest(region: &[u8]) -> AllocResult<(usize, Self)> {
        let half = region.len() / HEADER_SLOTS;
        let first = Self::decode(&region[..half]);
        let second = Self::decode(&region[half..]);
        match (first, second) {
            (Ok(a), Ok(b)) if b.checkpoint_wal_id > a.checkpoint_wal_id => Ok((1, b)),
            (Ok(a), _) => Ok((0, a)),
            (Err(_), Ok(b)) => Ok((1, b)),
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// The layout this header describes.
    pub(crate) fn layout(&self) -> AllocResult<BlobLayout> {
        BlobLayout::new(
            self.header_size,
            self.total_size,
            self.arena_size,
            self.alignment,
        )
    }

    /// Checks layout and arena records for internal consistency.
    fn validate(&self) -> AllocResult<()> {
        if !self.alignment.is_power_of_two()
            || self.header_size % self.alignment != 0
            || self.arena_size % self.alignment != 0
        {
            return Err(AllocError::corrupt_header("alignment does not fit the layout"));
        }
        let layout = self
            .layout()
            .map_err(|e| AllocError::corrupt_header(format!("impossible blob layout: {e}")))?;
        if self.arenas.len() > layout.max_arenas() as usize {
            return Err(AllocError::corrupt_header(format!(
                "{} arena records for {} arenas",
                self.arenas.len(),
                layout.max_arenas()
            )));
        }

        for (position, arena) in self.arenas.iter().enumerate() {
            if arena.index as usize != position {
                return Err(AllocError::corrupt_header(format!(
                    "arena record {position} has index {}",
                    arena.index
                )));
            }
            if layout.arena_bounds(arena.index) != Some((arena.offset, arena.size)) {
                return Err(AllocError::corrupt_header(format!(
                    "arena {} bounds do not match the blob layout",
                    arena.index
                )));
            }
            if arena.watermark > arena.size {
                return Err(AllocError::corrupt_header(format!(
                    "arena {} watermark beyond its end",
                    arena.index
                )));
            }
            let metadata = arena.metadata();
            if (arena.alloc_count == 0) != metadata.is_none()
                || metadata.wal_id > self.checkpoint_wal_id
                || metadata.copy >= METADATA_COPIES
            {
                return Err(AllocError::corrupt_header(format!(
                    "arena {} has an invalid metadata reference",
                    arena.index
                )));
            }
        }
        Ok(())
    }
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> AllocResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| AllocError::corrupt_header("header truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> AllocResult<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| AllocError::corrupt_header("header truncated"))
    }

    fn u16(&mut self) -> AllocResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> AllocResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> AllocResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
