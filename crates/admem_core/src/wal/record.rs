//! WAL entry types and serialization.

use crate::error::{AllocError, AllocResult};
use crate::types::{ArenaId, WalId};
use admem_store::crc32;

/// Magic bytes identifying a WAL entry.
pub const WAL_MAGIC: [u8; 4] = *b"AWAL";

/// Current WAL entry format version.
pub const WAL_VERSION: u16 = 1;

/// magic + version + wal_id + count
const ENTRY_HEADER_SIZE: usize = 4 + 2 + 8 + 4;

/// opcode + arena + offset + len
const ACTION_SIZE: usize = 1 + 4 + 8 + 8;

const CRC_SIZE: usize = 4;

/// Type of a WAL action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalActionType {
    /// A reservation became a committed allocation.
    Publish = 1,
    /// A committed allocation was released.
    Free = 2,
}

impl WalActionType {
    /// Converts a byte to an action type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Publish),
            2 => Some(Self::Free),
            _ => None,
        }
    }

    /// Converts the action type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single durable allocator mutation.
///
/// Offsets are arena-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalAction {
    /// Record `[offset, offset + len)` of `arena` as allocated.
    Publish {
        /// Arena the extent belongs to.
        arena: ArenaId,
        /// Arena-relative start.
        offset: u64,
        /// Length in bytes.
        len: u64,
    },

    /// Release the allocation starting at `offset` in `arena`.
    Free {
        /// Arena the extent belongs to.
        arena: ArenaId,
        /// Arena-relative start.
        offset: u64,
        /// Length in bytes.
        len: u64,
    },
}

impl WalAction {
    /// Returns the action type.
    #[must_use]
    pub fn action_type(&self) -> WalActionType {
        match self {
            Self::Publish { .. } => WalActionType::Publish,
            Self::Free { .. } => WalActionType::Free,
        }
    }

    /// Returns the arena the action touches.
    #[must_use]
    pub fn arena(&self) -> ArenaId {
        match self {
            Self::Publish { arena, .. } | Self::Free { arena, .. } => *arena,
        }
    }

    fn fields(&self) -> (ArenaId, u64, u64) {
        match *self {
            Self::Publish { arena, offset, len } | Self::Free { arena, offset, len } => {
                (arena, offset, len)
            }
        }
    }
}

/// The durable record of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Id the store tagged this entry with.
    pub wal_id: WalId,
    /// Actions in the order they were staged.
    pub actions: Vec<WalAction>,
}

impl WalEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(wal_id: WalId, actions: Vec<WalAction>) -> Self {
        Self { wal_id, actions }
    }

    /// Returns the encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.actions.len() * ACTION_SIZE + CRC_SIZE
    }

    /// Serializes the entry.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the action count does not
    /// fit the 4-byte count field.
    pub fn encode(&self) -> AllocResult<Vec<u8>> {
        let count = u32::try_from(self.actions.len()).map_err(|_| {
            AllocError::invalid_argument(format!(
                "transaction has too many actions: {}",
                self.actions.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.wal_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());

        for action in &self.actions {
            let (arena, offset, len) = action.fields();
            buf.push(action.action_type().as_byte());
            buf.extend_from_slice(&arena.as_u32().to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
        }

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Deserializes an entry.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::WalCorruption`] for any malformed input.
    pub fn decode(data: &[u8]) -> AllocResult<Self> {
        if data.len() < ENTRY_HEADER_SIZE + CRC_SIZE {
            return Err(AllocError::wal_corruption(format!(
                "entry too short: {} bytes",
                data.len()
            )));
        }

        let body_len = data.len() - CRC_SIZE;
        let stored_crc = u32::from_le_bytes([
            data[body_len],
            data[body_len + 1],
            data[body_len + 2],
            data[body_len + 3],
        ]);
        let computed_crc = crc32(&data[..body_len]);
        if stored_crc != computed_crc {
            return Err(AllocError::wal_corruption(format!(
                "checksum mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
            )));
        }

        let body = &data[..body_len];
        let mut cursor = 0;

        let read_u8 = |cursor: &mut usize| -> AllocResult<u8> {
            let b = *body
                .get(*cursor)
                .ok_or_else(|| AllocError::wal_corruption("unexpected end of entry"))?;
            *cursor += 1;
            Ok(b)
        };

        let read_u16 = |cursor: &mut usize| -> AllocResult<u16> {
            if *cursor + 2 > body.len() {
                return Err(AllocError::wal_corruption("unexpected end of entry"));
            }
            let bytes: [u8; 2] = body[*cursor..*cursor + 2]
                .try_into()
                .map_err(|_| AllocError::wal_corruption("invalid u16"))?;
            *cursor += 2;
            Ok(u16::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> AllocResult<u32> {
            if *cursor + 4 > body.len() {
                return Err(AllocError::wal_corruption("unexpected end of entry"));
            }
            let bytes: [u8; 4] = body[*cursor..*cursor + 4]
                .try_into()
                .map_err(|_| AllocError::wal_corruption("invalid u32"))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_u64 = |cursor: &mut usize| -> AllocResult<u64> {
            if *cursor + 8 > body.len() {
                return Err(AllocError::wal_corruption("unexpected end of entry"));
            }
            let bytes: [u8; 8] = body[*cursor..*cursor + 8]
                .try_into()
                .map_err(|_| AllocError::wal_corruption("invalid u64"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };

        if body[0..4] != WAL_MAGIC {
            return Err(AllocError::wal_corruption("invalid entry magic"));
        }
        cursor += 4;

        let version = read_u16(&mut cursor)?;
        if version != WAL_VERSION {
            return Err(AllocError::wal_corruption(format!(
                "unsupported entry version: {version}"
            )));
        }

        let wal_id = WalId::new(read_u64(&mut cursor)?);
        let count = read_u32(&mut cursor)? as usize;

        let expected = ENTRY_HEADER_SIZE + count.saturating_mul(ACTION_SIZE);
        if expected != body.len() {
            return Err(AllocError::wal_corruption(format!(
                "entry length mismatch: {count} actions need {expected} bytes, got {}",
                body.len()
            )));
        }

        let mut actions = Vec::with_capacity(count);
        for _ in 0..count {
            let opcode = read_u8(&mut cursor)?;
            let action_type = WalActionType::from_byte(opcode).ok_or_else(|| {
                AllocError::wal_corruption(format!("unknown action opcode: {opcode}"))
            })?;
            let arena = ArenaId::new(read_u32(&mut cursor)?);
            let offset = read_u64(&mut cursor)?;
            let len = read_u64(&mut cursor)?;
            actions.push(match action_type {
                WalActionType::Publish => WalAction::Publish { arena, offset, len },
                WalActionType::Free => WalAction::Free { arena, offset, len },
            });
        }

        Ok(Self { wal_id, actions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WalEntry {
        WalEntry::new(
            WalId::new(42),
            vec![
                WalAction::Publish {
                    arena: ArenaId::new(0),
                    offset: 0,
                    len: 128,
                },
                WalAction::Free {
                    arena: ArenaId::new(3),
                    offset: 4096,
                    len: 256,
                },
            ],
        )
    }

    #[test]
    fn action_type_bytes() {
        assert_eq!(WalActionType::from_byte(1), Some(WalActionType::Publish));
        assert_eq!(WalActionType::from_byte(2), Some(WalActionType::Free));
        assert_eq!(WalActionType::from_byte(0), None);
        assert_eq!(WalActionType::Free.as_byte(), 2);
    }

    #[test]
    fn entry_encode_decode() {
        let entry = sample();
        let bytes = entry.encode().unwrap();
        assert_eq!(bytes.len(), entry.encoded_len());
        assert_eq!(&bytes[0..4], b"AWAL");
        assert_eq!(WalEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn empty_entry_is_valid() {
        let entry = WalEntry::new(WalId::new(1), Vec::new());
        let bytes = entry.encode().unwrap();
        assert_eq!(WalEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn decode_rejects_flipped_bit() {
        let mut bytes = sample().encode().unwrap();
        bytes[20] ^= 0x01;
        let result = WalEntry::decode(&bytes);
        assert!(matches!(result, Err(AllocError::WalCorruption { .. })));
    }

    #[test]
    fn decode_rejects_truncation() {
        let bytes = sample().encode().unwrap();
        assert!(WalEntry::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(WalEntry::decode(&bytes[..10]).is_err());
        assert!(WalEntry::decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        let len = bytes.len();
        let crc = crc32(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());
        let err = WalEntry::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut bytes = sample().encode().unwrap();
        bytes[ENTRY_HEADER_SIZE] = 9;
        let len = bytes.len();
        let crc = crc32(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());
        let err = WalEntry::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("opcode"));
    }

    #[test]
    fn decode_rejects_count_mismatch() {
        let mut bytes = sample().encode().unwrap();
        bytes[14..18].copy_from_slice(&5u32.to_le_bytes());
        let len = bytes.len();
        let crc = crc32(&bytes[..len - 4]);
        bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            WalEntry::decode(&bytes),
            Err(AllocError::WalCorruption { .. })
        ));
    }
}
