//! Core type definitions for admem.

use std::fmt;

/// Identifier of a transaction, handed out by the store's WAL.
///
/// WAL ids are strictly increasing per blob and define commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WalId(pub u64);

impl WalId {
    /// Creates a new WAL id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wal:{}", self.0)
    }
}

/// Index of an arena within its blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaId(pub u32);

impl ArenaId {
    /// Creates a new arena id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena:{}", self.0)
    }
}

/// Which arena a reservation may be carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArenaHint {
    /// Any arena: reuse freed space first, then extend.
    #[default]
    Any,
    /// Only the named arena.
    Arena(ArenaId),
}

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
