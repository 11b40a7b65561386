//! Reservations and per-request attributes.

use crate::arena::ReservationSource;
use crate::error::{AllocError, AllocResult};
use crate::types::ArenaId;
use uuid::Uuid;

/// Extra constraints for one [`crate::Blob::reserve_with`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReserveAttrs {
    /// Required alignment of the returned address. Must be a power of two.
    /// Values below the blob alignment have no effect.
    pub alignment: Option<u64>,
}

impl ReserveAttrs {
    /// Creates attributes with no extra constraints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the returned address to be a multiple of `alignment`.
    #[must_use]
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Returns the alignment to use given the blob's own granularity.
    pub(crate) fn effective_alignment(&self, blob_alignment: u64) -> AllocResult<u64> {
        match self.alignment {
            None => Ok(blob_alignment),
            Some(a) if a.is_power_of_two() => Ok(a.max(blob_alignment)),
            Some(a) => Err(AllocError::invalid_argument(format!(
                "requested alignment {a} is not a power of two"
            ))),
        }
    }
}

/// A tentatively carved range of a blob.
///
/// Nothing about a reservation reaches the store until a transaction
/// publishes it and commits. Resolve it by publishing it in a transaction
/// or by handing it to [`crate::Blob::cancel`]. An unresolved reservation is
/// forgotten on crash or close.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    addr: u64,
    arena: ArenaId,
    offset: u64,
    len: u64,
    cookie: u64,
    incarnation: Uuid,
    source: ReservationSource,
}

impl Reservation {
    pub(crate) fn new(
        arena: ArenaId,
        base: u64,
        offset: u64,
        len: u64,
        cookie: u64,
        incarnation: Uuid,
        source: ReservationSource,
    ) -> Self {
        Self {
            addr: base + offset,
            arena,
            offset,
            len,
            cookie,
            incarnation,
            source,
        }
    }

    /// Blob address of the first byte.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Arena the range belongs to.
    #[must_use]
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// Arena-relative offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved length, rounded up to the blob alignment.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always `false`; reservations are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Where the range was carved from.
    #[must_use]
    pub fn source(&self) -> ReservationSource {
        self.source
    }

    pub(crate) fn cookie(&self) -> u64 {
        self.cookie
    }

    pub(crate) fn incarnation(&self) -> Uuid {
        self.incarnation
    }
}
