//! Blob configuration.

use crate::error::{AllocError, AllocResult};
use crate::header::{MAX_HEADER_SIZE, MIN_HEADER_SIZE};

/// Default arena size: 16 MiB.
pub const DEFAULT_ARENA_SIZE: u64 = 16 << 20;

/// Default size of the header region at the start of a blob: 32 KiB.
pub const DEFAULT_HEADER_SIZE: u64 = 32 << 10;

/// Default allocation granularity.
pub const DEFAULT_ALIGNMENT: u64 = 8;

/// Configuration for creating a blob.
///
/// Layout fields are persisted in the header at create time; on open they
/// are read back from the header and the values here are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConfig {
    /// Size of every arena except possibly the last one.
    pub arena_size: u64,

    /// Bytes reserved at address 0 for the blob header. Split into two
    /// alternating slots, each of which must name every arena.
    pub header_size: u64,

    /// Allocation granularity. Sizes are rounded up to it.
    pub alignment: u64,

    /// Whether `close` checkpoints the header and trims the WAL.
    pub checkpoint_on_close: bool,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            checkpoint_on_close: true,
        }
    }
}

impl BlobConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the arena size.
    #[must_use]
    pub const fn arena_size(mut self, size: u64) -> Self {
        self.arena_size = size;
        self
    }

    /// Sets the header size.
    #[must_use]
    pub const fn header_size(mut self, size: u64) -> Self {
        self.header_size = size;
        self
    }

    /// Sets the allocation granularity.
    #[must_use]
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets whether `close` checkpoints.
    #[must_use]
    pub const fn checkpoint_on_close(mut self, value: bool) -> Self {
        self.checkpoint_on_close = value;
        self
    }

    /// Validates the layout fields.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the alignment is not a power
    /// of two, or the header or arena size is not a multiple of it, or the
    /// header size is outside [`MIN_HEADER_SIZE`]..=[`MAX_HEADER_SIZE`] or
    /// not a multiple of 16.
    pub fn validate(&self) -> AllocResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(AllocError::invalid_argument(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.header_size < MIN_HEADER_SIZE {
            return Err(AllocError::invalid_argument(format!(
                "header size {} is below the minimum of {MIN_HEADER_SIZE}",
                self.header_size
            )));
        }
        if self.header_size > MAX_HEADER_SIZE || self.header_size % 16 != 0 {
            return Err(AllocError::invalid_argument(format!(
                "header size {} must be a multiple of 16 no larger than {MAX_HEADER_SIZE}",
                self.header_size
            )));
        }
        if self.header_size % self.alignment != 0 {
            return Err(AllocError::invalid_argument(format!(
                "header size {} is not a multiple of alignment {}",
                self.header_size, self.alignment
            )));
        }
        if self.arena_size == 0 || self.arena_size % self.alignment != 0 {
            return Err(AllocError::invalid_argument(format!(
                "arena size {} is not a positive multiple of alignment {}",
                self.arena_size, self.alignment
            )));
        }
        Ok(())
    }
}
