//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The region does not fit in the store.
    #[error("region out of bounds: addr {addr}, size {size}, capacity {capacity}")]
    OutOfBounds {
        /// Start address of the region.
        addr: u64,
        /// Size of the region.
        size: u64,
        /// Capacity of the store.
        capacity: u64,
    },

    /// The buffer length does not match the region size.
    #[error("buffer length {buf_len} does not match region size {region_size}")]
    SizeMismatch {
        /// Size of the region.
        region_size: u64,
        /// Length of the caller's buffer.
        buf_len: usize,
    },

    /// The store's persistent data is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// The store is closed.
    #[error("store is closed")]
    Closed,

    /// A failure injected by a test harness.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Creates an injected failure.
    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected(message.into())
    }
}
