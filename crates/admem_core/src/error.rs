//! Error types for the allocator engine.

use admem_store::StoreError;
use thiserror::Error;

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur in allocator operations.
///
/// Running out of space is not an error: [`crate::Blob::reserve`] returns
/// `Ok(None)` so callers can test for capacity cheaply.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Malformed size, offset, identifier or handle.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The blob header failed validation on open.
    #[error("corrupt blob header: {message}")]
    CorruptHeader {
        /// Description of the corruption.
        message: String,
    },

    /// The blob header was written by an unsupported format version.
    #[error("incompatible blob format version {found} (supported: {supported})")]
    IncompatibleVersion {
        /// Version found in the header.
        found: u16,
        /// Version this build understands.
        supported: u16,
    },

    /// Freeing an address that is not the start of an allocated extent.
    #[error("invalid free of address {addr:#x}: {message}")]
    InvalidFree {
        /// The address passed to free.
        addr: u64,
        /// Why the free was rejected.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The store rejected a region write.
    #[error("store write failed: {source}")]
    StoreWrite {
        /// The store's error.
        #[source]
        source: StoreError,
    },

    /// The store rejected a region or WAL read.
    #[error("store read failed: {source}")]
    StoreRead {
        /// The store's error.
        #[source]
        source: StoreError,
    },

    /// The store could not hand out a WAL id.
    #[error("WAL id reservation failed: {source}")]
    WalReserve {
        /// The store's error.
        #[source]
        source: StoreError,
    },

    /// The store could not persist a WAL entry.
    #[error("WAL submit failed for wal:{wal_id}: {source}")]
    WalSubmit {
        /// The WAL id of the failed entry.
        wal_id: u64,
        /// The store's error.
        #[source]
        source: StoreError,
    },

    /// A persisted WAL entry could not be decoded or replayed.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The blob handle has been closed.
    #[error("blob is closed")]
    UseAfterClose,
}

impl AllocError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corrupt header error.
    pub fn corrupt_header(message: impl Into<String>) -> Self {
        Self::CorruptHeader {
            message: message.into(),
        }
    }

    /// Creates an invalid free error.
    pub fn invalid_free(addr: u64, message: impl Into<String>) -> Self {
        Self::InvalidFree {
            addr,
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }
}
