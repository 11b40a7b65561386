//! # admem Core
//!
//! Transactional allocator for durable, byte-addressable blobs.
//!
//! A blob is a fixed-size region of a store. The first `header_size` bytes
//! hold two alternating header slots, the end of the blob holds two
//! fixed-size metadata blocks per arena, and the space between is split
//! into arenas that hand out ranges.
//!
//! This crate provides:
//! - Two-phase blob creation and opening over any [`StoreAdapter`]
//! - Arena-based reservations with per-arena locking
//! - Transactions that publish reservations and free allocations atomically
//! - A write-ahead log replayed on open, plus torn-write-safe checkpoints
//!
//! ## Allocation Lifecycle
//!
//! ```text
//! reserve ──► Reservation ──publish──► Transaction ──commit──► allocation
//!                  │                        │                      │
//!                cancel                   abort                  free (in a
//!                  ▼                        ▼                   later commit)
//!              reusable            reservation outstanding
//! ```
//!
//! ## Example
//!
//! ```rust
//! use admem_core::{ArenaHint, Blob, BlobConfig};
//! use admem_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new(1 << 20));
//! let config = BlobConfig::new().arena_size(1 << 16).header_size(4096);
//! let blob = Blob::prepare_create("doc", 1 << 20, config)
//!     .unwrap()
//!     .post_create(store.clone())
//!     .unwrap();
//!
//! let r = blob.reserve(ArenaHint::Any, 256).unwrap().unwrap();
//! let addr = r.addr();
//! let mut tx = blob.begin().unwrap();
//! tx.publish(&r).unwrap();
//! tx.commit().unwrap();
//! drop(blob);
//!
//! // Committed allocations survive a crash.
//! let blob = Blob::prepare_open("doc").unwrap().post_open(store).unwrap();
//! let mut tx = blob.begin().unwrap();
//! tx.free(addr).unwrap();
//! tx.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod blob;
mod config;
mod error;
mod header;
mod layout;
mod metadata;
mod reservation;
mod stats;
mod transaction;
mod types;
mod wal;

pub use arena::{ArenaInfo, ReservationSource};
pub use blob::{Blob, PreparedCreate, PreparedOpen};
pub use config::{BlobConfig, DEFAULT_ALIGNMENT, DEFAULT_ARENA_SIZE, DEFAULT_HEADER_SIZE};
pub use error::{AllocError, AllocResult};
pub use header::{
    ArenaRecord, BlobHeader, HeaderPrefix, ARENA_RECORD_SIZE, HEADER_MAGIC, HEADER_PREFIX_SIZE,
    HEADER_VERSION, MAX_HEADER_SIZE, MAX_IDENTIFIER_LEN, MIN_HEADER_SIZE,
};
pub use metadata::{ArenaMetadata, METADATA_MAGIC, METADATA_VERSION};
pub use reservation::{Reservation, ReserveAttrs};
pub use stats::{BlobStats, SizeClassSnapshot, StatsSnapshot, SIZE_CLASSES};
pub use transaction::{Transaction, TransactionState};
pub use types::{ArenaHint, ArenaId, WalId};
pub use wal::{WalAction, WalActionType, WalEntry, WAL_MAGIC, WAL_VERSION};

// Re-export store types for convenience
pub use admem_store::{FileStore, MemoryStore, Region, StoreAdapter, StoreError, StoreResult};
