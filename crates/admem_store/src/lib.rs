//! # admem Store
//!
//! Store adapter contract and reference implementations for the admem
//! allocator.
//!
//! This crate is the lowest layer of admem. A store is an **opaque durable
//! region plus a write-ahead log**: it does not interpret the blob header or
//! the WAL entries it is handed.
//!
//! ## Design Principles
//!
//! - Region I/O is exact: the buffer length always equals the region size
//! - WAL ids are strictly increasing and never reused for a blob
//! - A submitted WAL entry is either fully durable or absent after a crash
//! - Stores must be `Send + Sync`; the allocator shares them behind an `Arc`
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral blobs
//! - [`FileStore`] - Region and WAL kept in two files on the local filesystem
//!
//! ## Example
//!
//! ```rust
//! use admem_store::{MemoryStore, Region, StoreAdapter};
//!
//! let store = MemoryStore::new(4096);
//! store.write(Region::new(128, 5), b"hello").unwrap();
//!
//! let mut buf = [0u8; 5];
//! store.read(Region::new(128, 5), &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//!
//! let id = store.reserve_wal_id().unwrap();
//! store.submit_wal(id, b"entry").unwrap();
//! assert_eq!(store.read_wal(0).unwrap(), vec![(id, b"entry".to_vec())]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod checksum;
mod error;
mod file;
mod memory;

pub use adapter::{Region, StoreAdapter, WalEntryBytes};
pub use checksum::crc32;
pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::MemoryStore;
