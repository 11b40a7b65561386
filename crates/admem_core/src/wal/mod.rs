//! Write-ahead log entries.
//!
//! Every committed transaction is described by exactly one [`WalEntry`],
//! handed to the store through [`admem_store::StoreAdapter::submit_wal`]
//! tagged with the transaction's WAL id. The store treats the payload as
//! opaque bytes; this module owns the format.
//!
//! ## Entry Format
//!
//! ```text
//! | magic "AWAL" (4) | version (2) | wal_id (8) | count (4) | actions | crc32 (4) |
//! ```
//!
//! Each action is a fixed 21-byte record:
//!
//! ```text
//! | opcode (1) | arena (4) | offset (8) | len (8) |
//! ```
//!
//! ## Recovery Policy
//!
//! The store guarantees atomic submission, so every entry it hands back on
//! open is expected to be whole. Any decode failure (bad magic, unknown
//! version or opcode, CRC mismatch, trailing bytes, id mismatch) is fatal
//! and the blob does not open.

mod record;

pub use record::{WalAction, WalActionType, WalEntry, WAL_MAGIC, WAL_VERSION};
