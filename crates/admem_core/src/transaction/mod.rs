//! Transactions over allocator metadata.
//!
//! A transaction groups publishes and frees into one atomic, durably logged
//! unit:
//! - **Atomicity**: all staged actions reach the store as a single WAL entry
//! - **Ordering**: transactions commit in WAL-id order
//! - **Durability**: a commit returns only after the store acknowledged the entry
//! - **Recovery**: on open, entries after the last checkpoint are replayed
//!
//! Reservations stay volatile until published and committed; frees only
//! become reusable once their transaction has committed.

mod manager;
mod order;
mod recovery;
mod state;

pub(crate) use manager::TransactionManager;
pub use state::{Transaction, TransactionState};
