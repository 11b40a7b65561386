//! # admem Testkit
//!
//! Test utilities for the admem allocator.
//!
//! This crate provides:
//! - Blob fixtures over memory and file stores
//! - A fault-injecting store wrapper
//! - Property-based test generators using proptest
//! - A crash/recovery harness comparing durable state across reopens
//! - Opt-in `tracing` output for tests
//!
//! ## Usage
//!
//! ```rust
//! use admem_testkit::prelude::*;
//! use admem_core::ArenaHint;
//!
//! with_temp_blob(|blob| {
//!     let r = blob.reserve(ArenaHint::Any, 64).unwrap().unwrap();
//!     blob.cancel(r).unwrap();
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;
pub mod harness;
mod logging;

pub use logging::init_test_logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::init_test_logging;
}
