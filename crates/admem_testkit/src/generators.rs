//! Property-based test generators using proptest.
//!
//! Provides strategies for generating allocation sizes, layouts and
//! operation sequences that stay within the allocator's accepted inputs.

use admem_core::{ArenaMetadata, BlobConfig, MIN_HEADER_SIZE};
use proptest::prelude::*;

/// Strategy for reservation sizes, skewed towards small requests.
pub fn alloc_size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        4 => 1u64..=64,
        3 => 65u64..=4096,
        1 => 4097u64..=65536,
    ]
}

/// Strategy for power-of-two alignments between 8 and 4096.
pub fn alignment_strategy() -> impl Strategy<Value = u64> {
    (3u32..=12).prop_map(|shift| 1u64 << shift)
}

/// Strategy for valid blob identifiers.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,31}").expect("Invalid regex")
}

/// Strategy for small valid layouts: `(blob size, config)`.
///
/// Arenas are kept small so that workloads spill across several of them.
pub fn layout_strategy() -> impl Strategy<Value = (u64, BlobConfig)> {
    (
        1u64..=6,
        prop_oneof![Just(64u64 << 10), Just(128u64 << 10), Just(256u64 << 10)],
        (3u32..=6).prop_map(|shift| 1u64 << shift),
    )
        .prop_map(|(arena_count, arena_size, alignment)| {
            let header_size = MIN_HEADER_SIZE * 8;
            let config = BlobConfig::new()
                .arena_size(arena_size)
                .header_size(header_size)
                .alignment(alignment);
            let metadata = 2 * ArenaMetadata::block_size(arena_size, alignment);
            (header_size + arena_count * (arena_size + metadata), config)
        })
}

/// One step of a generated allocator workload.
///
/// Indices are taken modulo the number of candidates at the time the step
/// runs, so every generated sequence is executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocOp {
    /// Reserve a range anywhere.
    Reserve {
        /// Requested size.
        size: u64,
    },
    /// Cancel an outstanding reservation.
    Cancel {
        /// Which outstanding reservation.
        pick: usize,
    },
    /// Publish some outstanding reservations and free some committed
    /// allocations in one transaction.
    Commit {
        /// Outstanding reservations to publish.
        publish: Vec<usize>,
        /// Committed allocations to free.
        free: Vec<usize>,
    },
    /// Publish some outstanding reservations, then abort.
    Abort {
        /// Outstanding reservations to publish.
        publish: Vec<usize>,
    },
    /// Write a checkpoint.
    Checkpoint,
}

/// Strategy for a single workload step.
pub fn alloc_op_strategy() -> impl Strategy<Value = AllocOp> {
    let picks = || prop::collection::vec(any::<usize>(), 0..4);
    prop_oneof![
        6 => alloc_size_strategy().prop_map(|size| AllocOp::Reserve { size }),
        2 => any::<usize>().prop_map(|pick| AllocOp::Cancel { pick }),
        4 => (picks(), picks()).prop_map(|(publish, free)| AllocOp::Commit { publish, free }),
        1 => picks().prop_map(|publish| AllocOp::Abort { publish }),
        1 => Just(AllocOp::Checkpoint),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn alloc_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<AllocOp>> {
    prop::collection::vec(alloc_op_strategy(), 1..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn layouts_are_valid((size, config) in layout_strategy()) {
            prop_assert!(config.validate().is_ok());
            prop_assert!(size > config.header_size);
        }

        #[test]
        fn alignments_are_powers_of_two(a in alignment_strategy()) {
            prop_assert!(a.is_power_of_two());
            prop_assert!((8..=4096).contains(&a));
        }

        #[test]
        fn identifiers_are_accepted(id in identifier_strategy()) {
            prop_assert!(admem_core::Blob::prepare_open(&id).is_ok());
        }
    }
}
