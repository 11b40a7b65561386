//! Blob statistics.
//!
//! Counters for monitoring allocator activity.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = blob.stats();
//! println!("Reservations: {}", stats.reservations);
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Allocated: {} bytes", stats.allocated_bytes);
//!
//! let small = stats.size_class(64);
//! println!("64-byte class: {} reserved, {} failed", small.reserved, small.failed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of size classes tracked by [`BlobStats`].
///
/// Class `c` counts requests of at most `8 << c` bytes; the last class
/// also takes everything larger.
pub const SIZE_CLASSES: usize = 24;

const SMALLEST_CLASS: u64 = 8;

/// Size class of a `len`-byte request.
fn class_of(len: u64) -> usize {
    if len <= SMALLEST_CLASS {
        return 0;
    }
    let bits = (64 - (len - 1).leading_zeros()) as usize;
    (bits - SMALLEST_CLASS.trailing_zeros() as usize).min(SIZE_CLASSES - 1)
}

fn class_max(class: usize) -> u64 {
    if class + 1 == SIZE_CLASSES {
        u64::MAX
    } else {
        SMALLEST_CLASS << class
    }
}

#[derive(Debug, Default)]
struct ClassCounters {
    reserved: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
    freed: AtomicU64,
}

/// Blob statistics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values only grow, except for the `allocated_bytes` gauge.
#[derive(Debug, Default)]
pub struct BlobStats {
    // Reservation counters
    /// Reservations handed out.
    reservations: AtomicU64,
    /// Reserve calls that found no space.
    reservation_misses: AtomicU64,
    /// Reservations canceled.
    cancels: AtomicU64,

    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    /// Publish actions applied by committed transactions.
    publishes: AtomicU64,
    /// Free actions applied by committed transactions.
    frees: AtomicU64,

    // Recovery and maintenance
    wal_entries_replayed: AtomicU64,
    checkpoints: AtomicU64,

    /// Bytes currently covered by committed allocations.
    allocated_bytes: AtomicU64,

    size_classes: [ClassCounters; SIZE_CLASSES],
}

impl BlobStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_reservation(&self, len: u64) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
        self.size_classes[class_of(len)]
            .reserved
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reservation_miss(&self, len: u64) {
        self.reservation_misses.fetch_add(1, Ordering::Relaxed);
        self.size_classes[class_of(len)]
            .failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an applied publish of `len` bytes.
    pub(crate) fn record_publish(&self, len: u64) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(len, Ordering::Relaxed);
        self.size_classes[class_of(len)]
            .published
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records an applied free of `len` bytes.
    pub(crate) fn record_free(&self, len: u64) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_sub(len, Ordering::Relaxed);
        self.size_classes[class_of(len)]
            .freed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self) {
        self.wal_entries_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the allocated-bytes gauge after a rebuild.
    pub(crate) fn set_allocated_bytes(&self, bytes: u64) {
        self.allocated_bytes.store(bytes, Ordering::Relaxed);
    }

    // === Getters ===

    /// Returns the number of reservations handed out.
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Returns the number of reserve calls that found no space.
    pub fn reservation_misses(&self) -> u64 {
        self.reservation_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of canceled reservations.
    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions aborted.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of applied publish actions.
    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }

    /// Returns the number of applied free actions.
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Returns the number of WAL entries replayed on open.
    pub fn wal_entries_replayed(&self) -> u64 {
        self.wal_entries_replayed.load(Ordering::Relaxed)
    }

    /// Returns the number of checkpoints written.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns the bytes covered by committed allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Returns the counters of the size class that holds `len`-byte
    /// requests.
    pub fn size_class(&self, len: u64) -> SizeClassSnapshot {
        self.class_snapshot(class_of(len))
    }

    fn class_snapshot(&self, class: usize) -> SizeClassSnapshot {
        let counters = &self.size_classes[class];
        SizeClassSnapshot {
            max_size: class_max(class),
            reserved: counters.reserved.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            published: counters.published.load(Ordering::Relaxed),
            freed: counters.freed.load(Ordering::Relaxed),
        }
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reservations: self.reservations(),
            reservation_misses: self.reservation_misses(),
            cancels: self.cancels(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            publishes: self.publishes(),
            frees: self.frees(),
            wal_entries_replayed: self.wal_entries_replayed(),
            checkpoints: self.checkpoints(),
            allocated_bytes: self.allocated_bytes(),
            size_classes: (0..SIZE_CLASSES)
                .map(|class| self.class_snapshot(class))
                .collect(),
        }
    }
}

/// Counters of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeClassSnapshot {
    /// Largest request size counted in this class.
    pub max_size: u64,
    /// Reservations handed out.
    pub reserved: u64,
    /// Reserve calls that found no space.
    pub failed: u64,
    /// Applied publish actions.
    pub published: u64,
    /// Applied free actions.
    pub freed: u64,
}

impl SizeClassSnapshot {
    /// Committed allocations of this class still live since the handle
    /// was opened.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.published.saturating_sub(self.freed)
    }
}

/// A point-in-time snapshot of blob statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Reservations handed out.
    pub reservations: u64,
    /// Reserve calls that found no space.
    pub reservation_misses: u64,
    /// Reservations canceled.
    pub cancels: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Applied publish actions.
    pub publishes: u64,
    /// Applied free actions.
    pub frees: u64,
    /// WAL entries replayed on open.
    pub wal_entries_replayed: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Bytes covered by committed allocations.
    pub allocated_bytes: u64,
    /// Per-size-class counters, smallest class first.
    pub size_classes: Vec<SizeClassSnapshot>,
}

impl StatsSnapshot {
    /// Counters of the size class that holds `len`-byte requests.
    #[must_use]
    pub fn size_class(&self, len: u64) -> SizeClassSnapshot {
        self.size_classes
            .get(class_of(len))
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = BlobStats::new();
        assert_eq!(stats.reservations(), 0);
        assert_eq!(stats.transactions_committed(), 0);
        assert_eq!(stats.allocated_bytes(), 0);
    }

    #[test]
    fn allocated_bytes_gauge() {
        let stats = BlobStats::new();

        stats.record_publish(128);
        stats.record_publish(64);
        assert_eq!(stats.allocated_bytes(), 192);
        assert_eq!(stats.publishes(), 2);

        stats.record_free(128);
        assert_eq!(stats.allocated_bytes(), 64);
        assert_eq!(stats.frees(), 1);

        stats.set_allocated_bytes(0);
        assert_eq!(stats.allocated_bytes(), 0);
    }

    #[test]
    fn record_transactions() {
        let stats = BlobStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();

        assert_eq!(stats.transactions_started(), 2);
        assert_eq!(stats.transactions_committed(), 1);
        assert_eq!(stats.transactions_aborted(), 1);
    }

    #[test]
    fn snapshot() {
        let stats = BlobStats::new();
        stats.record_reservation(64);
        stats.record_reservation_miss(64);
        stats.record_cancel();
        stats.record_checkpoint();

        let snap = stats.snapshot();
        assert_eq!(snap.reservations, 1);
        assert_eq!(snap.reservation_misses, 1);
        assert_eq!(snap.cancels, 1);
        assert_eq!(snap.checkpoints, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(BlobStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_reservation(8);
                    s.record_publish(8);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.reservations(), 1000);
        assert_eq!(stats.allocated_bytes(), 8000);
        assert_eq!(stats.size_class(8).reserved, 1000);
        assert_eq!(stats.size_class(8).published, 1000);
    }

    #[test]
    fn size_class_boundaries() {
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(8), 0);
        assert_eq!(class_of(9), 1);
        assert_eq!(class_of(16), 1);
        assert_eq!(class_of(17), 2);
        assert_eq!(class_of(4096), 9);
        assert_eq!(class_of(8 << 22), 22);
        assert_eq!(class_of((8 << 22) + 1), 23);
        assert_eq!(class_of(u64::MAX), SIZE_CLASSES - 1);
        assert_eq!(class_max(9), 4096);
        assert_eq!(class_max(SIZE_CLASSES - 1), u64::MAX);
    }

    #[test]
    fn size_classes_track_requests() {
        let stats = BlobStats::new();
        stats.record_reservation(24);
        stats.record_reservation(32);
        stats.record_reservation_miss(4096);
        stats.record_publish(32);
        stats.record_free(32);
        stats.record_publish(1 << 20);

        let snap = stats.snapshot();
        assert_eq!(snap.size_classes.len(), SIZE_CLASSES);

        let class = snap.size_class(32);
        assert_eq!(class.max_size, 32);
        assert_eq!(class.reserved, 2);
        assert_eq!(class.published, 1);
        assert_eq!(class.live(), 0);

        assert_eq!(snap.size_class(4000).failed, 1);
        assert_eq!(snap.size_class(1 << 20).live(), 1);
        assert_eq!(
            snap.size_class(8),
            SizeClassSnapshot {
                max_size: 8,
                ..SizeClassSnapshot::default()
            }
        );
    }
}
