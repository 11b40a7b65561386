//! Fault injection for store adapters.
//!
//! [`FaultyStore`] wraps any store and fails selected operations on demand,
//! so tests can check that a failed store call leaves no trace in memory
//! or on media. [`Fault::TornWrite`] persists half of a region write before
//! failing, the way a power cut mid-write would.

use admem_store::{Region, StoreAdapter, StoreError, StoreResult, WalEntryBytes};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `read` fails.
    Read,
    /// `write` fails.
    Write,
    /// `reserve_wal_id` fails.
    ReserveWalId,
    /// `submit_wal` fails.
    SubmitWal,
    /// `discard_wal` fails.
    DiscardWal,
    /// `write` persists the first half of its buffer, then fails.
    TornWrite,
}

/// A store wrapper that can fail operations on demand.
pub struct FaultyStore {
    inner: Arc<dyn StoreAdapter>,
    fail_read: AtomicBool,
    fail_write: AtomicBool,
    fail_reserve: AtomicBool,
    fail_submit: AtomicBool,
    fail_discard: AtomicBool,
    tear_write: AtomicBool,
    /// Remaining whole writes before an armed `TornWrite` tears one.
    writes_before_tear: AtomicU64,
    /// Remaining successful submits before `submit_wal` starts failing.
    submits_before_failure: AtomicU64,
    submitted: AtomicU64,
}

impl fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyStore")
            .field("capacity", &self.inner.capacity())
            .field("submitted", &self.submitted())
            .finish_non_exhaustive()
    }
}

impl FaultyStore {
    /// Wraps `inner` with every fault disarmed.
    pub fn new(inner: Arc<dyn StoreAdapter>) -> Self {
        Self {
            inner,
            fail_read: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            fail_reserve: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            fail_discard: AtomicBool::new(false),
            tear_write: AtomicBool::new(false),
            writes_before_tear: AtomicU64::new(0),
            submits_before_failure: AtomicU64::new(u64::MAX),
            submitted: AtomicU64::new(0),
        }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &Arc<dyn StoreAdapter> {
        &self.inner
    }

    fn flag(&self, fault: Fault) -> &AtomicBool {
        match fault {
            Fault::Read => &self.fail_read,
            Fault::Write => &self.fail_write,
            Fault::ReserveWalId => &self.fail_reserve,
            Fault::SubmitWal => &self.fail_submit,
            Fault::DiscardWal => &self.fail_discard,
            Fault::TornWrite => &self.tear_write,
        }
    }

    /// Makes every later call of `fault`'s operation fail.
    pub fn arm(&self, fault: Fault) {
        self.flag(fault).store(true, Ordering::SeqCst);
    }

    /// Lets `fault`'s operation succeed again.
    pub fn disarm(&self, fault: Fault) {
        self.flag(fault).store(false, Ordering::SeqCst);
    }

    /// Lets `n` more writes through whole, then tears every later one.
    pub fn tear_write_after(&self, n: u64) {
        self.writes_before_tear.store(n, Ordering::SeqCst);
        self.arm(Fault::TornWrite);
    }

    /// Lets `n` more submits through, then fails every later one.
    pub fn fail_submit_after(&self, n: u64) {
        self.submits_before_failure.store(n, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn reset(&self) {
        for fault in [
            Fault::Read,
            Fault::Write,
            Fault::ReserveWalId,
            Fault::SubmitWal,
            Fault::DiscardWal,
            Fault::TornWrite,
        ] {
            self.disarm(fault);
        }
        self.writes_before_tear.store(0, Ordering::SeqCst);
        self.submits_before_failure.store(u64::MAX, Ordering::SeqCst);
    }

    /// Number of entries this wrapper passed to the inner store.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.flag(fault).load(Ordering::SeqCst) {
            return Err(StoreError::injected(format!("{fault:?}")));
        }
        Ok(())
    }

    fn tears_next_write(&self) -> bool {
        self.tear_write.load(Ordering::SeqCst)
            && self
                .writes_before_tear
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_err()
    }

    fn take_submit_budget(&self) -> StoreResult<()> {
        let result = self
            .submits_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(StoreError::injected("SubmitWal budget exhausted")),
        }
    }
}

impl StoreAdapter for FaultyStore {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn read(&self, region: Region, buf: &mut [u8]) -> StoreResult<()> {
        self.check(Fault::Read)?;
        self.inner.read(region, buf)
    }

    fn write(&self, region: Region, buf: &[u8]) -> StoreResult<()> {
        self.check(Fault::Write)?;
        if self.tears_next_write() {
            let half = buf.len() / 2;
            self.inner.write(Region::new(region.addr, half as u64), &buf[..half])?;
            return Err(StoreError::injected("TornWrite"));
        }
        self.inner.write(region, buf)
    }

    fn reserve_wal_id(&self) -> StoreResult<u64> {
        self.check(Fault::ReserveWalId)?;
        self.inner.reserve_wal_id()
    }

    fn submit_wal(&self, id: u64, payload: &[u8]) -> StoreResult<()> {
        self.check(Fault::SubmitWal)?;
        self.take_submit_budget()?;
        self.inner.submit_wal(id, payload)?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_wal(&self, after: u64) -> StoreResult<Vec<WalEntryBytes>> {
        self.check(Fault::Read)?;
        self.inner.read_wal(after)
    }

    fn discard_wal(&self, upto: u64) -> StoreResult<()> {
        self.check(Fault::DiscardWal)?;
        self.inner.discard_wal(upto)
    }
}
