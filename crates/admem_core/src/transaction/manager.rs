//! Transaction manager.

use super::order::TxnOrder;
use super::state::{Transaction, TxAction};
use crate::arena::{Arena, ArenaRef, ArenaTable};
use crate::error::{AllocError, AllocResult};
use crate::reservation::Reservation;
use crate::stats::BlobStats;
use crate::types::{ArenaId, WalId};
use crate::wal::{WalAction, WalEntry};
use admem_store::StoreAdapter;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Stages, orders, logs and applies the transactions of one blob.
///
/// ## Commit Protocol
///
/// 1. Wait until every lower WAL id has resolved
/// 2. Take the commit lock
/// 3. Re-validate every staged action
/// 4. Submit the encoded entry to the store
/// 5. Apply the actions under the touched arena locks, lowest index first
///
/// A failure before step 5 leaves memory untouched.
pub(crate) struct TransactionManager {
    store: Arc<dyn StoreAdapter>,
    arenas: Arc<ArenaTable>,
    stats: Arc<BlobStats>,
    /// Identity of this open; reservations from other opens are rejected.
    incarnation: Uuid,
    closed: AtomicBool,
    order: TxnOrder,
    /// Serializes submit and apply, and excludes checkpoint and close.
    commit_lock: Mutex<()>,
    last_committed: AtomicU64,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("incarnation", &self.incarnation)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("last_committed", &self.last_committed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Creates a manager whose history ends at `last_committed`.
    pub(crate) fn new(
        store: Arc<dyn StoreAdapter>,
        arenas: Arc<ArenaTable>,
        stats: Arc<BlobStats>,
        last_committed: WalId,
    ) -> Self {
        Self {
            store,
            arenas,
            stats,
            incarnation: Uuid::new_v4(),
            closed: AtomicBool::new(false),
            order: TxnOrder::new(),
            commit_lock: Mutex::new(()),
            last_committed: AtomicU64::new(last_committed.as_u64()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub(crate) fn arenas(&self) -> &ArenaTable {
        &self.arenas
    }

    pub(crate) fn stats(&self) -> &BlobStats {
        &self.stats
    }

    pub(crate) fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub(crate) fn last_committed(&self) -> WalId {
        WalId::new(self.last_committed.load(Ordering::SeqCst))
    }

    pub(crate) fn set_last_committed(&self, id: WalId) {
        self.last_committed.store(id.as_u64(), Ordering::SeqCst);
    }

    pub(crate) fn open_transactions(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ensure_open(&self) -> AllocResult<()> {
        if self.is_closed() {
            return Err(AllocError::UseAfterClose);
        }
        Ok(())
    }

    /// Takes the commit lock, excluding commits while it is held.
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Begins a transaction with a fresh WAL id.
    pub(crate) fn begin(&self) -> AllocResult<Transaction<'_>> {
        self.ensure_open()?;
        let id = self.order.register(|| {
            self.store
                .reserve_wal_id()
                .map(WalId::new)
                .map_err(|source| AllocError::WalReserve { source })
        })?;

        let last = self.last_committed();
        if id <= last {
            self.order.release(id);
            return Err(AllocError::invalid_operation(format!(
                "store handed out {id}, not after last committed {last}"
            )));
        }

        self.stats.record_transaction_start();
        tracing::debug!(wal_id = id.as_u64(), "transaction begun");
        Ok(Transaction::new(self, id))
    }

    fn check_incarnation(&self, reservation: &Reservation) -> AllocResult<()> {
        if reservation.incarnation() != self.incarnation {
            return Err(AllocError::invalid_argument(format!(
                "reservation at {:#x} belongs to another blob handle",
                reservation.addr()
            )));
        }
        Ok(())
    }

    /// Arenas are dropped on close, so a missing arena may mean a closed blob.
    pub(crate) fn arena(&self, id: ArenaId) -> AllocResult<ArenaRef> {
        match self.arenas.get(id) {
            Some(arena) => Ok(arena),
            None => {
                self.ensure_open()?;
                Err(AllocError::invalid_argument(format!("{id} is not materialized")))
            }
        }
    }

    /// Marks `reservation` as published by transaction `id`.
    pub(crate) fn stage_publish(&self, id: WalId, reservation: &Reservation) -> AllocResult<TxAction> {
        self.ensure_open()?;
        self.check_incarnation(reservation)?;
        self.arena(reservation.arena())?
            .lock()
            .stage(reservation.cookie(), id)?;
        Ok(TxAction::Publish {
            arena: reservation.arena(),
            offset: reservation.offset(),
            len: reservation.len(),
            cookie: reservation.cookie(),
        })
    }

    /// Resolves `addr` to a committed allocation.
    pub(crate) fn check_free(&self, addr: u64) -> AllocResult<TxAction> {
        self.ensure_open()?;
        let (arena, offset) = self
            .arenas
            .locate(addr)
            .ok_or_else(|| AllocError::invalid_free(addr, "address is outside every arena"))?;
        let len = self
            .arenas
            .get(arena)
            .and_then(|a| a.lock().allocation_len(offset))
            .ok_or_else(|| {
                AllocError::invalid_free(addr, "address is not the start of an allocation")
            })?;
        Ok(TxAction::Free { arena, offset, len })
    }

    /// Commits transaction `id`; always releases its place in the order.
    pub(crate) fn commit(&self, id: WalId, actions: &[TxAction]) -> AllocResult<()> {
        let result = self.commit_inner(id, actions);
        match &result {
            Ok(()) => {
                self.stats.record_transaction_commit();
                tracing::debug!(wal_id = id.as_u64(), actions = actions.len(), "transaction committed");
            }
            Err(e) => {
                self.unstage(id, actions);
                self.stats.record_transaction_abort();
                tracing::debug!(wal_id = id.as_u64(), error = %e, "transaction commit failed");
            }
        }
        self.order.release(id);
        result
    }

    fn commit_inner(&self, id: WalId, actions: &[TxAction]) -> AllocResult<()> {
        self.ensure_open()?;
        self.order.wait_turn(id)?;
        let _commit = self.commit_lock.lock();
        self.ensure_open()?;

        if actions.is_empty() {
            self.last_committed.fetch_max(id.as_u64(), Ordering::SeqCst);
            return Ok(());
        }

        let wal_actions = self.validate(id, actions)?;
        let payload = WalEntry::new(id, wal_actions).encode()?;
        self.store
            .submit_wal(id.as_u64(), &payload)
            .map_err(|source| AllocError::WalSubmit {
                wal_id: id.as_u64(),
                source,
            })?;

        self.apply(actions);
        self.last_committed.fetch_max(id.as_u64(), Ordering::SeqCst);
        Ok(())
    }

    /// Checks every action against the current committed state.
    fn validate(&self, id: WalId, actions: &[TxAction]) -> AllocResult<Vec<WalAction>> {
        let mut wal_actions = Vec::with_capacity(actions.len());
        for action in actions {
            let arena = self.arena(action.arena())?;
            let guard = arena.lock();
            match *action {
                TxAction::Publish {
                    arena,
                    offset,
                    len,
                    cookie,
                } => {
                    if !guard.is_staged_by(cookie, id, offset, len) {
                        return Err(AllocError::invalid_operation(format!(
                            "reservation at {:#x} is no longer staged by {id}",
                            guard.base() + offset
                        )));
                    }
                    wal_actions.push(WalAction::Publish { arena, offset, len });
                }
                TxAction::Free { arena, offset, len } => {
                    if guard.allocation_len(offset) != Some(len) {
                        return Err(AllocError::invalid_free(
                            guard.base() + offset,
                            "allocation was freed by an earlier transaction",
                        ));
                    }
                    wal_actions.push(WalAction::Free { arena, offset, len });
                }
            }
        }
        Ok(wal_actions)
    }

    /// Applies validated actions under every touched arena lock.
    fn apply(&self, actions: &[TxAction]) {
        let mut touched: Vec<ArenaId> = actions.iter().map(TxAction::arena).collect();
        touched.sort_unstable();
        touched.dedup();

        let refs: Vec<(ArenaId, ArenaRef)> = touched
            .iter()
            .filter_map(|&id| self.arenas.get(id).map(|a| (id, a)))
            .collect();
        let mut guards: Vec<(ArenaId, MutexGuard<'_, Arena>)> =
            refs.iter().map(|(id, a)| (*id, a.lock())).collect();

        for action in actions {
            let Ok(slot) = guards.binary_search_by_key(&action.arena(), |(id, _)| *id) else {
                continue;
            };
            let arena = &mut guards[slot].1;
            match *action {
                TxAction::Publish {
                    offset,
                    len,
                    cookie,
                    ..
                } => {
                    arena.apply_publish(cookie, offset, len);
                    self.stats.record_publish(len);
                }
                TxAction::Free { offset, len, .. } => {
                    arena.apply_free(offset, len);
                    self.stats.record_free(len);
                }
            }
        }
    }

    /// Aborts transaction `id`.
    pub(crate) fn abort(&self, id: WalId, actions: &[TxAction]) {
        self.unstage(id, actions);
        self.order.release(id);
        self.stats.record_transaction_abort();
        tracing::debug!(wal_id = id.as_u64(), "transaction aborted");
    }

    fn unstage(&self, id: WalId, actions: &[TxAction]) {
        for action in actions {
            if let TxAction::Publish { arena, cookie, .. } = *action {
                if let Some(arena) = self.arenas.get(arena) {
                    arena.lock().unstage(cookie, id);
                }
            }
        }
    }
}
