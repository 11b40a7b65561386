//! Transaction state.

use super::manager::TransactionManager;
use crate::error::{AllocError, AllocResult};
use crate::reservation::Reservation;
use crate::types::{ArenaId, WalId};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting publish and free actions.
    Open,
    /// Durably committed.
    Committed,
    /// Discarded without writing anything.
    Aborted,
}

/// A staged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxAction {
    /// Turn a reservation into an allocation.
    Publish {
        arena: ArenaId,
        offset: u64,
        len: u64,
        cookie: u64,
    },
    /// Release a committed allocation.
    Free { arena: ArenaId, offset: u64, len: u64 },
}

impl TxAction {
    pub(crate) fn arena(&self) -> ArenaId {
        match self {
            Self::Publish { arena, .. } | Self::Free { arena, .. } => *arena,
        }
    }
}

/// A unit of durable allocator mutation.
///
/// Obtained from [`crate::Blob::begin`]. Publishes and frees are staged in
/// memory and reach the store as one WAL entry on commit. A transaction
/// dropped while still open is aborted.
///
/// Transactions on one blob commit in the order they began: `commit`
/// blocks until every earlier transaction has resolved.
#[derive(Debug)]
pub struct Transaction<'m> {
    manager: &'m TransactionManager,
    id: WalId,
    state: TransactionState,
    actions: Vec<TxAction>,
}

impl<'m> Transaction<'m> {
    pub(crate) fn new(manager: &'m TransactionManager, id: WalId) -> Self {
        Self {
            manager,
            id,
            state: TransactionState::Open,
            actions: Vec::new(),
        }
    }

    /// Returns the transaction's WAL id.
    #[must_use]
    pub fn id(&self) -> WalId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of staged actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Stages `reservation` to become an allocation on commit.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidArgument`] if the reservation comes from another
    ///   blob handle
    /// - [`AllocError::InvalidOperation`] if it is already published or no
    ///   longer outstanding
    pub fn publish(&mut self, reservation: &Reservation) -> AllocResult<()> {
        self.ensure_open()?;
        let action = self.manager.stage_publish(self.id, reservation)?;
        self.actions.push(action);
        Ok(())
    }

    /// Stages the allocation starting at `addr` to be released on commit.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidFree`] if `addr` is not the start of a
    /// committed allocation, or is already freed in this transaction.
    pub fn free(&mut self, addr: u64) -> AllocResult<()> {
        self.ensure_open()?;
        let action = self.manager.check_free(addr)?;
        if self.actions.contains(&action) {
            return Err(AllocError::invalid_free(
                addr,
                "already freed in this transaction",
            ));
        }
        self.actions.push(action);
        Ok(())
    }

    /// Resolves the transaction: aborts if `abort` is set, commits otherwise.
    ///
    /// # Errors
    ///
    /// See [`Transaction::commit`].
    pub fn end(self, abort: bool) -> AllocResult<()> {
        if abort {
            self.abort();
            Ok(())
        } else {
            self.commit()
        }
    }

    /// Commits every staged action atomically.
    ///
    /// On error nothing changes in memory, published reservations are
    /// outstanding again and may be canceled or published anew.
    ///
    /// # Errors
    ///
    /// - [`AllocError::InvalidOperation`] if an earlier transaction opened on
    ///   this thread is still open
    /// - [`AllocError::InvalidFree`] if another transaction freed the same
    ///   allocation first
    /// - [`AllocError::WalSubmit`] if the store rejected the entry
    /// - [`AllocError::UseAfterClose`] if the blob was closed
    pub fn commit(mut self) -> AllocResult<()> {
        let result = self.manager.commit(self.id, &self.actions);
        self.state = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::Aborted
        };
        result
    }

    /// Discards every staged action.
    pub fn abort(mut self) {
        self.manager.abort(self.id, &self.actions);
        self.state = TransactionState::Aborted;
    }

    fn ensure_open(&self) -> AllocResult<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(AllocError::invalid_operation(
                "transaction already committed",
            )),
            TransactionState::Aborted => {
                Err(AllocError::invalid_operation("transaction already aborted"))
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            self.manager.abort(self.id, &self.actions);
            self.state = TransactionState::Aborted;
        }
    }
}
