//! Commit ordering.

use crate::error::{AllocError, AllocResult};
use crate::types::WalId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::thread::{self, ThreadId};

/// Tracks open transactions so they commit in WAL-id order.
///
/// A transaction may only commit once every transaction with a lower id
/// has committed or aborted.
#[derive(Debug, Default)]
pub(crate) struct TxnOrder {
    open: Mutex<BTreeMap<WalId, ThreadId>>,
    turn: Condvar,
}

impl TxnOrder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Obtains an id from `reserve` and registers it as open.
    ///
    /// `reserve` runs under the ordering lock, so registration order
    /// matches id order.
    pub(crate) fn register<F>(&self, reserve: F) -> AllocResult<WalId>
    where
        F: FnOnce() -> AllocResult<WalId>,
    {
        let mut open = self.open.lock();
        let id = reserve()?;
        open.insert(id, thread::current().id());
        Ok(id)
    }

    /// Blocks until `id` is the lowest open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidOperation`] if a lower transaction was
    /// opened by the calling thread and is still open; waiting for it would
    /// never end.
    pub(crate) fn wait_turn(&self, id: WalId) -> AllocResult<()> {
        let me = thread::current().id();
        let mut open = self.open.lock();
        loop {
            match open.keys().next() {
                Some(&first) if first == id => return Ok(()),
                None => {
                    return Err(AllocError::invalid_operation(format!(
                        "transaction {id} is not registered"
                    )))
                }
                Some(_) => {}
            }
            if let Some((&blocker, _)) = open.range(..id).find(|&(_, &owner)| owner == me) {
                return Err(AllocError::invalid_operation(format!(
                    "transaction {id} cannot commit before {blocker}, which this thread still holds open"
                )));
            }
            self.turn.wait(&mut open);
        }
    }

    /// Removes `id` and wakes waiting committers.
    pub(crate) fn release(&self, id: WalId) {
        let mut open = self.open.lock();
        if open.remove(&id).is_some() {
            self.turn.notify_all();
        }
    }

    /// Number of open transactions.
    pub(crate) fn len(&self) -> usize {
        self.open.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counter() -> impl Fn() -> AllocResult<WalId> {
        let next = AtomicU64::new(1);
        move || Ok(WalId::new(next.fetch_add(1, Ordering::SeqCst)))
    }

    #[test]
    fn lowest_open_id_goes_first() {
        let order = TxnOrder::new();
        let ids = counter();
        let a = order.register(&ids).unwrap();
        let b = order.register(&ids).unwrap();
        assert!(a < b);
        assert_eq!(order.len(), 2);

        assert!(order.wait_turn(a).is_ok());
        order.release(a);
        assert!(order.wait_turn(b).is_ok());
        order.release(b);
        assert_eq!(order.len(), 0);
    }

    #[test]
    fn same_thread_blocker_is_reported() {
        let order = TxnOrder::new();
        let ids = counter();
        let a = order.register(&ids).unwrap();
        let b = order.register(&ids).unwrap();

        let err = order.wait_turn(b).unwrap_err();
        assert!(matches!(err, AllocError::InvalidOperation { .. }));
        order.release(a);
        assert!(order.wait_turn(b).is_ok());
    }

    #[test]
    fn register_propagates_reserve_failure() {
        let order = TxnOrder::new();
        let result = order.register(|| Err(AllocError::invalid_operation("no ids")));
        assert!(result.is_err());
        assert_eq!(order.len(), 0);
    }

    #[test]
    fn waiter_wakes_when_lower_id_resolves() {
        let order = Arc::new(TxnOrder::new());
        let ids = counter();
        let first = order.register(&ids).unwrap();

        let waiter = {
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let second = order.register(|| Ok(WalId::new(first.as_u64() + 1))).unwrap();
                order.wait_turn(second).unwrap();
                order.release(second);
            })
        };

        thread::sleep(Duration::from_millis(20));
        order.release(first);
        waiter.join().unwrap();
        assert_eq!(order.len(), 0);
    }
}
