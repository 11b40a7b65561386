//! WAL replay on open.

use super::manager::TransactionManager;
use crate::error::{AllocError, AllocResult};
use crate::types::WalId;
use crate::wal::{WalAction, WalEntry};

impl TransactionManager {
    /// Replays every WAL entry after `checkpoint` and rebuilds volatile state.
    ///
    /// Returns the number of entries replayed.
    ///
    /// # Errors
    ///
    /// - [`AllocError::StoreRead`] if the log cannot be read
    /// - [`AllocError::WalCorruption`] if an entry cannot be decoded or
    ///   contradicts the state built so far
    pub(crate) fn recover(&self, checkpoint: WalId) -> AllocResult<usize> {
        let entries = self
            .store()
            .read_wal(checkpoint.as_u64())
            .map_err(|source| AllocError::StoreRead { source })?;

        let granule = self.arenas().layout().alignment();
        let mut last = checkpoint;
        for (raw_id, payload) in &entries {
            let id = WalId::new(*raw_id);
            if id <= last {
                return Err(AllocError::wal_corruption(format!(
                    "entry {id} is out of order after {last}"
                )));
            }

            let entry = WalEntry::decode(payload)?;
            if entry.wal_id != id {
                return Err(AllocError::wal_corruption(format!(
                    "entry stored as {id} claims to be {}",
                    entry.wal_id
                )));
            }

            for action in &entry.actions {
                let arena = self.arenas().ensure(action.arena()).ok_or_else(|| {
                    AllocError::wal_corruption(format!(
                        "entry {id} references {} beyond the blob",
                        action.arena()
                    ))
                })?;
                let mut arena = arena.lock();
                match *action {
                    WalAction::Publish { offset, len, .. } => {
                        if offset % granule != 0 || len % granule != 0 {
                            return Err(AllocError::wal_corruption(format!(
                                "entry {id} publishes [{offset}, +{len}) off the {granule}-byte grid"
                            )));
                        }
                        arena.replay_publish(offset, len)?;
                    }
                    WalAction::Free { offset, len, .. } => arena.replay_free(offset, len)?,
                }
            }

            self.stats().record_replayed();
            tracing::debug!(wal_id = id.as_u64(), actions = entry.actions.len(), "replayed WAL entry");
            last = id;
        }

        let allocated = self.arenas().rebuild_all();
        self.stats().set_allocated_bytes(allocated);
        self.set_last_committed(last);
        Ok(entries.len())
    }
}
