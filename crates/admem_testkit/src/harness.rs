//! Workload execution and crash recovery checks.
//!
//! [`Workload`] drives a blob with generated [`AllocOp`]s while tracking a
//! model of what should be outstanding and committed. [`durable_state`]
//! captures the part of a blob that must survive a crash, so tests can
//! compare it before a crash and after the reopen.
//!
//! ## Test Strategy
//!
//! 1. **Crash with outstanding reservations** - they are forgotten
//! 2. **Crash after commit** - committed allocations survive
//! 3. **Crash after a failed submit** - the transaction leaves no trace
//! 4. **Crash after checkpoint** - header plus WAL tail rebuild the state

use crate::generators::AllocOp;
use admem_core::{AllocResult, ArenaHint, ArenaId, Blob, Reservation};
use std::collections::BTreeMap;

/// The crash-surviving state of one arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableArena {
    /// Arena index.
    pub id: ArenaId,
    /// Committed watermark.
    pub watermark: u64,
    /// Committed allocations, arena-relative offset to length.
    pub allocations: BTreeMap<u64, u64>,
}

/// Captures the durable state of every arena that holds committed data.
///
/// Arenas materialized only by reservations are skipped: nothing about
/// them reaches the store.
pub fn durable_state(blob: &Blob) -> AllocResult<Vec<DurableArena>> {
    let mut arenas = Vec::new();
    for index in 0..blob.max_arenas() {
        let Some(info) = blob.arena_info(ArenaId::new(index))? else {
            break;
        };
        if info.watermark == 0 && info.allocations.is_empty() {
            continue;
        }
        arenas.push(DurableArena {
            id: info.id,
            watermark: info.watermark,
            allocations: info.allocations,
        });
    }
    Ok(arenas)
}

/// Checks that no two ranges overlap and all lie inside the blob's arenas.
///
/// Returns a description of the first violation.
pub fn check_disjoint<'a>(
    blob: &Blob,
    ranges: impl IntoIterator<Item = (&'a u64, &'a u64)>,
) -> Result<(), String> {
    let mut sorted: Vec<(u64, u64)> = ranges.into_iter().map(|(a, l)| (*a, *l)).collect();
    sorted.sort_unstable();

    let mut prev_end = blob.header_size();
    for (addr, len) in sorted {
        if addr < prev_end {
            return Err(format!("range {addr:#x}+{len} overlaps a lower range ending at {prev_end:#x}"));
        }
        prev_end = addr + len;
        if prev_end > blob.size() {
            return Err(format!("range {addr:#x}+{len} runs past the blob end"));
        }
    }
    Ok(())
}

/// A model-checked workload over one blob handle.
#[derive(Debug)]
pub struct Workload<'b> {
    blob: &'b Blob,
    outstanding: Vec<Reservation>,
    committed: BTreeMap<u64, u64>,
    commits: usize,
}

impl<'b> Workload<'b> {
    /// Starts a workload on `blob`, assuming nothing is outstanding.
    ///
    /// Allocations already committed are picked up from the arena state.
    pub fn new(blob: &'b Blob) -> AllocResult<Self> {
        let mut committed = BTreeMap::new();
        for arena in durable_state(blob)? {
            let base = blob.header_size() + u64::from(arena.id.as_u32()) * blob.arena_size();
            committed.extend(arena.allocations.iter().map(|(off, len)| (base + off, *len)));
        }
        Ok(Self {
            blob,
            outstanding: Vec::new(),
            committed,
            commits: 0,
        })
    }

    /// Committed allocations, address to length.
    pub fn committed(&self) -> &BTreeMap<u64, u64> {
        &self.committed
    }

    /// Sum of committed lengths.
    pub fn committed_bytes(&self) -> u64 {
        self.committed.values().sum()
    }

    /// Number of outstanding reservations.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Runs one step.
    ///
    /// # Errors
    ///
    /// Returns the first allocator error. The model is only updated when
    /// the step succeeded.
    pub fn apply(&mut self, op: &AllocOp) -> AllocResult<()> {
        match op {
            AllocOp::Reserve { size } => {
                if let Some(r) = self.blob.reserve(ArenaHint::Any, *size)? {
                    self.outstanding.push(r);
                }
            }
            AllocOp::Cancel { pick } => {
                if !self.outstanding.is_empty() {
                    let r = self.outstanding.swap_remove(pick % self.outstanding.len());
                    self.blob.cancel(r)?;
                }
            }
            AllocOp::Commit { publish, free } => {
                let publish = pick_indices(publish, self.outstanding.len());
                let free_addrs: Vec<u64> = pick_indices(free, self.committed.len())
                    .into_iter()
                    .filter_map(|i| self.committed.keys().nth(i).copied())
                    .collect();

                let mut tx = self.blob.begin()?;
                for &i in &publish {
                    tx.publish(&self.outstanding[i])?;
                }
                for &addr in &free_addrs {
                    tx.free(addr)?;
                }
                tx.commit()?;
                self.commits += 1;

                for addr in free_addrs {
                    self.committed.remove(&addr);
                }
                // Descending, so earlier indices stay valid.
                for i in publish.into_iter().rev() {
                    let r = self.outstanding.remove(i);
                    self.committed.insert(r.addr(), r.len());
                }
            }
            AllocOp::Abort { publish } => {
                let mut tx = self.blob.begin()?;
                for i in pick_indices(publish, self.outstanding.len()) {
                    tx.publish(&self.outstanding[i])?;
                }
                tx.abort();
            }
            AllocOp::Checkpoint => self.blob.checkpoint()?,
        }
        Ok(())
    }

    /// Runs every step in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step.
    pub fn run(&mut self, ops: &[AllocOp]) -> AllocResult<()> {
        ops.iter().try_for_each(|op| self.apply(op))
    }

    /// Checks the model: committed and outstanding ranges are disjoint and
    /// the blob's byte count matches the committed set.
    pub fn check(&self) -> Result<(), String> {
        let outstanding: Vec<(u64, u64)> =
            self.outstanding.iter().map(|r| (r.addr(), r.len())).collect();
        check_disjoint(
            self.blob,
            self.committed
                .iter()
                .chain(outstanding.iter().map(|(a, l)| (a, l))),
        )?;
        if self.blob.allocated_bytes() != self.committed_bytes() {
            return Err(format!(
                "blob reports {} allocated bytes, model has {}",
                self.blob.allocated_bytes(),
                self.committed_bytes()
            ));
        }
        Ok(())
    }

    /// Cancels every outstanding reservation.
    ///
    /// # Errors
    ///
    /// Returns the first cancel error.
    pub fn cancel_all(&mut self) -> AllocResult<()> {
        for r in self.outstanding.drain(..) {
            self.blob.cancel(r)?;
        }
        Ok(())
    }
}

/// Sorted, deduplicated indices into a list of `len` candidates.
fn pick_indices(picks: &[usize], len: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut indices: Vec<usize> = picks.iter().map(|p| p % len).collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}
