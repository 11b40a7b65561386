//! Coalescing free-extent registry.

use crate::types::align_up;
use std::collections::BTreeMap;

/// A set of disjoint, non-adjacent `[start, start + len)` ranges.
///
/// Inserting a range merges it with any neighbor it touches, so two extents
/// in the map never share an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ExtentMap {
    extents: BTreeMap<u64, u64>,
}

impl ExtentMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Builds the complement of `allocations` within `[0, limit)`.
    pub(crate) fn gaps(limit: u64, allocations: &BTreeMap<u64, u64>) -> Self {
        let mut map = Self::new();
        let mut cursor = 0u64;
        for (&start, &len) in allocations {
            if start > cursor {
                map.insert(cursor, start - cursor);
            }
            cursor = cursor.max(start + len);
        }
        if limit > cursor {
            map.insert(cursor, limit - cursor);
        }
        map
    }

    /// Adds `[start, start + len)`, merging with adjacent extents.
    pub(crate) fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut end = start + len;

        if let Some((&prev_start, &prev_len)) = self.extents.range(..=start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "overlapping free extent");
            if prev_start + prev_len == start {
                self.extents.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_len) = self.extents.get(&end).copied() {
            self.extents.remove(&end);
            end += next_len;
        }

        self.extents.insert(start, end - start);
    }

    /// Removes `[start, start + len)`, which must lie inside one extent.
    ///
    /// Returns `false` and leaves the map unchanged otherwise.
    pub(crate) fn take(&mut self, start: u64, len: u64) -> bool {
        let Some((&ext_start, &ext_len)) = self.extents.range(..=start).next_back() else {
            return false;
        };
        let ext_end = ext_start + ext_len;
        let end = start + len;
        if end > ext_end {
            return false;
        }

        self.extents.remove(&ext_start);
        if start > ext_start {
            self.extents.insert(ext_start, start - ext_start);
        }
        if ext_end > end {
            self.extents.insert(end, ext_end - end);
        }
        true
    }

    /// Finds the lowest offset where `len` bytes fit with `base + offset`
    /// aligned to `align`.
    pub(crate) fn first_fit(&self, len: u64, base: u64, align: u64) -> Option<u64> {
        self.extents.iter().find_map(|(&start, &ext_len)| {
            let aligned = align_up(base + start, align)? - base;
            let end = aligned.checked_add(len)?;
            (end <= start + ext_len).then_some(aligned)
        })
    }

    /// Removes and returns the extent ending exactly at `end`, if any.
    pub(crate) fn remove_ending_at(&mut self, end: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.extents.range(..end).next_back()?;
        if start + len != end {
            return None;
        }
        self.extents.remove(&start);
        Some((start, len))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.iter().map(|(&s, &l)| (s, l))
    }

    pub(crate) fn len(&self) -> usize {
        self.extents.len()
    }

    /// Total bytes covered.
    pub(crate) fn total(&self) -> u64 {
        self.extents.values().sum()
    }
}
