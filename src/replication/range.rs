//! Download ranges — `spec.md` §4.12's `download({start?, end?, blocks?, linear?})`.
//!
//! No teacher module implements this (the teacher has no standalone replicator); grounded in
//! the shape `spec.md` §4.12 describes directly: a range is either a contiguous `start..end` or
//! an explicit membership set, with `end = -1`/`None` meaning "all".

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RANGE_ID: AtomicU64 = AtomicU64::new(1);

/// A requested download range, registered with a [`crate::replication::Replicator`].
#[derive(Debug, Clone)]
pub struct DownloadRange {
    id: u64,
    /// First index of interest (inclusive).
    pub start: u64,
    /// One past the last index of interest, or `None` for "all".
    pub end: Option<u64>,
    /// If set, only these indices are requested (overrides `start`/`end` membership).
    pub blocks: Option<Vec<u64>>,
    /// Whether blocks should be requested strictly in order.
    pub linear: bool,
}

impl DownloadRange {
    /// A contiguous range.
    pub fn new(start: u64, end: Option<u64>, linear: bool) -> Self {
        Self {
            id: NEXT_RANGE_ID.fetch_add(1, Ordering::SeqCst),
            start,
            end,
            blocks: None,
            linear,
        }
    }

    /// An explicit-membership range: `start = min(blocks)`, `end = max(blocks) + 1`.
    pub fn from_blocks(mut blocks: Vec<u64>, linear: bool) -> Self {
        blocks.sort_unstable();
        let start = blocks.first().copied().unwrap_or(0);
        let end = blocks.last().map(|last| last + 1);
        Self {
            id: NEXT_RANGE_ID.fetch_add(1, Ordering::SeqCst),
            start,
            end,
            blocks: Some(blocks),
            linear,
        }
    }

    /// This range's registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether `index` falls within this range.
    pub fn contains(&self, index: u64) -> bool {
        if let Some(blocks) = &self.blocks {
            return blocks.binary_search(&index).is_ok();
        }
        index >= self.start && self.end.map(|end| index < end).unwrap_or(true)
    }
}

/// A handle to a registered [`DownloadRange`]; `destroy` cancels it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeHandle {
    id: u64,
}

impl RangeHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    /// This handle's registration id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_range_contains_half_open_interval() {
        let range = DownloadRange::new(5, Some(10), false);
        assert!(!range.contains(4));
        assert!(range.contains(5));
        assert!(range.contains(9));
        assert!(!range.contains(10));
    }

    #[test]
    fn unbounded_range_contains_everything_past_start() {
        let range = DownloadRange::new(5, None, false);
        assert!(range.contains(5));
        assert!(range.contains(1_000_000));
        assert!(!range.contains(4));
    }

    #[test]
    fn block_membership_range_derives_bounds() {
        let range = DownloadRange::from_blocks(vec![7, 2, 5], false);
        assert_eq!(range.start, 2);
        assert_eq!(range.end, Some(8));
        assert!(range.contains(5));
        assert!(!range.contains(3));
    }
}
