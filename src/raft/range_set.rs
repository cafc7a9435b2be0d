//! Mergeable set of half-open position ranges (§4.I), used by the controller
//! to track which byte ranges a lagging peer still needs from catch-up.

use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

struct Inner {
    /// Ranges keyed by `start`, pairwise disjoint and non-adjacent (adjacent
    /// or overlapping ranges are merged on insert).
    ranges: BTreeMap<u64, u64>,
}

/// An ordered, internally-synchronized set of `[start, end)` ranges.
pub struct RangeSet {
    inner: Mutex<Inner>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { ranges: BTreeMap::new() }) }
    }

    /// Inserts `[start, end)`, merging with any range it overlaps or touches.
    pub fn insert(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut inner = self.inner.lock().unwrap();

        let mut new_start = start;
        let mut new_end = end;

        // Merge with the range immediately before (if it overlaps/touches).
        if let Some((&prev_start, &prev_end)) = inner.ranges.range(..=new_start).next_back() {
            if prev_end >= new_start {
                new_start = new_start.min(prev_start);
                new_end = new_end.max(prev_end);
                inner.ranges.remove(&prev_start);
            }
        }

        // Merge with every subsequent range that overlaps/touches.
        let overlapping: Vec<u64> =
            inner.ranges.range(new_start..).take_while(|&(&s, _)| s <= new_end).map(|(&s, _)| s).collect();
        for s in overlapping {
            if let Some(e) = inner.ranges.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        inner.ranges.insert(new_start, new_end);
    }

    /// Pops the lowest range. The caller re-inserts any unserviced remainder.
    pub fn take_first(&self) -> Option<Range> {
        let mut inner = self.inner.lock().unwrap();
        let first = inner.ranges.keys().next().copied()?;
        let end = inner.ranges.remove(&first).expect("key just read");
        Some(Range { start: first, end })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ranges.len()
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_overlapping_and_adjacent() {
        let set = RangeSet::new();
        set.insert(10, 20);
        set.insert(20, 30); // adjacent, merges
        set.insert(5, 12); // overlaps front, merges
        assert_eq!(set.len(), 1);
        assert_eq!(set.take_first(), Some(Range { start: 5, end: 30 }));
    }

    #[test]
    fn insert_keeps_disjoint_ranges_separate() {
        let set = RangeSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        assert_eq!(set.len(), 2);
        assert_eq!(set.take_first(), Some(Range { start: 0, end: 10 }));
        assert_eq!(set.take_first(), Some(Range { start: 20, end: 30 }));
        assert!(set.is_empty());
    }

    #[test]
    fn take_first_on_empty_returns_none() {
        let set = RangeSet::new();
        assert_eq!(set.take_first(), None);
    }

    #[test]
    fn empty_insert_is_noop() {
        let set = RangeSet::new();
        set.insert(5, 5);
        assert!(set.is_empty());
    }
}
