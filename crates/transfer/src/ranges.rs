use std::ops::Range;

/// Set of disjoint half-open byte ranges, kept sorted and coalesced.
///
/// Tracks which bytes of a download have been written so duplicate or
/// overlapping chunks are counted once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `range`, merging with neighbours it touches or overlaps.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.end < start {
                merged.push(r);
            } else if r.start > end {
                if !placed {
                    merged.push(start..end);
                    placed = true;
                }
                merged.push(r);
            } else {
                start = start.min(r.start);
                end = end.max(r.end);
            }
        }
        if !placed {
            merged.push(start..end);
        }
        self.ranges = merged;
    }

    /// Removes `range`, splitting any range it falls inside.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || r.start >= range.end {
                kept.push(r);
                continue;
            }
            if r.start < range.start {
                kept.push(r.start..range.start);
            }
            if r.end > range.end {
                kept.push(range.end..r.end);
            }
        }
        self.ranges = kept;
    }

    /// Total number of bytes covered.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Returns `true` if every byte of `range` is covered.
    pub fn contains_all(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }
}
