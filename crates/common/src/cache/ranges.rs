//! Byte ranges within one block.

use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)` inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sorted, non-overlapping set of byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `range`, merging it with overlapping or adjacent ranges.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.end < merged.start {
                out.push(r);
            } else if r.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(r);
            } else {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Drop everything at or beyond `len`.
    pub fn clip(&mut self, len: usize) {
        self.ranges.retain_mut(|r| {
            r.end = r.end.min(len);
            !r.is_empty()
        });
    }

    pub fn covers(&self, range: ByteRange) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Copy the `dirty` ranges of `local` on top of `base`.
///
/// Bytes of `local` beyond its length read as zero.
pub fn overlay(base: &[u8], local: &[u8], dirty: &[ByteRange]) -> Vec<u8> {
    let len = dirty
        .iter()
        .map(|r| r.end)
        .max()
        .unwrap_or(0)
        .max(base.len());
    let mut out = base.to_vec();
    out.resize(len, 0);
    for r in dirty {
        for (i, byte) in out[r.start..r.end].iter_mut().enumerate() {
            *byte = local.get(r.start + i).copied().unwrap_or(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(10, 20));
        set.insert(ByteRange::new(30, 40));
        set.insert(ByteRange::new(20, 25));
        assert_eq!(
            set.as_slice(),
            &[ByteRange::new(10, 25), ByteRange::new(30, 40)]
        );
        set.insert(ByteRange::new(0, 35));
        assert_eq!(set.as_slice(), &[ByteRange::new(0, 40)]);
        assert!(set.covers(ByteRange::new(5, 39)));
    }

    #[test]
    fn test_insert_before_existing() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(50, 60));
        set.insert(ByteRange::new(0, 10));
        assert_eq!(
            set.as_slice(),
            &[ByteRange::new(0, 10), ByteRange::new(50, 60)]
        );
    }

    #[test]
    fn test_clip() {
        let mut set = RangeSet::new();
        set.insert(ByteRange::new(0, 10));
        set.insert(ByteRange::new(20, 30));
        set.clip(25);
        assert_eq!(
            set.as_slice(),
            &[ByteRange::new(0, 10), ByteRange::new(20, 25)]
        );
        set.clip(5);
        assert_eq!(set.as_slice(), &[ByteRange::new(0, 5)]);
    }

    #[test]
    fn test_overlay_only_copies_dirty_bytes() {
        let base = b"aaaaaaaaaa";
        let local = b"bbbbbbbbbbbb";
        let merged = overlay(base, local, &[ByteRange::new(2, 4), ByteRange::new(9, 12)]);
        assert_eq!(&merged, b"aabbaaaaabbb");
    }
}
