use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Bytes, BytesMut};

use super::FrameId;

/// One observed byte range and the frame that first supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveredRange {
    pub start: u64,
    pub data: Bytes,
    pub frame: FrameId,
    pub capture_index: u64,
}

impl CoveredRange {
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sub-range `[start, end)` of this range, clamped to its bounds.
    pub fn slice(&self, start: u64, end: u64) -> CoveredRange {
        let from = start.max(self.start);
        let to = end.min(self.end()).max(from);
        CoveredRange {
            start: from,
            data: self
                .data
                .slice((from - self.start) as usize..(to - self.start) as usize),
            frame: self.frame,
            capture_index: self.capture_index,
        }
    }
}

/// Ordered set of disjoint observed byte ranges.
///
/// Ranges never overlap and are keyed by start offset. Inserting a range that
/// intersects existing coverage only adds the uncovered pieces.
///
/// Everything below the floor counts as covered but its payload has been
/// released; only ranges at or above it hold bytes.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    ranges: BTreeMap<u64, CoveredRange>,
    covered: u64,
    floor: u64,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of bytes held.
    pub fn covered_len(&self) -> u64 {
        self.covered
    }

    /// Offset below which payload was released.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoveredRange> {
        self.ranges.values()
    }

    /// Ranges intersecting `[start, end)`, in offset order.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &CoveredRange> {
        let first = self
            .ranges
            .range(..=start)
            .next_back()
            .filter(|(_, r)| r.end() > start)
            .map(|(k, _)| *k)
            .unwrap_or(start);
        let end = end.max(first);
        self.ranges.range(first..end).map(|(_, r)| r)
    }

    /// Unobserved pieces of `[start, end)`.
    pub fn uncovered(&self, start: u64, end: u64) -> Vec<Range<u64>> {
        let mut holes = Vec::new();
        let start = start.max(self.floor);
        let mut cursor = start;
        for r in self.overlapping(start, end) {
            if r.start > cursor {
                holes.push(cursor..r.start);
            }
            cursor = cursor.max(r.end());
        }
        if cursor < end {
            holes.push(cursor..end);
        }
        holes
    }

    /// Insert the uncovered pieces of `range`. Returns the inserted pieces.
    pub fn insert(&mut self, range: CoveredRange) -> Vec<CoveredRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let holes = self.uncovered(range.start, range.end());
        let mut inserted = Vec::with_capacity(holes.len());
        for hole in holes {
            let piece = range.slice(hole.start, hole.end);
            self.covered += piece.len() as u64;
            self.ranges.insert(piece.start, piece.clone());
            inserted.push(piece);
        }
        inserted
    }

    /// The range starting exactly at `offset`.
    pub fn get(&self, offset: u64) -> Option<&CoveredRange> {
        self.ranges.get(&offset)
    }

    pub fn get_mut(&mut self, offset: u64) -> Option<&mut CoveredRange> {
        self.ranges.get_mut(&offset)
    }

    /// First range starting at or after `offset`.
    pub fn next_from(&self, offset: u64) -> Option<&CoveredRange> {
        self.ranges.range(offset..).next().map(|(_, r)| r)
    }

    /// End of the contiguous run of coverage starting at `offset`
    /// (`offset` itself when nothing starts there).
    pub fn contiguous_end(&self, offset: u64) -> u64 {
        let mut end = offset.max(self.floor);
        if let Some(r) = self.overlapping(end, end.saturating_add(1)).next() {
            end = r.end();
        }
        while let Some(r) = self.ranges.get(&end) {
            end = r.end();
        }
        end
    }

    /// Highest covered offset (exclusive).
    pub fn highest_end(&self) -> u64 {
        self.ranges
            .values()
            .next_back()
            .map(|r| r.end())
            .unwrap_or(0)
            .max(self.floor)
    }

    /// Unobserved ranges between `from` and the highest covered offset.
    pub fn gaps(&self, from: u64) -> Vec<Range<u64>> {
        let highest = self.highest_end();
        if highest <= from {
            return Vec::new();
        }
        self.uncovered(from, highest)
    }

    /// Pieces intersecting `[start, end)`, cut to those bounds.
    pub fn pieces(&self, start: u64, end: u64) -> Vec<CoveredRange> {
        self.overlapping(start, end)
            .map(|r| r.slice(start, end))
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Concatenated bytes of `[start, end)` if fully covered.
    pub fn bytes(&self, start: u64, end: u64) -> Option<Bytes> {
        if start >= end {
            return Some(Bytes::new());
        }
        let pieces = self.pieces(start, end);
        let contiguous = pieces.first().map(|p| p.start) == Some(start)
            && pieces.windows(2).all(|w| w[0].end() == w[1].start)
            && pieces.last().map(|p| p.end()) == Some(end);
        if !contiguous {
            return None;
        }
        if pieces.len() == 1 {
            return pieces.into_iter().next().map(|p| p.data);
        }
        let mut buf = BytesMut::with_capacity((end - start) as usize);
        for piece in &pieces {
            buf.extend_from_slice(&piece.data);
        }
        Some(buf.freeze())
    }

    /// Remove all coverage below `offset`, splitting a straddling range.
    pub fn discard_below(&mut self, offset: u64) {
        let straddling = self
            .ranges
            .range(..offset)
            .next_back()
            .filter(|(_, r)| r.end() > offset)
            .map(|(_, r)| r.slice(offset, r.end()));
        let kept = self.ranges.split_off(&offset);
        let removed: u64 = self.ranges.values().map(|r| r.len() as u64).sum();
        self.covered -= removed;
        self.ranges = kept;
        if let Some(tail) = straddling {
            self.covered += tail.len() as u64;
            self.ranges.insert(tail.start, tail);
        }
    }

    /// Release the payload below `offset`, keeping it counted as covered.
    ///
    /// Callers only release bytes that are contiguously covered.
    pub fn release_below(&mut self, offset: u64) {
        if offset <= self.floor {
            return;
        }
        self.discard_below(offset);
        self.floor = offset;
    }

    /// Drop all coverage.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.covered = 0;
        self.floor = 0;
    }
}
