use std::ops::Range;

use bytes::Bytes;
use tracing::trace;

use super::{CoverageMap, CoveredRange, FrameId, StreamId};

/// A captured byte range for one stream.
#[derive(Debug, Clone)]
pub struct Segment {
    pub stream: StreamId,
    pub offset: u64,
    pub payload: Bytes,
    pub frame: FrameId,
    pub capture_index: u64,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.payload.len() as u64
    }
}

/// How a segment relates to what the stream has already observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Starts at the contiguous end with nothing buffered beyond it.
    New,
    /// Every byte was already observed.
    Retransmission,
    /// Some bytes were already observed; `new_bytes` were not.
    Overlap { new_bytes: u64 },
    /// Leaves or stays behind a gap at the contiguous end.
    OutOfOrder,
    /// Closes the gap at the contiguous end and releases buffered bytes.
    FillsGap,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Retransmission => "retransmission",
            Classification::Overlap { .. } => "overlap",
            Classification::OutOfOrder => "out_of_order",
            Classification::FillsGap => "fills_gap",
        }
    }
}

/// Classify `[start, end)` against the coverage of a stream.
///
/// This is the single decision point for segment classification; the result
/// depends only on the coverage map, the contiguous end and the range.
pub fn classify(
    coverage: &CoverageMap,
    contiguous_end: u64,
    start: u64,
    end: u64,
) -> Classification {
    let len = end.saturating_sub(start);
    let new_bytes: u64 = coverage
        .uncovered(start, end)
        .iter()
        .map(|r| r.end - r.start)
        .sum();

    if new_bytes == 0 {
        return Classification::Retransmission;
    }
    if new_bytes < len {
        return Classification::Overlap { new_bytes };
    }
    if start > contiguous_end {
        return Classification::OutOfOrder;
    }

    // Entirely new bytes can't start below the contiguous end, so start == contiguous_end.
    match coverage.next_from(contiguous_end) {
        None => Classification::New,
        Some(buffered) if end >= buffered.start => Classification::FillsGap,
        Some(_) => Classification::OutOfOrder,
    }
}

/// Content disagreement between two frames for the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapConflict {
    pub start: u64,
    pub end: u64,
    pub original_frame: FrameId,
    pub conflicting_frame: FrameId,
    /// The rejected version; the original stays authoritative for delivery.
    pub conflicting_data: Bytes,
}

/// Result of observing one segment.
#[derive(Debug, Clone)]
pub struct Observation {
    pub classification: Classification,
    /// Newly contiguous bytes in offset order, each with its own frame.
    pub released: Vec<CoveredRange>,
    /// New bytes beyond a gap, when out-of-order delivery is enabled.
    pub provisional: Vec<CoveredRange>,
    /// Parts of the segment that were already observed (frame attribution only).
    pub duplicates: Vec<CoveredRange>,
    pub conflicts: Vec<OverlapConflict>,
}

/// Per-stream statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub segment_count: u32,
    pub retransmit_count: u32,
    pub overlap_count: u32,
    pub out_of_order_count: u32,
    pub gap_fill_count: u32,
    pub gap_count: u32,
    pub conflict_count: u32,
    pub bytes_buffered: u64,
    pub contiguous_end: u64,
}

/// Tracks which offsets of one stream have been observed and releases bytes
/// in offset order.
#[derive(Debug)]
pub struct SequenceSpace {
    stream: StreamId,
    coverage: CoverageMap,
    /// Everything below this offset has been observed and released.
    contiguous_end: u64,
    out_of_order_delivery: bool,
    conflicts: Vec<OverlapConflict>,
    stats: StreamStats,
}

impl SequenceSpace {
    pub fn new(stream: StreamId, out_of_order_delivery: bool) -> Self {
        Self {
            stream,
            coverage: CoverageMap::new(),
            contiguous_end: 0,
            out_of_order_delivery,
            conflicts: Vec::new(),
            stats: StreamStats::default(),
        }
    }

    /// Observe a segment. Returns `None` for zero-length segments.
    pub fn observe(&mut self, segment: &Segment) -> Option<Observation> {
        if segment.is_empty() {
            return None;
        }

        let start = segment.offset;
        let end = segment.end();
        let classification = classify(&self.coverage, self.contiguous_end, start, end);

        let mut duplicates = Vec::new();
        let mut conflicts = Vec::new();
        let mut reattribute = Vec::new();

        // Released bytes can't be compared, only attributed
        let floor = self.coverage.floor();
        if start < floor {
            let hi = end.min(floor);
            duplicates.push(CoveredRange {
                start,
                data: segment.payload.slice(..(hi - start) as usize),
                frame: segment.frame,
                capture_index: segment.capture_index,
            });
        }
        for existing in self.coverage.overlapping(start, end) {
            let lo = existing.start.max(start);
            let hi = existing.end().min(end);
            let ours = segment
                .payload
                .slice((lo - start) as usize..(hi - start) as usize);
            let theirs = &existing.data[(lo - existing.start) as usize..(hi - existing.start) as usize];

            if ours[..] != theirs[..] {
                conflicts.push(OverlapConflict {
                    start: lo,
                    end: hi,
                    original_frame: existing.frame,
                    conflicting_frame: segment.frame,
                    conflicting_data: ours.clone(),
                });
            } else if segment.capture_index < existing.capture_index
                && existing.start >= self.contiguous_end
                && lo == existing.start
                && hi == existing.end()
            {
                // Earliest capture order wins for bytes nobody has consumed yet
                reattribute.push(existing.start);
            }

            duplicates.push(CoveredRange {
                start: lo,
                data: ours,
                frame: segment.frame,
                capture_index: segment.capture_index,
            });
        }
        for offset in reattribute {
            if let Some(range) = self.coverage.get_mut(offset) {
                range.frame = segment.frame;
                range.capture_index = segment.capture_index;
            }
        }

        let inserted = self.coverage.insert(CoveredRange {
            start,
            data: segment.payload.clone(),
            frame: segment.frame,
            capture_index: segment.capture_index,
        });

        let previous_end = self.contiguous_end;
        self.contiguous_end = self.coverage.contiguous_end(previous_end);
        let released = if self.contiguous_end > previous_end {
            self.coverage.pieces(previous_end, self.contiguous_end)
        } else {
            Vec::new()
        };
        let provisional = if self.out_of_order_delivery {
            inserted
                .into_iter()
                .filter(|r| r.start >= self.contiguous_end)
                .collect()
        } else {
            Vec::new()
        };

        self.stats.segment_count += 1;
        match classification {
            Classification::Retransmission => self.stats.retransmit_count += 1,
            Classification::Overlap { .. } => self.stats.overlap_count += 1,
            Classification::OutOfOrder => self.stats.out_of_order_count += 1,
            Classification::FillsGap => self.stats.gap_fill_count += 1,
            Classification::New => {}
        }
        self.stats.conflict_count += conflicts.len() as u32;
        self.conflicts.extend(conflicts.iter().cloned());

        trace!(
            stream = %self.stream,
            frame = segment.frame,
            offset = start,
            len = segment.len(),
            classification = classification.as_str(),
            contiguous_end = self.contiguous_end,
            "observed segment"
        );

        Some(Observation {
            classification,
            released,
            provisional,
            duplicates,
            conflicts,
        })
    }

    /// Offset up to which every byte has been observed and released.
    pub fn contiguous_end(&self) -> u64 {
        self.contiguous_end
    }

    /// Highest observed offset (exclusive).
    pub fn highest_end(&self) -> u64 {
        self.coverage.highest_end().max(self.contiguous_end)
    }

    /// Unobserved ranges between the contiguous end and the highest observed offset.
    pub fn gaps(&self) -> Vec<Range<u64>> {
        self.coverage.gaps(self.contiguous_end)
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    /// Observed bytes of `[start, end)` if all of them are still held.
    pub fn bytes(&self, start: u64, end: u64) -> Option<Bytes> {
        self.coverage.bytes(start, end)
    }

    /// Lowest offset whose payload is still held.
    pub fn retained_from(&self) -> u64 {
        self.coverage.floor()
    }

    /// Drop payload below `offset` (clamped to the contiguous end). The range
    /// stays observed, so later copies of it are still retransmissions, but
    /// their content is no longer checked for conflicts.
    pub fn release_below(&mut self, offset: u64) {
        let offset = offset.min(self.contiguous_end);
        if offset > self.coverage.floor() {
            trace!(stream = %self.stream, offset, "released payload");
            self.coverage.release_below(offset);
        }
    }

    /// Content conflicts observed so far.
    pub fn conflicts(&self) -> &[OverlapConflict] {
        &self.conflicts
    }

    /// Whether any conflict intersects `[start, end)`.
    pub fn has_conflict(&self, start: u64, end: u64) -> bool {
        self.conflicts.iter().any(|c| c.start < end && c.end > start)
    }

    /// Bytes observed beyond the contiguous end (held back by a gap).
    pub fn buffered_bytes(&self) -> u64 {
        self.coverage
            .iter()
            .filter(|r| r.start >= self.contiguous_end)
            .map(|r| r.len() as u64)
            .sum()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            gap_count: self.gaps().len() as u32,
            bytes_buffered: self.buffered_bytes(),
            contiguous_end: self.contiguous_end,
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(offset: u64, data: &'static [u8], frame: FrameId) -> Segment {
        Segment {
            stream: StreamId(1),
            offset,
            payload: Bytes::from_static(data),
            frame,
            capture_index: frame,
        }
    }

    fn released_bytes(obs: &Observation) -> Vec<u8> {
        obs.released.iter().flat_map(|r| r.data.to_vec()).collect()
    }

    // Test 1: In-order segments are New and released immediately
    #[test]
    fn test_in_order() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        let a = space.observe(&seg(0, b"Hello", 1)).unwrap();
        let b = space.observe(&seg(5, b" World", 2)).unwrap();
        assert_eq!(a.classification, Classification::New);
        assert_eq!(b.classification, Classification::New);
        assert_eq!(released_bytes(&b), b" World");
        assert_eq!(space.contiguous_end(), 11);
    }

    // Test 2: Gap closing releases the buffered run in one delivery
    #[test]
    fn test_gap_closing() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        let first = space.observe(&seg(0, b"a", 1)).unwrap();
        let second = space.observe(&seg(2, b"cdef", 2)).unwrap();
        assert_eq!(first.classification, Classification::New);
        assert_eq!(second.classification, Classification::OutOfOrder);
        assert!(second.released.is_empty());
        assert_eq!(space.gaps(), vec![1..2]);

        let third = space.observe(&seg(1, b"b", 3)).unwrap();
        assert_eq!(third.classification, Classification::FillsGap);
        assert_eq!(released_bytes(&third), b"bcdef");
        assert_eq!(third.released[0].frame, 3);
        assert_eq!(third.released[1].frame, 2);
        assert!(space.gaps().is_empty());
    }

    // Test 3: Retransmission is idempotent
    #[test]
    fn test_retransmission_idempotent() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(0, b"Hello", 1)).unwrap();
        let again = space.observe(&seg(0, b"Hello", 2)).unwrap();
        assert_eq!(again.classification, Classification::Retransmission);
        assert!(again.released.is_empty());
        assert_eq!(again.duplicates.len(), 1);
        assert!(again.conflicts.is_empty());
        assert_eq!(space.coverage().covered_len(), 5);
        assert_eq!(space.stats().retransmit_count, 1);
    }

    // Test 4: Overlap counts only the new suffix
    #[test]
    fn test_overlap_union() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(0, b"Hello", 1)).unwrap();
        let obs = space.observe(&seg(3, b"loWorld", 2)).unwrap();
        assert_eq!(obs.classification, Classification::Overlap { new_bytes: 5 });
        assert_eq!(released_bytes(&obs), b"World");
        assert_eq!(space.coverage().covered_len(), 10);
        assert_eq!(space.bytes(0, 10).unwrap(), Bytes::from_static(b"HelloWorld"));
    }

    // Test 5: Partial gap narrowing stays out-of-order
    #[test]
    fn test_partial_gap_is_out_of_order() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(2, b"2", 1)).unwrap();
        let obs = space.observe(&seg(0, b"H", 2)).unwrap();
        assert_eq!(obs.classification, Classification::OutOfOrder);
        assert_eq!(released_bytes(&obs), b"H");
        assert_eq!(space.gaps(), vec![1..2]);
    }

    // Test 6: Different content for covered bytes is a conflict, first version kept
    #[test]
    fn test_conflicting_retransmission() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(0, b"abcd", 1)).unwrap();
        let obs = space.observe(&seg(1, b"XY", 2)).unwrap();
        assert_eq!(obs.classification, Classification::Retransmission);
        assert_eq!(obs.conflicts.len(), 1);
        assert_eq!(obs.conflicts[0].start, 1);
        assert_eq!(obs.conflicts[0].end, 3);
        assert_eq!(obs.conflicts[0].original_frame, 1);
        assert_eq!(space.bytes(0, 4).unwrap(), Bytes::from_static(b"abcd"));
        assert!(space.has_conflict(2, 3));
        assert!(!space.has_conflict(3, 4));
    }

    // Test 7: Provisional delivery hands out-of-order bytes over immediately
    #[test]
    fn test_provisional_delivery() {
        let mut space = SequenceSpace::new(StreamId(1), true);
        let obs = space.observe(&seg(4, b"late", 1)).unwrap();
        assert_eq!(obs.classification, Classification::OutOfOrder);
        assert!(obs.released.is_empty());
        assert_eq!(obs.provisional.len(), 1);
        assert_eq!(obs.provisional[0].start, 4);

        let fill = space.observe(&seg(0, b"ear.", 2)).unwrap();
        assert_eq!(fill.classification, Classification::FillsGap);
        assert!(fill.provisional.is_empty());
        assert_eq!(released_bytes(&fill), b"ear.late");
    }

    // Test 8: Earlier capture order takes over attribution of undelivered bytes
    #[test]
    fn test_capture_order_tie_break() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        let mut later = seg(4, b"tail", 9);
        later.capture_index = 9;
        space.observe(&later).unwrap();

        let mut earlier = seg(4, b"tail", 3);
        earlier.capture_index = 3;
        let obs = space.observe(&earlier).unwrap();
        assert_eq!(obs.classification, Classification::Retransmission);

        let fill = space.observe(&seg(0, b"head", 10)).unwrap();
        assert_eq!(fill.released[1].frame, 3);
    }

    // Test 9: Zero-length segments are not observed
    #[test]
    fn test_zero_length() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        assert!(space.observe(&seg(0, b"", 1)).is_none());
        assert_eq!(space.stats().segment_count, 0);
    }

    // Test 10: Released payload still classifies retransmissions
    #[test]
    fn test_release_keeps_classification() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(0, b"Hello", 1)).unwrap();
        space.observe(&seg(5, b"World", 2)).unwrap();
        space.release_below(8);
        assert_eq!(space.retained_from(), 8);
        assert_eq!(space.coverage().covered_len(), 2);

        let again = space.observe(&seg(0, b"HelloWorl", 3)).unwrap();
        assert_eq!(again.classification, Classification::Retransmission);
        assert!(again.released.is_empty());
        assert!(again.conflicts.is_empty());
        assert_eq!(again.duplicates.len(), 2);
        assert_eq!(again.duplicates[0].data, Bytes::from_static(b"HelloWor"));
        assert_eq!(again.duplicates[1].start, 8);

        // Different content below the floor goes unnoticed, above it is caught
        let changed = space.observe(&seg(3, b"XXXXXX", 4)).unwrap();
        assert_eq!(changed.classification, Classification::Retransmission);
        assert_eq!(changed.conflicts.len(), 1);
        assert_eq!((changed.conflicts[0].start, changed.conflicts[0].end), (8, 9));

        let next = space.observe(&seg(10, b"!", 5)).unwrap();
        assert_eq!(next.classification, Classification::New);
        assert_eq!(space.contiguous_end(), 11);

        // Never beyond the contiguous end
        space.release_below(100);
        assert_eq!(space.retained_from(), 11);
    }

    // Test 11: Stats track buffered bytes and gaps
    #[test]
    fn test_stats() {
        let mut space = SequenceSpace::new(StreamId(1), false);
        space.observe(&seg(0, b"Hello", 1)).unwrap();
        space.observe(&seg(10, b"World", 2)).unwrap();
        let stats = space.stats();
        assert_eq!(stats.segment_count, 2);
        assert_eq!(stats.out_of_order_count, 1);
        assert_eq!(stats.gap_count, 1);
        assert_eq!(stats.bytes_buffered, 5);
        assert_eq!(stats.contiguous_end, 5);
    }
}
