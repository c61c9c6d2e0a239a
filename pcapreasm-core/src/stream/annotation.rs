//! Per-frame reassembly annotations.
//!
//! The engine appends events to an [`AnnotationLog`] as it learns things.
//! Facts about a frame are often learned while processing a later frame
//! (a PDU that frame 3 started may only complete in frame 6), so the
//! folded [`FrameAnnotation`] of an earlier frame changes as the log grows.
//! Events are never removed or rewritten.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::ReassemblyError;

use super::{Classification, FrameId, StreamPath};

/// One fact about one frame on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationEvent {
    /// A segment of the frame was classified.
    Classified {
        path: StreamPath,
        classification: Classification,
    },
    /// The frame carries bytes of a PDU that is still open.
    SegmentOfPdu { path: StreamPath, pdu_start: u64 },
    /// The frame's bytes were part of a PDU completed in another frame.
    ReassembledIn {
        path: StreamPath,
        pdu_start: u64,
        completing_frame: FrameId,
    },
    /// A PDU completed while processing this frame.
    PduCompleted {
        path: StreamPath,
        record: PduRecord,
    },
    /// A PDU was closed incomplete at teardown.
    PduIncomplete {
        path: StreamPath,
        record: PduRecord,
    },
    /// The frame re-sent observed bytes with different content.
    Conflict {
        path: StreamPath,
        start: u64,
        end: u64,
        original_frame: FrameId,
    },
    /// Stream-scoped reassembly error.
    Error {
        path: StreamPath,
        error: ReassemblyError,
    },
    /// A layer parser failed on bytes of this frame.
    ParseError { path: StreamPath, message: String },
}

impl AnnotationEvent {
    pub fn path(&self) -> &StreamPath {
        match self {
            AnnotationEvent::Classified { path, .. }
            | AnnotationEvent::SegmentOfPdu { path, .. }
            | AnnotationEvent::ReassembledIn { path, .. }
            | AnnotationEvent::PduCompleted { path, .. }
            | AnnotationEvent::PduIncomplete { path, .. }
            | AnnotationEvent::Conflict { path, .. }
            | AnnotationEvent::Error { path, .. }
            | AnnotationEvent::ParseError { path, .. } => path,
        }
    }
}

/// Summary of a PDU for annotation purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduRecord {
    pub start_offset: u64,
    pub length: usize,
    pub originating_frames: SmallVec<[FrameId; 4]>,
    /// Set for incomplete PDUs closed from an exact request.
    pub bytes_missing: Option<usize>,
}

/// Conflict summary for annotation purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub start: u64,
    pub end: u64,
    pub original_frame: FrameId,
}

/// Append-only event log indexed by frame.
#[derive(Debug, Clone, Default)]
pub struct AnnotationLog {
    events: BTreeMap<FrameId, Vec<AnnotationEvent>>,
    len: usize,
}

impl AnnotationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: FrameId, event: AnnotationEvent) {
        self.events.entry(frame).or_default().push(event);
        self.len += 1;
    }

    /// Events recorded for `frame`, in recording order.
    pub fn events(&self, frame: FrameId) -> &[AnnotationEvent] {
        self.events.get(&frame).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Frames with at least one event, ascending.
    pub fn frames(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.events.keys().copied()
    }

    /// Total number of events.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fold the events of `frame` into a per-layer annotation.
    pub fn annotation(&self, frame: FrameId) -> FrameAnnotation {
        let mut annotation = FrameAnnotation {
            frame,
            layers: Vec::new(),
        };
        for event in self.events(frame) {
            let layer = annotation.layer_entry(event.path());
            match event {
                AnnotationEvent::Classified { classification, .. } => {
                    layer.classifications.push(*classification);
                }
                AnnotationEvent::SegmentOfPdu { .. } => layer.segment_of_pdu = true,
                AnnotationEvent::ReassembledIn {
                    completing_frame, ..
                } => {
                    if !layer.reassembled_in.contains(completing_frame) {
                        layer.reassembled_in.push(*completing_frame);
                    }
                }
                AnnotationEvent::PduCompleted { record, .. } => {
                    layer.completed_pdus.push(record.clone());
                }
                AnnotationEvent::PduIncomplete { record, .. } => {
                    layer.incomplete_pdus.push(record.clone());
                }
                AnnotationEvent::Conflict {
                    start,
                    end,
                    original_frame,
                    ..
                } => layer.conflicts.push(ConflictRecord {
                    start: *start,
                    end: *end,
                    original_frame: *original_frame,
                }),
                AnnotationEvent::Error { error, .. } => layer.errors.push(error.to_string()),
                AnnotationEvent::ParseError { message, .. } => layer.errors.push(message.clone()),
            }
        }
        annotation
    }
}

/// What one frame contributed to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAnnotation {
    pub path: StreamPath,
    pub classifications: Vec<Classification>,
    /// The frame carries bytes of a PDU that did not complete in it.
    pub segment_of_pdu: bool,
    /// Frames in which PDUs containing this frame's bytes completed.
    pub reassembled_in: Vec<FrameId>,
    pub completed_pdus: Vec<PduRecord>,
    pub incomplete_pdus: Vec<PduRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<String>,
}

impl LayerAnnotation {
    fn new(path: StreamPath) -> Self {
        Self {
            path,
            classifications: Vec::new(),
            segment_of_pdu: false,
            reassembled_in: Vec::new(),
            completed_pdus: Vec::new(),
            incomplete_pdus: Vec::new(),
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Add what `other` knows and this layer does not.
    fn absorb(&mut self, other: &LayerAnnotation) {
        self.segment_of_pdu |= other.segment_of_pdu;
        for frame in &other.reassembled_in {
            if !self.reassembled_in.contains(frame) {
                self.reassembled_in.push(*frame);
            }
        }
        extend_missing(&mut self.completed_pdus, &other.completed_pdus);
        extend_missing(&mut self.incomplete_pdus, &other.incomplete_pdus);
        extend_missing(&mut self.conflicts, &other.conflicts);
        extend_missing(&mut self.errors, &other.errors);
    }
}

fn extend_missing<T: Clone + PartialEq>(into: &mut Vec<T>, from: &[T]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// Everything known about one frame, grouped by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAnnotation {
    pub frame: FrameId,
    pub layers: Vec<LayerAnnotation>,
}

impl FrameAnnotation {
    fn layer_entry(&mut self, path: &StreamPath) -> &mut LayerAnnotation {
        let idx = match self.layers.iter().position(|l| &l.path == path) {
            Some(idx) => idx,
            None => {
                self.layers.push(LayerAnnotation::new(path.clone()));
                self.layers.len() - 1
            }
        };
        &mut self.layers[idx]
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, path: &StreamPath) -> Option<&LayerAnnotation> {
        self.layers.iter().find(|l| &l.path == path)
    }

    /// First frame a PDU holding this frame's bytes completed in, lowest layer first.
    pub fn reassembled_in(&self) -> Option<FrameId> {
        self.layers
            .iter()
            .filter(|l| !l.reassembled_in.is_empty())
            .min_by_key(|l| l.path.depth())
            .and_then(|l| l.reassembled_in.first().copied())
    }

    pub fn is_retransmission(&self) -> bool {
        self.has_classification(|c| c == Classification::Retransmission)
    }

    pub fn is_out_of_order(&self) -> bool {
        self.has_classification(|c| c == Classification::OutOfOrder)
    }

    pub fn segment_of_pdu(&self) -> bool {
        self.layers.iter().any(|l| l.segment_of_pdu)
    }

    pub fn completes_pdu(&self) -> bool {
        self.layers.iter().any(|l| !l.completed_pdus.is_empty())
    }

    pub fn has_conflict(&self) -> bool {
        self.layers.iter().any(|l| !l.conflicts.is_empty())
    }

    fn has_classification(&self, pred: impl Fn(Classification) -> bool) -> bool {
        self.layers
            .iter()
            .any(|l| l.classifications.iter().any(|c| pred(*c)))
    }

    /// Merge knowledge from a previous pass over the same capture.
    ///
    /// Classifications are kept as observed in this pass; everything learned
    /// retroactively (reassembly targets, completions, teardown results) is
    /// added from `earlier`.
    pub fn merge(&mut self, earlier: &FrameAnnotation) {
        for other in &earlier.layers {
            match self.layers.iter_mut().find(|l| l.path == other.path) {
                Some(layer) => layer.absorb(other),
                None => {
                    let mut layer = LayerAnnotation::new(other.path.clone());
                    layer.absorb(other);
                    layer.classifications = other.classifications.clone();
                    self.layers.push(layer);
                }
            }
        }
    }
}
