use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::ReassemblyError;

use super::{CoverageMap, CoveredRange, FrameId, StreamId, StreamPath};

/// How many bytes a consumer needs for its next PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduRequest {
    /// The PDU is exactly this long.
    Exact(usize),
    /// The PDU is at least this long; the consumer decides the boundary later.
    AtLeast(usize),
}

impl PduRequest {
    pub fn len(&self) -> usize {
        match self {
            PduRequest::Exact(n) | PduRequest::AtLeast(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Refers to the open PDU of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PduHandle {
    pub stream: StreamId,
    pub index: u64,
}

/// Whether a PDU was fully reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    /// Delivered at teardown; `bytes_missing` is known for exact requests.
    Incomplete { bytes_missing: Option<usize> },
}

/// A reassembled protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub stream: StreamId,
    pub path: StreamPath,
    /// Layer kind of the stream the PDU was framed on.
    pub kind: &'static str,
    pub start_offset: u64,
    pub bytes: Bytes,
    /// Every frame that supplied bytes or duplicates of bytes of this PDU.
    pub originating_frames: SmallVec<[FrameId; 4]>,
    /// Frame whose processing made the PDU sufficient.
    pub completing_frame: FrameId,
    pub completeness: Completeness,
    /// Some byte of the PDU was later supplied with different content.
    pub conflict: bool,
}

impl Pdu {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.bytes.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }
}

/// Result of polling an open PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduPoll {
    /// The exact request is satisfied; the PDU is closed.
    Ready(Pdu),
    /// Fewer bytes than requested are buffered.
    NeedMore { current_length: usize },
    /// An at-least request is satisfied; peek and satisfy or re-request.
    Available { current_length: usize },
}

/// Origin of a supplied chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// In-order bytes released by the sequence space.
    Delivered,
    /// Bytes beyond a gap, handed over early.
    Provisional,
    /// Already observed bytes; only the frame is of interest.
    Duplicate,
}

#[derive(Debug)]
struct PendingPdu {
    index: u64,
    start: u64,
    request: PduRequest,
    /// Frames of duplicate chunks and the ranges they repeated.
    duplicates: SmallVec<[(FrameId, Range<u64>); 4]>,
    /// Frames already reported as carrying a segment of this PDU.
    announced: SmallVec<[FrameId; 4]>,
}

impl PendingPdu {
    fn extent_end(&self) -> u64 {
        self.start + self.request.len() as u64
    }
}

/// Buffers released bytes of one stream and cuts them into PDUs on request.
#[derive(Debug)]
pub struct Assembler {
    stream: StreamId,
    path: StreamPath,
    kind: &'static str,
    /// Bytes at or beyond the cursor.
    buffer: CoverageMap,
    /// Start of the next PDU.
    cursor: u64,
    /// Bytes at or beyond this offset belong to a byte-stream child.
    limit: Option<u64>,
    pending: Option<PendingPdu>,
    next_index: u64,
    max_pdu_bytes: usize,
    /// Supply order and trigger frame of each buffered piece, by start offset.
    supplied_by: BTreeMap<u64, (u64, FrameId)>,
    supplies: u64,
    conflicts: Vec<Range<u64>>,
    pdus_completed: u64,
}

impl Assembler {
    pub fn new(stream: StreamId, path: StreamPath, kind: &'static str, max_pdu_bytes: usize) -> Self {
        Self {
            stream,
            path,
            kind,
            buffer: CoverageMap::new(),
            cursor: 0,
            limit: None,
            pending: None,
            next_index: 0,
            max_pdu_bytes,
            supplied_by: BTreeMap::new(),
            supplies: 0,
            conflicts: Vec::new(),
            pdus_completed: 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn set_kind(&mut self, kind: &'static str) {
        self.kind = kind;
    }

    /// Start offset of the next PDU.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn pdus_completed(&self) -> u64 {
        self.pdus_completed
    }

    /// Bytes held in the buffer.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.covered_len()
    }

    /// Contiguous bytes buffered from the cursor.
    pub fn accumulated(&self) -> usize {
        (self.buffer.contiguous_end(self.cursor) - self.cursor) as usize
    }

    /// Contiguous bytes from the cursor, for framing.
    pub fn available(&self) -> Bytes {
        let end = self.buffer.contiguous_end(self.cursor);
        self.buffer.bytes(self.cursor, end).unwrap_or_default()
    }

    /// Buffered bytes beyond the first gap after the cursor. Only
    /// out-of-order delivery puts bytes there.
    pub fn provisional(&self) -> Vec<CoveredRange> {
        let end = self.buffer.contiguous_end(self.cursor);
        self.buffer.pieces(end, self.buffer.highest_end())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Offset where buffering stops, once a byte-stream child took over.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Stop buffering at `offset`; later bytes are routed elsewhere.
    pub fn seal(&mut self, offset: u64) {
        self.limit = Some(self.limit.map_or(offset, |l| l.min(offset)));
        let kept = self.buffer.pieces(self.cursor, offset);
        self.buffer.clear();
        for piece in kept {
            self.buffer.insert(piece);
        }
        self.supplied_by.retain(|start, _| *start < offset);
    }

    /// Record that `[start, end)` was later supplied with different content.
    pub fn mark_conflict(&mut self, start: u64, end: u64) {
        if end > self.cursor {
            self.conflicts.push(start.max(self.cursor)..end);
        }
    }

    /// Feed one chunk. `trigger` is the frame being processed.
    pub fn supply(&mut self, chunk: CoveredRange, kind: ChunkKind, trigger: FrameId) {
        if kind == ChunkKind::Duplicate {
            if let Some(pending) = self.pending.as_mut() {
                if chunk.start < pending.extent_end() && chunk.end() > pending.start {
                    pending.duplicates.push((chunk.frame, chunk.start..chunk.end()));
                }
            }
            return;
        }

        let end = match self.limit {
            Some(limit) => chunk.end().min(limit),
            None => chunk.end(),
        };
        if end <= self.cursor {
            trace!(stream = %self.stream, start = chunk.start, "chunk below cursor ignored");
            return;
        }
        self.supplies += 1;
        for piece in self.buffer.insert(chunk.slice(self.cursor, end)) {
            self.supplied_by.insert(piece.start, (self.supplies, trigger));
        }
    }

    /// Open a PDU or re-target the open one.
    pub fn request(&mut self, request: PduRequest) -> Result<PduHandle, ReassemblyError> {
        if request.len() > self.max_pdu_bytes {
            let skipped = request.len() as u64;
            let start = self.pending.as_ref().map_or(self.cursor, |p| p.start);
            debug!(
                stream = %self.stream,
                start,
                requested = request.len(),
                ceiling = self.max_pdu_bytes,
                "PDU request above ceiling, skipping span"
            );
            self.pending = None;
            self.advance_to(start + skipped);
            return Err(ReassemblyError::UnboundedPending {
                stream: self.stream,
                requested: request.len(),
                ceiling: self.max_pdu_bytes,
            });
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.request = request;
            return Ok(PduHandle {
                stream: self.stream,
                index: pending.index,
            });
        }

        let index = self.next_index;
        self.next_index += 1;
        self.pending = Some(PendingPdu {
            index,
            start: self.cursor,
            request,
            duplicates: SmallVec::new(),
            announced: SmallVec::new(),
        });
        Ok(PduHandle {
            stream: self.stream,
            index,
        })
    }

    /// Check whether the open PDU can be handed out.
    pub fn poll(&mut self, handle: PduHandle) -> Result<PduPoll, ReassemblyError> {
        let request = self.pending_for(handle)?.request;
        let current_length = self.accumulated();
        match request {
            PduRequest::Exact(n) if current_length >= n => Ok(PduPoll::Ready(self.close(n))),
            PduRequest::AtLeast(n) if current_length >= n => {
                Ok(PduPoll::Available { current_length })
            }
            _ => Ok(PduPoll::NeedMore { current_length }),
        }
    }

    /// Contiguous bytes of the open PDU so far.
    pub fn peek(&self, handle: PduHandle) -> Result<Bytes, ReassemblyError> {
        self.pending_for(handle)?;
        Ok(self.available())
    }

    /// Close the open PDU at `len` bytes, its self-described boundary.
    pub fn satisfy(&mut self, handle: PduHandle, len: usize) -> Result<PduPoll, ReassemblyError> {
        self.pending_for(handle)?;
        let handle = self.request(PduRequest::Exact(len))?;
        self.poll(handle)
    }

    /// Drop `len` bytes from the cursor without producing a PDU.
    pub fn skip(&mut self, len: usize) {
        self.pending = None;
        self.advance_to(self.cursor + len as u64);
    }

    /// Frames contributing to the open PDU that have not been reported yet.
    pub fn unannounced_frames(&mut self) -> (u64, SmallVec<[FrameId; 4]>) {
        let Some(pending) = self.pending.as_ref() else {
            return (self.cursor, SmallVec::new());
        };
        let start = pending.start;
        let end = self.buffer.contiguous_end(start).min(pending.extent_end().max(start + 1));
        let frames = self.frames_in(start, end);
        let Some(pending) = self.pending.as_mut() else {
            return (start, SmallVec::new());
        };
        let fresh: SmallVec<[FrameId; 4]> = frames
            .into_iter()
            .filter(|f| !pending.announced.contains(f))
            .collect();
        pending.announced.extend(fresh.iter().copied());
        (start, fresh)
    }

    /// Close the stream. An open PDU holding data is returned as incomplete.
    pub fn teardown(&mut self) -> Option<Pdu> {
        let pending = self.pending.take()?;
        let len = self.accumulated();
        if len == 0 {
            return None;
        }
        let bytes_missing = match pending.request {
            PduRequest::Exact(n) => Some(n.saturating_sub(len)),
            PduRequest::AtLeast(_) => None,
        };
        self.pending = Some(pending);
        let mut pdu = self.close(len);
        pdu.completeness = Completeness::Incomplete { bytes_missing };
        self.buffer.clear();
        self.supplied_by.clear();
        Some(pdu)
    }

    fn pending_for(&self, handle: PduHandle) -> Result<&PendingPdu, ReassemblyError> {
        match self.pending.as_ref() {
            Some(pending) if handle.stream == self.stream && pending.index == handle.index => {
                Ok(pending)
            }
            _ => Err(ReassemblyError::StaleHandle {
                stream: handle.stream,
                index: handle.index,
            }),
        }
    }

    fn frames_in(&self, start: u64, end: u64) -> SmallVec<[FrameId; 4]> {
        let mut frames: SmallVec<[FrameId; 4]> = SmallVec::new();
        for piece in self.buffer.pieces(start, end) {
            if !frames.contains(&piece.frame) {
                frames.push(piece.frame);
            }
        }
        if let Some(pending) = self.pending.as_ref() {
            for (frame, range) in &pending.duplicates {
                if range.start < end && range.end > start && !frames.contains(frame) {
                    frames.push(*frame);
                }
            }
        }
        frames
    }

    /// Frame whose supply was the last one needed to fill `[start, end)`.
    fn completing_frame(&self, start: u64, end: u64) -> Option<FrameId> {
        let from = self
            .supplied_by
            .range(..=start)
            .next_back()
            .map_or(start, |(offset, _)| *offset);
        self.supplied_by
            .range(from..end)
            .map(|(_, supplied)| *supplied)
            .max_by_key(|(order, _)| *order)
            .map(|(_, frame)| frame)
    }

    fn close(&mut self, len: usize) -> Pdu {
        let start = self.pending.as_ref().map_or(self.cursor, |p| p.start);
        let end = start + len as u64;
        let bytes = self.buffer.bytes(start, end).unwrap_or_default();
        let originating_frames = self.frames_in(start, end);
        let completing_frame = self
            .completing_frame(start, end)
            .or_else(|| originating_frames.last().copied())
            .unwrap_or_default();
        let conflict = self.conflicts.iter().any(|c| c.start < end && c.end > start);

        self.pending = None;
        self.pdus_completed += 1;
        self.advance_to(end);

        trace!(
            stream = %self.stream,
            start,
            len,
            frames = originating_frames.len(),
            completing_frame,
            "PDU closed"
        );

        Pdu {
            stream: self.stream,
            path: self.path.clone(),
            kind: self.kind,
            start_offset: start,
            bytes,
            originating_frames,
            completing_frame,
            completeness: Completeness::Complete,
            conflict,
        }
    }

    fn advance_to(&mut self, offset: u64) {
        self.cursor = offset.max(self.cursor);
        self.buffer.discard_below(self.cursor);
        self.conflicts.retain(|c| c.end > offset);

        let straddling = self.supplied_by.range(..=self.cursor).next_back().map(|(_, s)| *s);
        self.supplied_by = self.supplied_by.split_off(&self.cursor);
        if let (Some(supplied), Some(_)) = (straddling, self.buffer.get(self.cursor)) {
            self.supplied_by.entry(self.cursor).or_insert(supplied);
        }
    }
}
