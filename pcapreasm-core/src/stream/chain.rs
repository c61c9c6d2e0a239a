use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{Error, ReassemblyError, Result};

use super::{
    AnnotationEvent, AnnotationLog, Assembler, ChunkKind, Classification, Completeness,
    CoveredRange, Direction, FrameId, Framing, LayerContext, LayerParser, LayerRegistry,
    OverlapConflict, Pass, Pdu, PduAction, PduHandle, PduPoll, PduRecord, PduRequest, Segment,
    SequenceSpace, StreamId, StreamKey, StreamPath, StreamStats,
};

/// Kind of a root stream no registered layer claimed.
pub const RAW_KIND: &str = "raw";

/// Configuration for the LayerChain.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Hand bytes beyond a gap to assemblers before the gap closes.
    pub out_of_order_delivery: bool,
    /// Largest PDU a consumer may request (bytes).
    pub max_pdu_bytes: usize,
    /// Maximum total memory for all streams.
    pub max_total_memory: usize,
    /// Consumed bytes kept per stream to compare retransmitted content against.
    pub conflict_window: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            out_of_order_delivery: false,
            max_pdu_bytes: 16 * 1024 * 1024,      // 16 MB per PDU
            max_total_memory: 1024 * 1024 * 1024, // 1 GB total
            conflict_window: 64 * 1024,
        }
    }
}

impl ReassemblyConfig {
    pub fn with_out_of_order_delivery(mut self, enabled: bool) -> Self {
        self.out_of_order_delivery = enabled;
        self
    }

    pub fn with_max_pdu_bytes(mut self, bytes: usize) -> Self {
        self.max_pdu_bytes = bytes;
        self
    }

    pub fn with_max_total_memory(mut self, bytes: usize) -> Self {
        self.max_total_memory = bytes;
        self
    }

    pub fn with_conflict_window(mut self, bytes: usize) -> Self {
        self.conflict_window = bytes;
        self
    }
}

/// How a child stream receives its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingFeed {
    /// The parent's delivered bytes from the attach offset on.
    ByteStream,
    /// Ranges of the parent's PDUs, appended in completion order.
    Pdus,
    /// Transformed bytes injected by the parent's parser or the caller.
    Synthetic,
}

/// Maps a run of child offsets back to the parent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub child_start: u64,
    pub parent_start: u64,
    pub len: u64,
}

/// Link from a child stream to its parent.
#[derive(Debug, Clone)]
pub struct LayerBinding {
    pub parent: StreamId,
    /// Child offset 0 corresponds to this parent offset.
    pub attach_offset: u64,
    pub feed: BindingFeed,
    pub spans: Vec<Span>,
}

impl LayerBinding {
    /// Parent offset of a child offset; `None` for synthetic bytes.
    pub fn parent_offset(&self, child_offset: u64) -> Option<u64> {
        match self.feed {
            BindingFeed::ByteStream => Some(self.attach_offset + child_offset),
            BindingFeed::Pdus => self
                .spans
                .iter()
                .find(|s| child_offset >= s.child_start && child_offset < s.child_start + s.len)
                .map(|s| s.parent_start + (child_offset - s.child_start)),
            BindingFeed::Synthetic => None,
        }
    }
}

/// What one feed produced.
#[derive(Debug, Clone, Default)]
pub struct FeedOutcome {
    /// Classification of the fed segment; `None` if it was not observed.
    pub classification: Option<Classification>,
    /// PDUs delivered to the caller by terminal layers or teardown.
    pub pdus: Vec<Pdu>,
    pub errors: Vec<ReassemblyError>,
}

impl FeedOutcome {
    pub fn absorb(&mut self, other: FeedOutcome) {
        self.pdus.extend(other.pdus);
        self.errors.extend(other.errors);
    }
}

/// Per-stream classification history in observation order.
///
/// Built during the first pass; the second pass must reproduce it exactly.
#[derive(Debug, Clone, Default)]
pub struct ClassificationIndex {
    by_path: HashMap<StreamPath, Vec<(FrameId, Classification)>>,
}

impl ClassificationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, path: &StreamPath, frame: FrameId, classification: Classification) -> usize {
        let seen = self.by_path.entry(path.clone()).or_default();
        seen.push((frame, classification));
        seen.len() - 1
    }

    /// History of one stream.
    pub fn get(&self, path: &StreamPath) -> &[(FrameId, Classification)] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Classifications of `frame` on `path`, in observation order.
    pub fn classifications(&self, frame: FrameId, path: &StreamPath) -> Vec<Classification> {
        self.get(path)
            .iter()
            .filter(|(f, _)| *f == frame)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn paths(&self) -> impl Iterator<Item = &StreamPath> {
        self.by_path.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

struct StreamNode {
    id: StreamId,
    path: StreamPath,
    direction: Direction,
    space: SequenceSpace,
    assembler: Assembler,
    parser: Option<Box<dyn LayerParser>>,
    binding: Option<LayerBinding>,
    /// Byte-stream children and their attach offsets.
    byte_children: Vec<(StreamId, u64)>,
    children: Vec<StreamId>,
    /// Append offset for PDU-fed and synthetic input.
    next_offset: u64,
    fin_offset: Option<u64>,
    last_frame: FrameId,
}

impl StreamNode {
    fn context(&self, frame: FrameId, pass: Pass) -> LayerContext {
        LayerContext {
            stream: self.id,
            path: self.path.clone(),
            direction: self.direction,
            frame,
            pass,
            bytes_parsed: self.assembler.cursor(),
            pdus_parsed: self.assembler.pdus_completed(),
        }
    }

    fn memory(&self) -> u64 {
        self.space.coverage().covered_len() + self.assembler.buffered_bytes()
    }
}

struct QueuedSegment {
    node: StreamId,
    offset: u64,
    payload: Bytes,
    frame: FrameId,
    capture_index: u64,
    conflict: bool,
}

enum Step {
    Completed { pdu: Pdu, actions: Vec<PduAction> },
    Failed(ReassemblyError),
    Upgrade {
        pdu: Option<Pdu>,
        kind: &'static str,
        at: u64,
    },
    ParseError { message: String, stop: bool },
}

/// Ownership tree of streams and the layers stacked on them.
///
/// Root streams are created on the first segment for a [`StreamKey`]; child
/// streams are created lazily the first time a parser forwards to, injects
/// into or upgrades to a `(kind, channel)` under a parent. All work flows
/// through a queue, so nesting depth is unbounded.
pub struct LayerChain {
    registry: Arc<LayerRegistry>,
    config: ReassemblyConfig,
    pass: Pass,
    nodes: BTreeMap<StreamId, StreamNode>,
    roots: HashMap<StreamKey, StreamId>,
    children: HashMap<(StreamId, &'static str, u64), StreamId>,
    path_ids: HashMap<StreamPath, StreamId>,
    closed: HashSet<StreamKey>,
    poisoned: HashSet<StreamPath>,
    next_id: u64,
    log: AnnotationLog,
    observed: ClassificationIndex,
    expected: Option<Arc<ClassificationIndex>>,
    touched: BTreeSet<StreamId>,
    /// Frame being processed.
    trigger: FrameId,
    capture_index: u64,
}

impl LayerChain {
    pub fn new(registry: Arc<LayerRegistry>, config: ReassemblyConfig) -> Self {
        Self::for_pass(registry, config, Pass::Single)
    }

    pub fn for_pass(registry: Arc<LayerRegistry>, config: ReassemblyConfig, pass: Pass) -> Self {
        Self {
            registry,
            config,
            pass,
            nodes: BTreeMap::new(),
            roots: HashMap::new(),
            children: HashMap::new(),
            path_ids: HashMap::new(),
            closed: HashSet::new(),
            poisoned: HashSet::new(),
            next_id: 1,
            log: AnnotationLog::new(),
            observed: ClassificationIndex::new(),
            expected: None,
            touched: BTreeSet::new(),
            trigger: 0,
            capture_index: 0,
        }
    }

    /// Verify every classification against a previous pass.
    pub fn with_expected(mut self, expected: Arc<ClassificationIndex>) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn pass(&self) -> Pass {
        self.pass
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn log(&self) -> &AnnotationLog {
        &self.log
    }

    /// Classifications observed so far, per stream.
    pub fn classification_index(&self) -> &ClassificationIndex {
        &self.observed
    }

    pub fn into_parts(self) -> (AnnotationLog, ClassificationIndex) {
        (self.log, self.observed)
    }

    /// Feed one captured segment of a root stream.
    pub fn feed(
        &mut self,
        key: StreamKey,
        offset: u64,
        payload: Bytes,
        frame: FrameId,
        capture_index: u64,
    ) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        self.trigger = frame;
        self.capture_index = capture_index;

        if self.closed.contains(&key) || self.poisoned.contains(&StreamPath::root(key)) {
            trace!(key = %key, frame, "segment for closed stream ignored");
            return outcome;
        }
        if payload.is_empty() {
            return outcome;
        }

        let id = self.root_for(key);
        if offset.checked_add(payload.len() as u64).is_none() {
            let error = ReassemblyError::OffsetOverflow {
                stream: id,
                offset,
                len: payload.len(),
            };
            self.report(id, error, &mut outcome);
            return outcome;
        }
        let mut queue = VecDeque::new();
        outcome.classification = self.process_segment(
            QueuedSegment {
                node: id,
                offset,
                payload,
                frame,
                capture_index,
                conflict: false,
            },
            &mut queue,
            &mut outcome,
        );
        self.drain(&mut queue, &mut outcome);
        self.check_fin(id, &mut outcome);
        self.announce();
        outcome
    }

    /// The root stream `key` ends at `end_offset`. It is closed once every
    /// byte before that offset has been delivered, or at end of capture.
    pub fn fin(&mut self, key: StreamKey, end_offset: u64, frame: FrameId) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        self.trigger = frame;
        let Some(id) = self.roots.get(&key).copied() else {
            return outcome;
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.fin_offset = Some(node.fin_offset.map_or(end_offset, |f| f.max(end_offset)));
            node.last_frame = frame;
        }
        self.check_fin(id, &mut outcome);
        outcome
    }

    /// The root stream `key` is aborted; close it now.
    pub fn reset(&mut self, key: StreamKey, frame: FrameId) -> FeedOutcome {
        self.trigger = frame;
        self.closed.insert(key);
        match self.roots.get(&key).copied() {
            Some(id) => self.close_subtree(id),
            None => FeedOutcome::default(),
        }
    }

    /// A new connection starts on `key`, e.g. a SYN with a fresh initial
    /// sequence number after FIN or RST. A stream still open under the key
    /// is closed first; segments after this start a new root stream.
    pub fn reopen(&mut self, key: StreamKey, frame: FrameId) -> FeedOutcome {
        self.trigger = frame;
        let outcome = match self.roots.get(&key).copied() {
            Some(id) => self.close_subtree(id),
            None => FeedOutcome::default(),
        };
        if self.closed.remove(&key) {
            debug!(key = %key, frame, "stream reopened");
        }
        outcome
    }

    /// Close a stream and all its descendants.
    pub fn close(&mut self, stream: StreamId) -> Result<FeedOutcome> {
        if !self.nodes.contains_key(&stream) {
            return Err(ReassemblyError::UnknownStream { stream }.into());
        }
        Ok(self.close_subtree(stream))
    }

    /// Close every stream (end of capture).
    pub fn close_all(&mut self) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        let mut roots: Vec<StreamId> = self.roots.values().copied().collect();
        roots.sort();
        for id in roots {
            outcome.absorb(self.close_subtree(id));
        }
        // Streams whose parent went away without them
        let rest: Vec<StreamId> = self.nodes.keys().copied().collect();
        for id in rest {
            if self.nodes.contains_key(&id) {
                outcome.absorb(self.close_subtree(id));
            }
        }
        outcome
    }

    /// Bind a new child of `kind` to the parent's delivered bytes from
    /// `start_offset` on. Bytes already delivered past that offset are
    /// replayed to the child.
    pub fn attach(
        &mut self,
        parent: StreamId,
        start_offset: u64,
        kind: &str,
    ) -> Result<(StreamId, FeedOutcome)> {
        let kind = self.registered_kind(kind)?;
        let mut queue = VecDeque::new();
        let mut outcome = FeedOutcome::default();
        let child = self.bind_byte_stream(parent, start_offset, kind, &mut queue)?;
        self.drain(&mut queue, &mut outcome);
        self.announce();
        Ok((child, outcome))
    }

    /// Create (or look up) a child of `kind` fed only through [`inject`](Self::inject).
    pub fn attach_synthetic(&mut self, parent: StreamId, kind: &str, channel: u64) -> Result<StreamId> {
        let kind = self.registered_kind(kind)?;
        self.child_for(parent, kind, channel, BindingFeed::Synthetic)
            .ok_or_else(|| ReassemblyError::UnknownStream { stream: parent }.into())
    }

    /// Append transformed bytes to a child stream.
    pub fn inject(&mut self, child: StreamId, data: Bytes, frame: FrameId) -> Result<FeedOutcome> {
        self.trigger = frame;
        let mut outcome = FeedOutcome::default();
        let Some(node) = self.nodes.get_mut(&child) else {
            return Err(ReassemblyError::UnknownStream { stream: child }.into());
        };
        if data.is_empty() {
            return Ok(outcome);
        }
        let offset = node.next_offset;
        let Some(next_offset) = offset.checked_add(data.len() as u64) else {
            let error = ReassemblyError::OffsetOverflow {
                stream: child,
                offset,
                len: data.len(),
            };
            self.report(child, error, &mut outcome);
            return Ok(outcome);
        };
        node.next_offset = next_offset;

        let mut queue = VecDeque::new();
        outcome.classification = self.process_segment(
            QueuedSegment {
                node: child,
                offset,
                payload: data,
                frame,
                capture_index: self.capture_index,
                conflict: false,
            },
            &mut queue,
            &mut outcome,
        );
        self.drain(&mut queue, &mut outcome);
        self.announce();
        Ok(outcome)
    }

    /// Open (or re-target) a PDU on a stream without a parser.
    pub fn request(&mut self, stream: StreamId, request: PduRequest) -> Result<PduHandle> {
        let node = self.node_mut(stream)?;
        let handle = node.assembler.request(request);
        self.compact(stream);
        Ok(handle?)
    }

    pub fn poll(&mut self, handle: PduHandle) -> Result<PduPoll> {
        let node = self.node_mut(handle.stream)?;
        let poll = node.assembler.poll(handle)?;
        if let PduPoll::Ready(pdu) = &poll {
            self.annotate_completion(pdu);
            self.compact(handle.stream);
        }
        Ok(poll)
    }

    pub fn peek(&self, handle: PduHandle) -> Result<Bytes> {
        let node = self
            .nodes
            .get(&handle.stream)
            .ok_or(ReassemblyError::UnknownStream {
                stream: handle.stream,
            })?;
        Ok(node.assembler.peek(handle)?)
    }

    pub fn satisfy(&mut self, handle: PduHandle, len: usize) -> Result<PduPoll> {
        let node = self.node_mut(handle.stream)?;
        let poll = node.assembler.satisfy(handle, len)?;
        if let PduPoll::Ready(pdu) = &poll {
            self.annotate_completion(pdu);
            self.compact(handle.stream);
        }
        Ok(poll)
    }

    /// Bytes of `stream` buffered beyond a gap. Empty unless out-of-order
    /// delivery is enabled; they are not framed before the gap closes.
    pub fn peek_provisional(&self, stream: StreamId) -> Result<Vec<CoveredRange>> {
        let node = self
            .nodes
            .get(&stream)
            .ok_or(ReassemblyError::UnknownStream { stream })?;
        Ok(node.assembler.provisional())
    }

    /// Every content conflict seen on `stream`, with the rejected bytes.
    pub fn conflicts(&self, stream: StreamId) -> &[OverlapConflict] {
        self.nodes
            .get(&stream)
            .map(|n| n.space.conflicts())
            .unwrap_or(&[])
    }

    /// Root stream of `key`, if live.
    pub fn stream(&self, key: &StreamKey) -> Option<StreamId> {
        self.roots.get(key).copied()
    }

    pub fn path(&self, stream: StreamId) -> Option<&StreamPath> {
        self.nodes.get(&stream).map(|n| &n.path)
    }

    pub fn kind(&self, stream: StreamId) -> Option<&'static str> {
        self.nodes.get(&stream).map(|n| n.assembler.kind())
    }

    pub fn children(&self, stream: StreamId) -> Vec<StreamId> {
        self.nodes
            .get(&stream)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn binding(&self, stream: StreamId) -> Option<&LayerBinding> {
        self.nodes.get(&stream).and_then(|n| n.binding.as_ref())
    }

    /// Translate a child offset to its parent stream and offset.
    pub fn parent_offset(&self, stream: StreamId, offset: u64) -> Option<(StreamId, u64)> {
        let binding = self.binding(stream)?;
        binding
            .parent_offset(offset)
            .map(|parent_offset| (binding.parent, parent_offset))
    }

    pub fn stats(&self, stream: StreamId) -> Option<StreamStats> {
        self.nodes.get(&stream).map(|n| n.space.stats())
    }

    pub fn stream_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_poisoned(&self, path: &StreamPath) -> bool {
        self.poisoned.contains(path)
    }

    /// Get total memory usage.
    pub fn total_memory(&self) -> usize {
        self.nodes.values().map(|n| n.memory() as usize).sum()
    }

    /// Check if memory limit is exceeded.
    pub fn memory_limit_exceeded(&self) -> bool {
        self.total_memory() > self.config.max_total_memory
    }

    /// Report every expected classification the current pass never reproduced.
    pub fn unmatched_expectations(&self) -> Vec<ReassemblyError> {
        let Some(expected) = self.expected.as_ref() else {
            return Vec::new();
        };
        let mut paths: Vec<&StreamPath> = expected.paths().collect();
        paths.sort();

        let mut errors = Vec::new();
        for path in paths {
            if self.poisoned.contains(path) {
                continue;
            }
            let seen = self.observed.get(path).len();
            let Some((frame, classification)) = expected.get(path).get(seen) else {
                continue;
            };
            let stream = self
                .path_ids
                .get(path)
                .or_else(|| self.path_ids.get(&StreamPath::root(path.root)));
            if let Some(stream) = stream {
                errors.push(ReassemblyError::OrderingViolation {
                    stream: *stream,
                    frame: *frame,
                    expected: Some(*classification),
                    observed: None,
                });
            }
        }
        errors
    }

    fn registered_kind(&self, kind: &str) -> Result<&'static str> {
        self.registry
            .get_factory(kind)
            .map(|f| f.kind())
            .ok_or_else(|| Error::UnknownLayer {
                kind: kind.to_string(),
            })
    }

    fn node_mut(&mut self, stream: StreamId) -> std::result::Result<&mut StreamNode, ReassemblyError> {
        self.nodes
            .get_mut(&stream)
            .ok_or(ReassemblyError::UnknownStream { stream })
    }

    fn root_for(&mut self, key: StreamKey) -> StreamId {
        if let Some(id) = self.roots.get(&key) {
            return *id;
        }
        let id = self.create_node(StreamPath::root(key), key.direction, None, None);
        self.roots.insert(key, id);
        id
    }

    fn create_node(
        &mut self,
        path: StreamPath,
        direction: Direction,
        binding: Option<LayerBinding>,
        kind: Option<&'static str>,
    ) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;

        let context = LayerContext {
            stream: id,
            path: path.clone(),
            direction,
            frame: self.trigger,
            pass: self.pass,
            bytes_parsed: 0,
            pdus_parsed: 0,
        };
        let registry = Arc::clone(&self.registry);
        let factory = match kind {
            Some(kind) => registry.get_factory(kind),
            None => registry.find_factory(&context),
        };
        if factory.is_none() {
            if let Some(kind) = kind {
                warn!(stream = %id, kind, "no layer registered, stream left unparsed");
            }
        }
        let node_kind = factory.map(|f| f.kind()).or(kind).unwrap_or(RAW_KIND);
        let parser = factory.map(|f| f.create(&context));

        debug!(stream = %id, path = %path, kind = node_kind, "new stream");

        self.path_ids.insert(path.clone(), id);
        self.nodes.insert(
            id,
            StreamNode {
                id,
                space: SequenceSpace::new(id, self.config.out_of_order_delivery),
                assembler: Assembler::new(id, path.clone(), node_kind, self.config.max_pdu_bytes),
                path,
                direction,
                parser,
                binding,
                byte_children: Vec::new(),
                children: Vec::new(),
                next_offset: 0,
                fin_offset: None,
                last_frame: self.trigger,
            },
        );
        id
    }

    fn child_for(
        &mut self,
        parent: StreamId,
        kind: &'static str,
        channel: u64,
        feed: BindingFeed,
    ) -> Option<StreamId> {
        if let Some(id) = self.children.get(&(parent, kind, channel)) {
            return Some(*id);
        }
        let parent_node = self.nodes.get(&parent)?;
        let path = parent_node.path.child(kind, channel);
        if self.poisoned.contains(&path) {
            return None;
        }
        let direction = parent_node.direction;
        let binding = LayerBinding {
            parent,
            attach_offset: 0,
            feed,
            spans: Vec::new(),
        };
        let child = self.create_node(path, direction, Some(binding), Some(kind));
        self.children.insert((parent, kind, channel), child);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(child);
        }
        Some(child)
    }

    fn bind_byte_stream(
        &mut self,
        parent: StreamId,
        at: u64,
        kind: &'static str,
        queue: &mut VecDeque<QueuedSegment>,
    ) -> std::result::Result<StreamId, ReassemblyError> {
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(ReassemblyError::UnknownStream { stream: parent })?;
        // Replay needs the parent's payload from `at` on
        let cursor = parent_node
            .assembler
            .cursor()
            .max(parent_node.space.retained_from());
        if at < cursor {
            return Err(ReassemblyError::AttachBelowCursor {
                stream: parent,
                offset: at,
                cursor,
            });
        }

        let mut channel = 0;
        while self.children.contains_key(&(parent, kind, channel)) {
            channel += 1;
        }
        let path = parent_node.path.child(kind, channel);
        if self.poisoned.contains(&path) {
            return Err(ReassemblyError::UnknownStream { stream: parent });
        }
        let direction = parent_node.direction;
        let binding = LayerBinding {
            parent,
            attach_offset: at,
            feed: BindingFeed::ByteStream,
            spans: Vec::new(),
        };
        let child = self.create_node(path, direction, Some(binding), Some(kind));
        self.children.insert((parent, kind, channel), child);

        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return Ok(child);
        };
        parent_node.children.push(child);
        parent_node.byte_children.push((child, at));
        parent_node.assembler.seal(at);

        let end = parent_node.space.contiguous_end();
        if end > at {
            for piece in parent_node.space.coverage().pieces(at, end) {
                queue.push_back(QueuedSegment {
                    node: child,
                    offset: piece.start - at,
                    payload: piece.data,
                    frame: piece.frame,
                    capture_index: piece.capture_index,
                    conflict: false,
                });
            }
        }
        debug!(parent = %parent, child = %child, offset = at, kind, "byte stream attached");
        Ok(child)
    }

    fn drain(&mut self, queue: &mut VecDeque<QueuedSegment>, outcome: &mut FeedOutcome) {
        while let Some(segment) = queue.pop_front() {
            self.process_segment(segment, queue, outcome);
        }
    }

    fn process_segment(
        &mut self,
        queued: QueuedSegment,
        queue: &mut VecDeque<QueuedSegment>,
        outcome: &mut FeedOutcome,
    ) -> Option<Classification> {
        let id = queued.node;
        let trigger = self.trigger;
        let node = self.nodes.get_mut(&id)?;
        node.last_frame = trigger;
        let segment = Segment {
            stream: id,
            offset: queued.offset,
            payload: queued.payload,
            frame: queued.frame,
            capture_index: queued.capture_index,
        };
        let observation = node.space.observe(&segment)?;
        if queued.conflict {
            node.assembler.mark_conflict(segment.offset, segment.end());
        }
        let path = node.path.clone();
        let classification = observation.classification;
        self.touched.insert(id);

        self.log.record(
            segment.frame,
            AnnotationEvent::Classified {
                path: path.clone(),
                classification,
            },
        );
        if let Some(violation) = self.verify(id, &path, segment.frame, classification) {
            warn!(stream = %id, path = %path, error = %violation, "ordering violation, poisoning stream");
            self.log.record(
                segment.frame,
                AnnotationEvent::Error {
                    path: path.clone(),
                    error: violation.clone(),
                },
            );
            outcome.errors.push(violation);
            self.poison(id);
            return Some(classification);
        }

        for conflict in &observation.conflicts {
            let error = ReassemblyError::OverlapMismatch {
                stream: id,
                start: conflict.start,
                end: conflict.end,
                original_frame: conflict.original_frame,
                conflicting_frame: conflict.conflicting_frame,
                conflicting_data: conflict.conflicting_data.clone(),
            };
            warn!(stream = %id, error = %error, "overlapping segment with different content");
            self.log.record(
                conflict.conflicting_frame,
                AnnotationEvent::Conflict {
                    path: path.clone(),
                    start: conflict.start,
                    end: conflict.end,
                    original_frame: conflict.original_frame,
                },
            );
            outcome.errors.push(error);
        }

        let node = self.nodes.get_mut(&id)?;
        for conflict in &observation.conflicts {
            node.assembler.mark_conflict(conflict.start, conflict.end);
        }
        let chunks = observation
            .duplicates
            .into_iter()
            .map(|c| (c, ChunkKind::Duplicate))
            .chain(observation.released.into_iter().map(|c| (c, ChunkKind::Delivered)))
            .chain(
                observation
                    .provisional
                    .into_iter()
                    .map(|c| (c, ChunkKind::Provisional)),
            );
        for (chunk, kind) in chunks {
            if kind != ChunkKind::Provisional {
                for (child, at) in &node.byte_children {
                    if chunk.end() > *at {
                        let part = chunk.slice(*at, chunk.end());
                        queue.push_back(QueuedSegment {
                            node: *child,
                            offset: part.start - at,
                            payload: part.data,
                            frame: part.frame,
                            capture_index: part.capture_index,
                            conflict: false,
                        });
                    }
                }
            }
            node.assembler.supply(chunk, kind, trigger);
        }

        self.drive(id, queue, outcome);
        self.compact(id);
        Some(classification)
    }

    /// Release sequence-space payload the stream no longer needs: bytes its
    /// assembler consumed, less the conflict window. With a byte-stream child
    /// bound at the assembler's limit, nothing past the limit is framed here.
    fn compact(&mut self, id: StreamId) {
        let window = self.config.conflict_window as u64;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let cursor = node.assembler.cursor();
        let consumed = match node.assembler.limit() {
            Some(limit) if cursor >= limit => node.space.contiguous_end(),
            _ => cursor,
        };
        node.space.release_below(consumed.saturating_sub(window));
    }

    fn verify(
        &mut self,
        id: StreamId,
        path: &StreamPath,
        frame: FrameId,
        classification: Classification,
    ) -> Option<ReassemblyError> {
        let position = self.observed.push(path, frame, classification);
        let expected = self.expected.as_ref()?.get(path).get(position).copied();
        if expected == Some((frame, classification)) {
            return None;
        }
        Some(ReassemblyError::OrderingViolation {
            stream: id,
            frame,
            expected: expected.filter(|(f, _)| *f == frame).map(|(_, c)| c),
            observed: Some(classification),
        })
    }

    /// Run the stream's parser over its buffered bytes until it waits.
    fn drive(
        &mut self,
        id: StreamId,
        queue: &mut VecDeque<QueuedSegment>,
        outcome: &mut FeedOutcome,
    ) {
        loop {
            let step = {
                let Some(node) = self.nodes.get_mut(&id) else {
                    return;
                };
                let data = node.assembler.available();
                if data.is_empty() {
                    return;
                }
                let context = node.context(self.trigger, self.pass);
                let Some(parser) = node.parser.as_mut() else {
                    return;
                };

                match parser.frame(&data, &context) {
                    Framing::Pdu { len: 0 } => {
                        node.parser = None;
                        Step::ParseError {
                            message: "parser framed a zero-length PDU".to_string(),
                            stop: true,
                        }
                    }
                    Framing::Pdu { len } => {
                        let polled = node
                            .assembler
                            .request(PduRequest::Exact(len))
                            .and_then(|handle| node.assembler.poll(handle));
                        match polled {
                            Ok(PduPoll::Ready(pdu)) => {
                                let actions = parser.on_pdu(&pdu, &context);
                                Step::Completed { pdu, actions }
                            }
                            Ok(_) => return,
                            Err(error) => Step::Failed(error),
                        }
                    }
                    Framing::NeedMore { minimum_bytes } => {
                        let want = minimum_bytes.unwrap_or(0).max(data.len() + 1);
                        match node.assembler.request(PduRequest::AtLeast(want)) {
                            Ok(_) => return,
                            Err(error) => Step::Failed(error),
                        }
                    }
                    Framing::Upgrade { kind, consumed } => {
                        let pdu = if consumed == 0 {
                            None
                        } else {
                            let polled = node
                                .assembler
                                .request(PduRequest::Exact(consumed))
                                .and_then(|handle| node.assembler.poll(handle));
                            match polled {
                                Ok(PduPoll::Ready(pdu)) => Some(pdu),
                                Ok(_) => return,
                                Err(error) => {
                                    warn!(stream = %id, error = %error, "upgrade message too large");
                                    None
                                }
                            }
                        };
                        node.parser = None;
                        Step::Upgrade {
                            pdu,
                            kind,
                            at: node.assembler.cursor(),
                        }
                    }
                    Framing::NotThisProtocol => {
                        debug!(stream = %id, kind = node.assembler.kind(), "not this protocol, parsing stopped");
                        node.parser = None;
                        return;
                    }
                    Framing::Error {
                        message,
                        skip_bytes,
                    } => match skip_bytes {
                        Some(skip) if skip > 0 => {
                            node.assembler.skip(skip);
                            Step::ParseError {
                                message,
                                stop: false,
                            }
                        }
                        _ => {
                            node.parser = None;
                            Step::ParseError {
                                message,
                                stop: true,
                            }
                        }
                    },
                }
            };

            match step {
                Step::Completed { pdu, actions } => self.complete(id, pdu, actions, queue, outcome),
                Step::Failed(error) => self.report(id, error, outcome),
                Step::Upgrade { pdu, kind, at } => {
                    if let Some(pdu) = pdu {
                        self.complete(id, pdu, vec![PduAction::Deliver], queue, outcome);
                    }
                    if let Err(error) = self.bind_byte_stream(id, at, kind, queue) {
                        self.report(id, error, outcome);
                    }
                    return;
                }
                Step::ParseError { message, stop } => {
                    if let Some(node) = self.nodes.get(&id) {
                        warn!(stream = %id, kind = node.assembler.kind(), %message, "parse error");
                        self.log.record(
                            self.trigger,
                            AnnotationEvent::ParseError {
                                path: node.path.clone(),
                                message,
                            },
                        );
                    }
                    if stop {
                        return;
                    }
                }
            }
        }
    }

    fn complete(
        &mut self,
        id: StreamId,
        pdu: Pdu,
        actions: Vec<PduAction>,
        queue: &mut VecDeque<QueuedSegment>,
        outcome: &mut FeedOutcome,
    ) {
        self.annotate_completion(&pdu);

        for action in actions {
            match action {
                PduAction::Deliver => outcome.pdus.push(pdu.clone()),
                PduAction::Discard => {}
                PduAction::Forward {
                    kind,
                    channel,
                    range,
                } => {
                    let end = range.end.min(pdu.len());
                    let start = range.start.min(end);
                    let data = pdu.bytes.slice(start..end);
                    let parent_start = pdu.start_offset + start as u64;
                    self.enqueue_child(
                        id,
                        kind,
                        channel,
                        BindingFeed::Pdus,
                        data,
                        Some(parent_start),
                        &pdu,
                        queue,
                    );
                }
                PduAction::Inject {
                    kind,
                    channel,
                    data,
                } => {
                    self.enqueue_child(id, kind, channel, BindingFeed::Synthetic, data, None, &pdu, queue);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_child(
        &mut self,
        parent: StreamId,
        kind: &'static str,
        channel: u64,
        feed: BindingFeed,
        data: Bytes,
        parent_start: Option<u64>,
        pdu: &Pdu,
        queue: &mut VecDeque<QueuedSegment>,
    ) {
        if data.is_empty() {
            return;
        }
        let Some(child) = self.child_for(parent, kind, channel, feed) else {
            return;
        };
        let Some(node) = self.nodes.get_mut(&child) else {
            return;
        };
        let offset = node.next_offset;
        let len = data.len() as u64;
        node.next_offset += len;
        if let (Some(parent_start), Some(binding)) = (parent_start, node.binding.as_mut()) {
            binding.spans.push(Span {
                child_start: offset,
                parent_start,
                len,
            });
        }
        queue.push_back(QueuedSegment {
            node: child,
            offset,
            payload: data,
            frame: pdu.completing_frame,
            capture_index: self.capture_index,
            conflict: pdu.conflict,
        });
    }

    fn annotate_completion(&mut self, pdu: &Pdu) {
        debug!(
            stream = %pdu.stream,
            kind = pdu.kind,
            start = pdu.start_offset,
            len = pdu.len(),
            frames = pdu.originating_frames.len(),
            completing_frame = pdu.completing_frame,
            "PDU completed"
        );
        for frame in &pdu.originating_frames {
            if *frame != pdu.completing_frame {
                self.log.record(
                    *frame,
                    AnnotationEvent::ReassembledIn {
                        path: pdu.path.clone(),
                        pdu_start: pdu.start_offset,
                        completing_frame: pdu.completing_frame,
                    },
                );
            }
        }
        self.log.record(
            pdu.completing_frame,
            AnnotationEvent::PduCompleted {
                path: pdu.path.clone(),
                record: PduRecord {
                    start_offset: pdu.start_offset,
                    length: pdu.len(),
                    originating_frames: pdu.originating_frames.clone(),
                    bytes_missing: None,
                },
            },
        );
    }

    fn report(&mut self, id: StreamId, error: ReassemblyError, outcome: &mut FeedOutcome) {
        warn!(stream = %id, error = %error, "reassembly error");
        if let Some(node) = self.nodes.get(&id) {
            self.log.record(
                self.trigger,
                AnnotationEvent::Error {
                    path: node.path.clone(),
                    error: error.clone(),
                },
            );
        }
        outcome.errors.push(error);
    }

    /// Record frames that joined a still-open PDU during this operation.
    fn announce(&mut self) {
        let touched = std::mem::take(&mut self.touched);
        for id in touched {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let (pdu_start, frames) = node.assembler.unannounced_frames();
            for frame in frames {
                self.log.record(
                    frame,
                    AnnotationEvent::SegmentOfPdu {
                        path: node.path.clone(),
                        pdu_start,
                    },
                );
            }
        }
    }

    fn check_fin(&mut self, id: StreamId, outcome: &mut FeedOutcome) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let done = node
            .fin_offset
            .map_or(false, |fin| node.space.contiguous_end() >= fin);
        if done {
            self.closed.insert(node.path.root);
            outcome.absorb(self.close_subtree(id));
        }
    }

    fn poison(&mut self, id: StreamId) {
        let removed = self.remove_subtree(id);
        if let Some(node) = removed.first() {
            self.poisoned.insert(node.path.clone());
        }
    }

    /// Detach a stream and its descendants, parents first.
    fn remove_subtree(&mut self, id: StreamId) -> Vec<StreamNode> {
        let mut removed = Vec::new();
        let mut pending = VecDeque::from([id]);
        while let Some(current) = pending.pop_front() {
            if let Some(node) = self.nodes.remove(&current) {
                pending.extend(node.children.iter().copied());
                removed.push(node);
            }
        }

        for node in &removed {
            self.touched.remove(&node.id);
            match (&node.binding, node.path.layers.last()) {
                (Some(binding), Some(step)) => {
                    self.children.remove(&(binding.parent, step.kind, step.channel));
                }
                _ => {
                    if self.roots.get(&node.path.root) == Some(&node.id) {
                        self.roots.remove(&node.path.root);
                    }
                }
            }
        }
        if let Some(binding) = removed.first().and_then(|n| n.binding.as_ref()) {
            if let Some(parent) = self.nodes.get_mut(&binding.parent) {
                parent.children.retain(|c| *c != id);
                parent.byte_children.retain(|(c, _)| *c != id);
            }
        }
        removed
    }

    fn close_subtree(&mut self, id: StreamId) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        for mut node in self.remove_subtree(id) {
            for gap in node.space.gaps() {
                let error = ReassemblyError::GapNeverClosed {
                    stream: node.id,
                    start: gap.start,
                    end: gap.end,
                };
                warn!(stream = %node.id, error = %error, "gap never closed");
                self.log.record(
                    node.last_frame,
                    AnnotationEvent::Error {
                        path: node.path.clone(),
                        error: error.clone(),
                    },
                );
                outcome.errors.push(error);
            }

            if let Some(pdu) = node.assembler.teardown() {
                let bytes_missing = match pdu.completeness {
                    Completeness::Incomplete { bytes_missing } => bytes_missing,
                    Completeness::Complete => None,
                };
                debug!(stream = %node.id, start = pdu.start_offset, len = pdu.len(), "incomplete PDU at teardown");
                self.log.record(
                    pdu.completing_frame,
                    AnnotationEvent::PduIncomplete {
                        path: node.path.clone(),
                        record: PduRecord {
                            start_offset: pdu.start_offset,
                            length: pdu.len(),
                            originating_frames: pdu.originating_frames.clone(),
                            bytes_missing,
                        },
                    },
                );
                outcome.pdus.push(pdu);
            }

            let stats = node.space.stats();
            debug!(
                stream = %node.id,
                segments = stats.segment_count,
                retransmissions = stats.retransmit_count,
                out_of_order = stats.out_of_order_count,
                "stream closed"
            );
        }
        outcome
    }
}
