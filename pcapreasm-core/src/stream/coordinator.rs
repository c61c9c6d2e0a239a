use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::ReassemblyError;

use super::{
    AnnotationLog, FrameAnnotation, FrameId, LayerChain, LayerRegistry, Pass, Pdu,
    ReassemblyConfig, StreamKey,
};

/// How a root stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Orderly close after the segment's bytes.
    Fin,
    /// Abort.
    Reset,
}

/// One root-stream segment carried by a captured frame.
#[derive(Debug, Clone)]
pub struct SegmentInput {
    pub key: StreamKey,
    pub offset: u64,
    pub payload: Bytes,
    /// A new connection starts here; any earlier stream under `key` is over.
    pub open: bool,
    pub teardown: Option<Teardown>,
}

impl SegmentInput {
    pub fn new(key: StreamKey, offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            offset,
            payload: payload.into(),
            open: false,
            teardown: None,
        }
    }

    pub fn with_open(mut self) -> Self {
        self.open = true;
        self
    }

    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = Some(teardown);
        self
    }
}

/// A frame as seen by the engine: its number and the segments it carries.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub id: FrameId,
    pub segments: Vec<SegmentInput>,
}

impl CapturedFrame {
    pub fn new(id: FrameId) -> Self {
        Self {
            id,
            segments: Vec::new(),
        }
    }

    pub fn with_segment(mut self, segment: SegmentInput) -> Self {
        self.segments.push(segment);
        self
    }
}

/// Single forward pass or two passes over a complete capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    Single,
    Two,
}

/// What the engine reports for a frame when it is processed.
#[derive(Debug, Clone)]
pub struct FrameEmission {
    pub frame: FrameId,
    pub annotation: FrameAnnotation,
    /// PDUs completed while processing this frame.
    pub pdus: Vec<Pdu>,
}

/// Result of a whole capture run.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub mode: PassMode,
    pub emissions: Vec<FrameEmission>,
    /// Final annotation log of the emitting pass.
    pub annotations: AnnotationLog,
    /// Log of the first pass in two-pass mode.
    pub first_pass: Option<AnnotationLog>,
    /// Every PDU delivered, including incomplete ones from teardown.
    pub pdus: Vec<Pdu>,
    pub errors: Vec<ReassemblyError>,
}

impl CaptureReport {
    /// Final annotation of `frame`.
    pub fn annotation(&self, frame: FrameId) -> FrameAnnotation {
        self.annotations.annotation(frame)
    }

    /// Annotation of `frame` as emitted while processing it.
    pub fn emission(&self, frame: FrameId) -> Option<&FrameEmission> {
        self.emissions.iter().find(|e| e.frame == frame)
    }

    /// Concatenated bytes of the complete PDUs of `kind`, in delivery order.
    pub fn pdu_bytes(&self, kind: &str) -> Vec<u8> {
        self.pdus
            .iter()
            .filter(|p| p.kind == kind && p.is_complete())
            .flat_map(|p| p.bytes.iter().copied())
            .collect()
    }
}

/// Drives a [`LayerChain`] over a capture, frame by frame.
pub struct PassCoordinator {
    chain: LayerChain,
    /// First-pass log merged into emissions during the second pass.
    reference: Option<AnnotationLog>,
    capture_index: u64,
    emissions: Vec<FrameEmission>,
    pdus: Vec<Pdu>,
    errors: Vec<ReassemblyError>,
    memory_warned: bool,
}

impl PassCoordinator {
    /// Single-pass coordinator.
    pub fn new(registry: Arc<LayerRegistry>, config: ReassemblyConfig) -> Self {
        Self::with_chain(LayerChain::new(registry, config), None)
    }

    fn with_chain(chain: LayerChain, reference: Option<AnnotationLog>) -> Self {
        Self {
            chain,
            reference,
            capture_index: 0,
            emissions: Vec::new(),
            pdus: Vec::new(),
            errors: Vec::new(),
            memory_warned: false,
        }
    }

    pub fn chain(&self) -> &LayerChain {
        &self.chain
    }

    /// Access the chain for manual consumers and synthetic streams.
    pub fn chain_mut(&mut self) -> &mut LayerChain {
        &mut self.chain
    }

    /// Process the next frame in capture order.
    pub fn process_frame(&mut self, frame: &CapturedFrame) -> FrameEmission {
        let mut pdus = Vec::new();
        for segment in &frame.segments {
            let mut outcome = if segment.open {
                self.chain.reopen(segment.key, frame.id)
            } else {
                Default::default()
            };
            outcome.absorb(self.chain.feed(
                segment.key,
                segment.offset,
                segment.payload.clone(),
                frame.id,
                self.capture_index,
            ));
            match segment.teardown {
                Some(Teardown::Fin) => {
                    let end = segment.offset.saturating_add(segment.payload.len() as u64);
                    outcome.absorb(self.chain.fin(segment.key, end, frame.id));
                }
                Some(Teardown::Reset) => {
                    // An abort ends both directions of the connection
                    outcome.absorb(self.chain.reset(segment.key, frame.id));
                    outcome.absorb(self.chain.reset(segment.key.reverse(), frame.id));
                }
                None => {}
            }
            pdus.extend(outcome.pdus);
            self.errors.extend(outcome.errors);
        }
        self.capture_index += 1;

        if !self.memory_warned && self.chain.memory_limit_exceeded() {
            warn!(
                memory = self.chain.total_memory(),
                limit = self.chain.config().max_total_memory,
                "reassembly memory limit exceeded"
            );
            self.memory_warned = true;
        }

        let mut annotation = self.chain.log().annotation(frame.id);
        if let Some(reference) = &self.reference {
            annotation.merge(&reference.annotation(frame.id));
        }
        trace!(frame = frame.id, pdus = pdus.len(), "frame processed");

        let emission = FrameEmission {
            frame: frame.id,
            annotation,
            pdus,
        };
        self.pdus.extend(emission.pdus.iter().cloned());
        self.emissions.push(emission.clone());
        emission
    }

    /// End of capture: tear down every stream and report.
    pub fn finish(mut self) -> CaptureReport {
        self.close_all();
        let mode = if self.reference.is_some() {
            PassMode::Two
        } else {
            PassMode::Single
        };
        debug!(
            frames = self.emissions.len(),
            pdus = self.pdus.len(),
            errors = self.errors.len(),
            "capture finished"
        );
        let (annotations, _) = self.chain.into_parts();
        CaptureReport {
            mode,
            emissions: self.emissions,
            annotations,
            first_pass: self.reference,
            pdus: self.pdus,
            errors: self.errors,
        }
    }

    fn close_all(&mut self) {
        let outcome = self.chain.close_all();
        self.pdus.extend(outcome.pdus);
        self.errors.extend(outcome.errors);
        self.errors.extend(self.chain.unmatched_expectations());
    }

    /// Run a whole capture in the given mode.
    pub fn run(
        registry: Arc<LayerRegistry>,
        config: ReassemblyConfig,
        mode: PassMode,
        frames: &[CapturedFrame],
    ) -> CaptureReport {
        match mode {
            PassMode::Single => {
                let mut coordinator = Self::new(registry, config);
                for frame in frames {
                    coordinator.process_frame(frame);
                }
                coordinator.finish()
            }
            PassMode::Two => {
                let chain = LayerChain::for_pass(Arc::clone(&registry), config.clone(), Pass::First);
                let mut first = Self::with_chain(chain, None);
                for frame in frames {
                    first.process_frame(frame);
                }
                first.close_all();
                let (log, index) = first.chain.into_parts();
                debug!(events = log.len(), "first pass complete");

                let chain = LayerChain::for_pass(registry, config, Pass::Second)
                    .with_expected(Arc::new(index));
                let mut second = Self::with_chain(chain, Some(log));
                for frame in frames {
                    second.process_frame(frame);
                }
                second.finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Classification, ConnectionKey, Direction};
    use std::net::{IpAddr, Ipv4Addr};

    fn key() -> StreamKey {
        let conn = ConnectionKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            9999,
        );
        StreamKey::new(conn, Direction::ToServer)
    }

    fn frame(id: FrameId, offset: u64, data: &'static [u8]) -> CapturedFrame {
        CapturedFrame::new(id).with_segment(SegmentInput::new(key(), offset, Bytes::from_static(data)))
    }

    // Test 1: Emissions carry the classification of each frame
    #[test]
    fn test_single_pass_emissions() {
        let mut coordinator =
            PassCoordinator::new(Arc::new(LayerRegistry::new()), ReassemblyConfig::default());
        let a = coordinator.process_frame(&frame(1, 0, b"ab"));
        let b = coordinator.process_frame(&frame(2, 0, b"ab"));
        assert!(!a.annotation.is_retransmission());
        assert!(b.annotation.is_retransmission());

        let report = coordinator.finish();
        assert_eq!(report.mode, PassMode::Single);
        assert_eq!(report.emissions.len(), 2);
        assert!(report.first_pass.is_none());
    }

    // Test 2: End of capture reports unclosed gaps, never fails
    #[test]
    fn test_finish_reports_gaps() {
        let frames = vec![frame(1, 0, b"ab"), frame(2, 5, b"fg")];
        let report = PassCoordinator::run(
            Arc::new(LayerRegistry::new()),
            ReassemblyConfig::default(),
            PassMode::Single,
            &frames,
        );
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0],
            ReassemblyError::GapNeverClosed { start: 2, end: 5, .. }
        ));
    }

    // Test 3: Two passes agree with themselves on a deterministic capture
    #[test]
    fn test_two_pass_no_violation() {
        let frames = vec![frame(1, 3, b"de"), frame(2, 0, b"abc"), frame(3, 0, b"ab")];
        let report = PassCoordinator::run(
            Arc::new(LayerRegistry::new()),
            ReassemblyConfig::default(),
            PassMode::Two,
            &frames,
        );
        assert_eq!(report.mode, PassMode::Two);
        assert!(report.errors.is_empty());
        assert!(report.first_pass.is_some());
        let first = report.emission(1).unwrap();
        assert!(first.annotation.is_out_of_order());
        let layer = &report.annotation(2).layers[0];
        assert_eq!(layer.classifications, vec![Classification::FillsGap]);
    }

    // Test 4: Teardown flags end root streams
    #[test]
    fn test_reset_teardown() {
        let mut coordinator =
            PassCoordinator::new(Arc::new(LayerRegistry::new()), ReassemblyConfig::default());
        coordinator.process_frame(&frame(1, 0, b"ab"));
        let reset = CapturedFrame::new(2)
            .with_segment(SegmentInput::new(key(), 2, Bytes::new()).with_teardown(Teardown::Reset));
        coordinator.process_frame(&reset);
        assert!(coordinator.chain().stream(&key()).is_none());
    }

    // Test 5: A reset from one side closes both directions
    #[test]
    fn test_reset_closes_both_directions() {
        let mut coordinator =
            PassCoordinator::new(Arc::new(LayerRegistry::new()), ReassemblyConfig::default());
        let reply = key().reverse();
        coordinator.process_frame(&frame(1, 0, b"req"));
        coordinator.process_frame(
            &CapturedFrame::new(2).with_segment(SegmentInput::new(reply, 0, Bytes::from_static(b"re"))),
        );
        let reset = CapturedFrame::new(3)
            .with_segment(SegmentInput::new(key(), 3, Bytes::new()).with_teardown(Teardown::Reset));
        coordinator.process_frame(&reset);
        assert!(coordinator.chain().stream(&key()).is_none());
        assert!(coordinator.chain().stream(&reply).is_none());

        // The rest of the reply is late and ignored
        let late = coordinator.process_frame(
            &CapturedFrame::new(4).with_segment(SegmentInput::new(reply, 2, Bytes::from_static(b"sp"))),
        );
        assert!(late.annotation.is_empty());
        assert_eq!(coordinator.chain().stream_count(), 0);
    }

    // Test 6: An open marker starts a fresh stream on a closed key
    #[test]
    fn test_open_after_fin() {
        let mut coordinator =
            PassCoordinator::new(Arc::new(LayerRegistry::new()), ReassemblyConfig::default());
        let fin = CapturedFrame::new(1).with_segment(
            SegmentInput::new(key(), 0, Bytes::from_static(b"first")).with_teardown(Teardown::Fin),
        );
        coordinator.process_frame(&fin);
        assert!(coordinator.chain().stream(&key()).is_none());

        let ignored = coordinator.process_frame(&frame(2, 0, b"again"));
        assert!(ignored.annotation.is_empty());

        let open = CapturedFrame::new(3)
            .with_segment(SegmentInput::new(key(), 0, Bytes::from_static(b"second")).with_open());
        let emission = coordinator.process_frame(&open);
        let layer = &emission.annotation.layers[0];
        assert_eq!(layer.classifications, vec![Classification::New]);
        assert!(coordinator.chain().stream(&key()).is_some());
    }
}
