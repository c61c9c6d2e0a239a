//! Retransmission, reordering and gap handling on one TCP stream.
//!
//! The capture is "(SYN) 2 H H 1 3 H": a 4-byte PDU "H123" whose segments
//! arrive out of order, with a retransmitted header before and after the
//! PDU completes.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use pcapreasm_core::stream::{
    CaptureReport, CapturedFrame, Classification, Framing, LayerContext, LayerFactory, LayerParser,
    LayerRegistry, PassCoordinator, PassMode, ReassemblyConfig, TcpFlags, TcpTracker,
};

use common::{init_tracing, CLIENT, CLIENT_PORT, SERVER};

const PORT: u16 = 9999;
const ISN: u32 = u32::MAX - 1;

/// 4-byte PDUs that start with 'H'.
struct HeaderParser;

impl LayerParser for HeaderParser {
    fn name(&self) -> &'static str {
        "hdr"
    }

    fn frame(&mut self, data: &[u8], _context: &LayerContext) -> Framing {
        if data[0] == b'H' {
            Framing::Pdu { len: 4 }
        } else {
            Framing::Error {
                message: "expected header".to_string(),
                skip_bytes: Some(1),
            }
        }
    }
}

struct HeaderFactory;

impl LayerFactory for HeaderFactory {
    fn kind(&self) -> &'static str {
        "hdr"
    }

    fn matches(&self, context: &LayerContext) -> bool {
        context.has_port(PORT)
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(HeaderParser)
    }
}

fn registry() -> Arc<LayerRegistry> {
    let mut registry = LayerRegistry::new();
    registry.register(HeaderFactory);
    Arc::new(registry)
}

/// Frames 1..=7 through the TCP tracker. The initial sequence number sits
/// just below 2^32 so the stream wraps.
fn capture() -> Vec<CapturedFrame> {
    let mut tracker = TcpTracker::new();
    let syn = TcpFlags {
        syn: true,
        ..TcpFlags::default()
    };
    let ack = TcpFlags {
        ack: true,
        ..TcpFlags::default()
    };
    let open = tracker
        .segment(CLIENT, CLIENT_PORT, SERVER, PORT, ISN, syn, Bytes::new(), 1)
        .expect("open marker");
    assert!(open.open && open.payload.is_empty());

    let data_seq = ISN.wrapping_add(1);
    let segments: [(u64, u32, &'static [u8]); 6] = [
        (2, 2, b"2"),
        (3, 0, b"H"),
        (4, 0, b"H"),
        (5, 1, b"1"),
        (6, 3, b"3"),
        (7, 0, b"H"),
    ];

    let mut frames = vec![CapturedFrame::new(1).with_segment(open)];
    for (id, rel, payload) in segments {
        let seq = data_seq.wrapping_add(rel);
        let input = tracker
            .segment(CLIENT, CLIENT_PORT, SERVER, PORT, seq, ack, Bytes::from_static(payload), id)
            .expect("data segment");
        assert_eq!(input.offset, rel as u64);
        frames.push(CapturedFrame::new(id).with_segment(input));
    }
    frames
}

fn run(mode: PassMode) -> CaptureReport {
    init_tracing();
    PassCoordinator::run(registry(), ReassemblyConfig::default(), mode, &capture())
}

fn classifications(report: &CaptureReport, frame: u64) -> Vec<Classification> {
    report
        .annotation(frame)
        .layers
        .iter()
        .flat_map(|l| l.classifications.iter().copied())
        .collect()
}

// Test 1: Final annotations of every frame
#[test]
fn test_scenario_final_annotations() {
    let report = run(PassMode::Single);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    assert!(report.annotation(1).is_empty());

    assert_eq!(classifications(&report, 2), vec![Classification::OutOfOrder]);
    assert_eq!(report.annotation(2).reassembled_in(), Some(6));

    let frame3 = report.annotation(3);
    assert_eq!(classifications(&report, 3), vec![Classification::OutOfOrder]);
    assert!(frame3.segment_of_pdu());
    assert_eq!(frame3.reassembled_in(), Some(6));

    assert_eq!(classifications(&report, 4), vec![Classification::Retransmission]);
    assert!(report.annotation(4).segment_of_pdu());
    assert_eq!(report.annotation(4).reassembled_in(), Some(6));

    assert_eq!(classifications(&report, 5), vec![Classification::FillsGap]);
    assert_eq!(report.annotation(5).reassembled_in(), Some(6));

    // Frame 5 closed the gap, so frame 6 starts at the contiguous end with
    // nothing buffered beyond it
    assert_eq!(classifications(&report, 6), vec![Classification::New]);
    let frame6 = report.annotation(6);
    assert!(frame6.completes_pdu());
    assert_eq!(frame6.reassembled_in(), None);

    let frame7 = report.annotation(7);
    assert!(frame7.is_retransmission());
    assert!(!frame7.segment_of_pdu());
    assert_eq!(frame7.reassembled_in(), None);
}

// Test 2: The PDU and the frames it came from
#[test]
fn test_scenario_pdu() {
    let report = run(PassMode::Single);
    assert_eq!(report.pdus.len(), 1);

    let pdu = &report.pdus[0];
    assert_eq!(pdu.bytes, Bytes::from_static(b"H123"));
    assert_eq!(pdu.kind, "hdr");
    assert_eq!(pdu.completing_frame, 6);
    assert!(pdu.is_complete());
    assert!(!pdu.conflict);

    let mut frames = pdu.originating_frames.to_vec();
    frames.sort_unstable();
    assert_eq!(frames, vec![2, 3, 4, 5, 6]);

    assert_eq!(report.emission(6).map(|e| e.pdus.len()), Some(1));
}

// Test 3: Single pass learns reassembly targets late, two passes up front
#[test]
fn test_scenario_emissions_by_mode() {
    let single = run(PassMode::Single);
    let first_emission = &single.emission(3).expect("frame 3").annotation;
    assert!(first_emission.segment_of_pdu());
    assert_eq!(first_emission.reassembled_in(), None);

    let two = run(PassMode::Two);
    assert!(two.errors.is_empty(), "{:?}", two.errors);
    for frame in [2, 3, 4, 5] {
        let emitted = &two.emission(frame).expect("emitted").annotation;
        assert_eq!(emitted.reassembled_in(), Some(6), "frame {frame}");
    }
    let frame7 = &two.emission(7).expect("frame 7").annotation;
    assert!(frame7.is_retransmission());
    assert_eq!(frame7.reassembled_in(), None);
}

// Test 4: Both modes reassemble identical content
#[test]
fn test_two_pass_stability() {
    let single = run(PassMode::Single);
    let two = run(PassMode::Two);
    assert_eq!(single.pdu_bytes("hdr"), b"H123".to_vec());
    assert_eq!(single.pdu_bytes("hdr"), two.pdu_bytes("hdr"));
    assert_eq!(two.mode, PassMode::Two);
    assert!(two.first_pass.is_some());

    // Pass two saw the same classifications as pass one
    for frame in 2..=7 {
        assert_eq!(
            two.annotation(frame).layers[0].classifications,
            single.annotation(frame).layers[0].classifications
        );
    }
}
