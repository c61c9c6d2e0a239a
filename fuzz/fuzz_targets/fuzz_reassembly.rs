//! Fuzz target for the layer chain.
//!
//! The input is cut into segments of one TCP stream and fed through the
//! built-in layers:
//!
//! - Arbitrary offsets (gaps, overlaps, retransmissions, conflicts)
//! - HTTP/1.x on port 80, TLS on port 443, raw bytes elsewhere
//! - Single or two-pass runs
//! - FIN and RST teardown, and reuse of the key after them

#![no_main]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pcapreasm_core::stream::{
    CapturedFrame, ConnectionKey, Direction, LayerRegistry, PassCoordinator, PassMode,
    ReassemblyConfig, SegmentInput, StreamKey, Teardown,
};

/// Segment header: offset (u16), length (u8), flags (u8).
const HEADER_LEN: usize = 4;

fn stream_key(port: u16, direction: Direction) -> StreamKey {
    let conn = ConnectionKey::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        12345,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        port,
    );
    StreamKey::new(conn, direction)
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte selects port, direction and mode
    let selector = data[0];
    let port = match selector % 3 {
        0 => 80,
        1 => 443,
        _ => 9000,
    };
    let direction = if selector & 0x4 == 0 {
        Direction::ToServer
    } else {
        Direction::ToClient
    };
    let mode = if selector & 0x8 == 0 {
        PassMode::Single
    } else {
        PassMode::Two
    };
    let key = stream_key(port, direction);

    let mut frames = Vec::new();
    let mut rest = &data[1..];
    while rest.len() > HEADER_LEN {
        let offset = u16::from_be_bytes([rest[0], rest[1]]) as u64;
        let len = (rest[2] as usize).min(rest.len() - HEADER_LEN);
        let flags = rest[3];
        let payload = Bytes::copy_from_slice(&rest[HEADER_LEN..HEADER_LEN + len]);
        rest = &rest[HEADER_LEN + len..];

        let mut segment = SegmentInput::new(key, offset, payload);
        match flags % 16 {
            0 => segment = segment.with_teardown(Teardown::Fin),
            1 => segment = segment.with_teardown(Teardown::Reset),
            2 => segment = segment.with_open(),
            _ => {}
        }
        frames.push(CapturedFrame::new(frames.len() as u64 + 1).with_segment(segment));
    }

    let config = ReassemblyConfig::default()
        .with_max_pdu_bytes(64 * 1024)
        .with_out_of_order_delivery(selector & 0x10 != 0);
    let registry = Arc::new(LayerRegistry::with_builtin());
    let report = PassCoordinator::run(registry, config, mode, &frames);

    // Bytes arrive no later than the frame that completes their PDU
    for pdu in &report.pdus {
        if pdu.is_complete() && !pdu.is_empty() {
            assert!(!pdu.originating_frames.is_empty());
        }
        assert!(pdu.originating_frames.iter().all(|f| *f <= pdu.completing_frame));
    }
});
