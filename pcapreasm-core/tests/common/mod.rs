//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use pcapreasm_core::stream::{
    CapturedFrame, ConnectionKey, Direction, FrameId, Framing, LayerContext, LayerFactory,
    LayerParser, Pdu, PduAction, SegmentInput, StreamKey,
};
use tracing_subscriber::EnvFilter;

pub const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
pub const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
pub const CLIENT_PORT: u16 = 40000;

/// Install a test subscriber; `RUST_LOG=pcapreasm_core=trace` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client-to-server stream key for a server port.
pub fn key(port: u16) -> StreamKey {
    let conn = ConnectionKey::new(CLIENT, CLIENT_PORT, SERVER, port);
    StreamKey::new(conn, Direction::ToServer)
}

pub fn frame(id: FrameId, key: StreamKey, offset: u64, data: &[u8]) -> CapturedFrame {
    CapturedFrame::new(id).with_segment(SegmentInput::new(key, offset, Bytes::copy_from_slice(data)))
}

/// PDUs are a length byte followed by that many bytes.
///
/// With `forward` set, each PDU's body is forwarded to a child of the same
/// kind until the body is a single byte, which is delivered.
pub struct LenParser {
    pub kind: &'static str,
    pub forward: bool,
}

impl LayerParser for LenParser {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn frame(&mut self, data: &[u8], _context: &LayerContext) -> Framing {
        Framing::Pdu {
            len: 1 + data[0] as usize,
        }
    }

    fn on_pdu(&mut self, pdu: &Pdu, _context: &LayerContext) -> Vec<PduAction> {
        if self.forward && pdu.len() > 2 {
            vec![PduAction::Forward {
                kind: self.kind,
                channel: 0,
                range: 1..pdu.len(),
            }]
        } else {
            vec![PduAction::Deliver]
        }
    }
}

pub struct LenFactory {
    pub kind: &'static str,
    pub port: Option<u16>,
    pub forward: bool,
}

impl LenFactory {
    pub fn on_port(kind: &'static str, port: u16) -> Self {
        Self {
            kind,
            port: Some(port),
            forward: false,
        }
    }
}

impl LayerFactory for LenFactory {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn matches(&self, context: &LayerContext) -> bool {
        self.port.map_or(false, |port| context.has_port(port))
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(LenParser {
            kind: self.kind,
            forward: self.forward,
        })
    }
}
