//! HTTP/2 frame framing (RFC 7540).
//!
//! Each frame is one PDU. DATA payloads, with padding stripped, are
//! forwarded to a child stream per HTTP/2 stream id so that message
//! bodies spanning several DATA frames can be reassembled by the layer
//! above (gRPC by default). The client connection preface is consumed
//! silently.

use super::length_prefixed;
use crate::stream::{Framing, LayerContext, LayerFactory, LayerParser, Pdu, PduAction};

/// HTTP/2 connection preface: "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::GoAway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }

    /// Frame types that must carry a non-zero stream id.
    fn requires_stream(&self) -> bool {
        matches!(
            self,
            FrameType::Data
                | FrameType::Headers
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::Continuation
        )
    }
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const PADDED: u8 = 0x8;
}

/// HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let frame_type = FrameType::from(data[3]);
        let flags = data[4];
        let stream_id = ((data[5] as u32 & 0x7F) << 24)
            | ((data[6] as u32) << 16)
            | ((data[7] as u32) << 8)
            | (data[8] as u32);

        Some(FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn is_padded(&self) -> bool {
        self.flags & flags::PADDED != 0
    }
}

/// Byte range of a DATA frame's payload within the frame, padding excluded.
fn data_range(header: &FrameHeader, frame: &[u8]) -> Option<std::ops::Range<usize>> {
    let start = FrameHeader::SIZE;
    let end = frame.len();
    if !header.is_padded() {
        return Some(start..end);
    }
    let pad_len = *frame.get(start)? as usize;
    let data_start = start + 1;
    let data_end = end.checked_sub(pad_len)?;
    (data_start <= data_end).then_some(data_start..data_end)
}

/// HTTP/2 frame framer.
#[derive(Debug, Clone, Copy)]
pub struct Http2Framer {
    data_kind: &'static str,
}

impl Http2Framer {
    pub fn new(data_kind: &'static str) -> Self {
        Self { data_kind }
    }
}

impl LayerParser for Http2Framer {
    fn name(&self) -> &'static str {
        "http2"
    }

    fn frame(&mut self, data: &[u8], context: &LayerContext) -> Framing {
        if context.pdus_parsed == 0 {
            if data.starts_with(CONNECTION_PREFACE) {
                return Framing::Pdu {
                    len: CONNECTION_PREFACE.len(),
                };
            }
            if data.len() < CONNECTION_PREFACE.len() && CONNECTION_PREFACE.starts_with(data) {
                return Framing::NeedMore {
                    minimum_bytes: Some(CONNECTION_PREFACE.len()),
                };
            }
        }

        length_prefixed(data, FrameHeader::SIZE, |bytes| {
            let header = FrameHeader::parse(bytes).ok_or_else(|| "short HTTP/2 frame header".to_string())?;
            if header.frame_type.requires_stream() && header.stream_id == 0 {
                return Err(format!("{} frame on stream 0", header.frame_type.as_str()));
            }
            Ok(header.length as usize)
        })
    }

    fn on_pdu(&mut self, pdu: &Pdu, context: &LayerContext) -> Vec<PduAction> {
        if context.pdus_parsed == 0 && pdu.bytes.as_ref() == CONNECTION_PREFACE {
            return vec![PduAction::Discard];
        }
        let Some(header) = FrameHeader::parse(&pdu.bytes) else {
            return vec![PduAction::Deliver];
        };
        if header.frame_type != FrameType::Data {
            return vec![PduAction::Deliver];
        }
        match data_range(&header, &pdu.bytes) {
            Some(range) => vec![PduAction::Forward {
                kind: self.data_kind,
                channel: header.stream_id as u64,
                range,
            }],
            None => vec![PduAction::Deliver],
        }
    }
}

/// Creates [`Http2Framer`]s. HTTP/2 is reached by upgrade or from TLS,
/// never detected on a root stream.
#[derive(Debug, Clone, Copy)]
pub struct Http2Factory {
    data_kind: &'static str,
}

impl Http2Factory {
    pub fn new() -> Self {
        Self { data_kind: "grpc" }
    }

    /// Layer kind receiving DATA payloads (default `grpc`).
    pub fn with_data_kind(mut self, kind: &'static str) -> Self {
        self.data_kind = kind;
        self
    }
}

impl Default for Http2Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerFactory for Http2Factory {
    fn kind(&self) -> &'static str {
        "http2"
    }

    fn display_name(&self) -> &'static str {
        "HTTP/2"
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(Http2Framer::new(self.data_kind))
    }
}
