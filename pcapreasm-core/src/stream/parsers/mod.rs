//! Built-in layer framers.
//!
//! These only find PDU boundaries and route payloads to child layers;
//! field extraction is left to whoever consumes the delivered PDUs.

mod grpc;
mod http;
mod http2;
mod tls;

pub use grpc::{GrpcFactory, GrpcFramer};
pub use http::{HttpFactory, HttpFramer};
pub use http2::{FrameHeader, FrameType, Http2Factory, Http2Framer, CONNECTION_PREFACE};
pub use tls::{content_type, RecordDecryptor, TlsFactory, TlsFramer, TlsRecord};

use super::{Framing, LayerRegistry};

/// Register http, tls, http2 and grpc with default settings.
pub fn register_builtin(registry: &mut LayerRegistry) {
    registry.register(HttpFactory);
    registry.register(TlsFactory::new());
    registry.register(Http2Factory::new());
    registry.register(GrpcFactory);
}

/// Frame a PDU made of a fixed-size header followed by a body whose
/// length the header declares.
///
/// `body_len` validates the header and returns the body length.
pub(crate) fn length_prefixed(
    data: &[u8],
    header_len: usize,
    body_len: impl FnOnce(&[u8]) -> Result<usize, String>,
) -> Framing {
    if data.len() < header_len {
        return Framing::NeedMore {
            minimum_bytes: Some(header_len),
        };
    }
    match body_len(&data[..header_len]) {
        Ok(len) => Framing::Pdu {
            len: header_len + len,
        },
        Err(message) => Framing::Error {
            message,
            skip_bytes: None,
        },
    }
}
