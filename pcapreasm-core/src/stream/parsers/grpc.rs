use super::length_prefixed;
use crate::stream::{Framing, LayerContext, LayerFactory, LayerParser};

/// Length-prefixed message header: compressed flag + u32 length.
const MESSAGE_HEADER_LEN: usize = 5;

/// gRPC message framer over one HTTP/2 stream's DATA bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcFramer;

impl LayerParser for GrpcFramer {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn frame(&mut self, data: &[u8], _context: &LayerContext) -> Framing {
        length_prefixed(data, MESSAGE_HEADER_LEN, |header| {
            if header[0] > 1 {
                return Err(format!("invalid gRPC compressed flag {}", header[0]));
            }
            let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
            Ok(length as usize)
        })
    }
}

/// Creates [`GrpcFramer`]s for HTTP/2 DATA children.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcFactory;

impl LayerFactory for GrpcFactory {
    fn kind(&self) -> &'static str {
        "grpc"
    }

    fn display_name(&self) -> &'static str {
        "gRPC"
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(GrpcFramer)
    }
}
