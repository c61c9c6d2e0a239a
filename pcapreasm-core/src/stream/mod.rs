//! Layered stream reassembly.
//!
//! Captured segments are placed into per-stream sequence spaces, turned
//! into contiguous bytes, cut into PDUs by layer framers, and routed to
//! child streams so that protocols nested inside other protocols' PDUs
//! (HTTP/2 inside TLS, gRPC inside HTTP/2 DATA) are reassembled the same
//! way as the transport below them.
//!
//! ## Components
//!
//! - [`TcpTracker`] - Maps TCP sequence numbers to stream offsets
//! - [`SequenceSpace`] - Classifies segments and releases contiguous bytes
//! - [`Assembler`] - Accumulates bytes into PDUs on request
//! - [`LayerChain`] - Stream tree, layer binding and PDU routing
//! - [`PassCoordinator`] - Single or two-pass runs over a capture
//! - [`LayerFactory`] / [`LayerParser`] - Pluggable layer framers
//! - [`AnnotationLog`] - Per-frame reassembly annotations
//!
//! ## Built-in Layers
//!
//! - HTTP/1.x (Content-Length and chunked bodies, h2c upgrade)
//! - TLS (records, optional decryption through [`RecordDecryptor`])
//! - HTTP/2 (frames, DATA payloads per stream)
//! - gRPC (length-prefixed messages)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pcapreasm_core::stream::{
//!     CapturedFrame, LayerRegistry, PassCoordinator, PassMode, ReassemblyConfig,
//! };
//!
//! let registry = Arc::new(LayerRegistry::with_builtin());
//! let frames: Vec<CapturedFrame> = Vec::new();
//! let report = PassCoordinator::run(registry, ReassemblyConfig::default(), PassMode::Two, &frames);
//! for pdu in &report.pdus {
//!     println!("{} {} bytes in frame {}", pdu.kind, pdu.len(), pdu.completing_frame);
//! }
//! ```

mod annotation;
mod assembler;
mod chain;
mod connection;
mod context;
mod coordinator;
mod coverage;
mod parser;
pub mod parsers;
mod registry;
mod sequence;

pub use annotation::{
    AnnotationEvent, AnnotationLog, ConflictRecord, FrameAnnotation, LayerAnnotation, PduRecord,
};
pub use assembler::{Assembler, ChunkKind, Completeness, Pdu, PduHandle, PduPoll, PduRequest};
pub use chain::{
    BindingFeed, ClassificationIndex, FeedOutcome, LayerBinding, LayerChain, ReassemblyConfig,
    Span, RAW_KIND,
};
pub use connection::{Connection, ConnectionKey, StreamKey, TcpFlags, TcpTracker};
pub use context::{Direction, FrameId, LayerContext, LayerStep, Pass, StreamId, StreamPath};
pub use coordinator::{
    CaptureReport, CapturedFrame, FrameEmission, PassCoordinator, PassMode, SegmentInput, Teardown,
};
pub use coverage::{CoverageMap, CoveredRange};
pub use parser::{Framing, LayerFactory, LayerParser, PduAction};
pub use parsers::RecordDecryptor;
pub use registry::LayerRegistry;
pub use sequence::{
    classify, Classification, Observation, OverlapConflict, Segment, SequenceSpace, StreamStats,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct MockParser;

    impl LayerParser for MockParser {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn frame(&mut self, _: &[u8], _: &LayerContext) -> Framing {
            Framing::NotThisProtocol
        }
    }

    struct MockFactory;

    impl LayerFactory for MockFactory {
        fn kind(&self) -> &'static str {
            "mock"
        }

        fn matches(&self, context: &LayerContext) -> bool {
            context.has_port(80)
        }

        fn create(&self, _: &LayerContext) -> Box<dyn LayerParser> {
            Box::new(MockParser)
        }
    }

    fn context(port: u16) -> LayerContext {
        let conn = ConnectionKey::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1234,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        );
        LayerContext {
            stream: StreamId(1),
            path: StreamPath::root(StreamKey::new(conn, Direction::ToServer)),
            direction: Direction::ToServer,
            frame: 1,
            pass: Pass::Single,
            bytes_parsed: 0,
            pdus_parsed: 0,
        }
    }

    // Test 1: LayerRegistry registration
    #[test]
    fn test_registry_register() {
        let mut registry = LayerRegistry::new();
        registry.register(MockFactory);
        assert_eq!(registry.factory_names(), vec!["mock"]);
    }

    // Test 2: LayerRegistry find_factory
    #[test]
    fn test_registry_find_factory() {
        let mut registry = LayerRegistry::new();
        registry.register(MockFactory);

        let factory = registry.find_factory(&context(80));
        assert!(factory.is_some());
        assert_eq!(factory.unwrap().kind(), "mock");
        assert!(registry.find_factory(&context(22)).is_none());
    }

    // Test 3: LayerRegistry get_factory by kind
    #[test]
    fn test_registry_get_factory() {
        let mut registry = LayerRegistry::new();
        registry.register(MockFactory);

        assert!(registry.get_factory("mock").is_some());
        assert!(registry.get_factory("nonexistent").is_none());
        assert_eq!(registry.get_factory("mock").unwrap().display_name(), "mock");
    }

    // Test 4: Stream paths name the layer stack
    #[test]
    fn test_stream_path_display() {
        let ctx = context(443);
        let path = ctx.path.child("tls", 0).child("http2", 0).child("grpc", 3);
        assert_eq!(path.depth(), 3);
        assert!(path.to_string().ends_with("/tls:0/http2:0/grpc:3"));
    }
}
