//! # pcapreasm-core
//!
//! Layered stream reassembly for captured network traffic.
//!
//! This crate turns transport segments taken from a capture into the
//! protocol data units of every layer carried on them. It handles
//! retransmissions, overlaps, out-of-order arrival and gaps, and reports
//! for each frame how its bytes were used: which PDU they belong to and
//! in which frame that PDU was finally reassembled.
//!
//! ## Features
//!
//! - **Sequence Tracking**: Retransmission, overlap and out-of-order
//!   classification with conflict detection
//! - **PDU Assembly**: Exact and at-least requests, multi-segment PDUs
//! - **Layer Stacking**: Protocols inside other protocols' PDUs are
//!   reassembled on child streams (TLS, HTTP/2, gRPC)
//! - **Two-Pass Mode**: Final annotations known when a frame is first emitted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pcapreasm_core::prelude::*;
//!
//! let registry = Arc::new(LayerRegistry::with_builtin());
//! let mut coordinator = PassCoordinator::new(registry, ReassemblyConfig::default());
//!
//! // Feed frames in capture order...
//! // let emission = coordinator.process_frame(&frame);
//!
//! let report = coordinator.finish();
//! println!("{} PDUs, {} errors", report.pdus.len(), report.errors.len());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        pcapreasm-core                               |
//! +---------------------------------------------------------------------+
//! |  stream/coordinator  - single and two-pass runs                     |
//! |  stream/chain        - stream tree, layer binding, PDU routing      |
//! |  stream/assembler    - PDU requests over contiguous bytes           |
//! |  stream/sequence     - classification, gaps, conflicts              |
//! |  stream/parsers/     - HTTP, TLS, HTTP/2, gRPC framers              |
//! |  error/              - Error types                                  |
//! +---------------------------------------------------------------------+
//! ```

pub mod error;
pub mod prelude;
pub mod stream;

pub use error::{Error, ReassemblyError, Result};
pub use stream::{
    CaptureReport, CapturedFrame, Classification, Direction, FrameAnnotation, FrameId,
    LayerChain, LayerRegistry, PassCoordinator, PassMode, Pdu, ReassemblyConfig, SegmentInput,
    StreamId, StreamKey, TcpTracker,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
