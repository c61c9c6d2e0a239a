//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcapreasm_core::prelude::*;
//!
//! let registry = LayerRegistry::with_builtin();
//! assert!(registry.get_factory("http").is_some());
//! ```

// Capture-level types
pub use crate::stream::{
    CaptureReport, CapturedFrame, FrameEmission, PassCoordinator, PassMode, SegmentInput, Teardown,
};

// Chain and layers
pub use crate::stream::{
    Framing, LayerChain, LayerContext, LayerFactory, LayerParser, LayerRegistry, Pdu, PduAction,
    PduRequest, ReassemblyConfig,
};

// Streams and annotations
pub use crate::stream::{
    Classification, ConnectionKey, Direction, FrameAnnotation, FrameId, StreamId, StreamKey,
    TcpTracker,
};

// Error types
pub use crate::error::{Error, ReassemblyError, Result};
