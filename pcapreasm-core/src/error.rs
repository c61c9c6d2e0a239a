//! Error types for pcapreasm-core.
//!
//! This module provides structured error types for reassembly operations:
//!
//! - [`enum@Error`] - Main error enum returned by fallible chain operations
//! - [`ReassemblyError`] - Stream-scoped reassembly conditions
//!
//! Every [`ReassemblyError`] is scoped to a single stream. The engine reports
//! them alongside its output and keeps processing other streams; nothing in
//! this crate aborts a capture run.

use bytes::Bytes;
use thiserror::Error;

use crate::stream::{Classification, FrameId, StreamId};

/// Main error type for pcapreasm-core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Stream-scoped reassembly error
    #[error("Reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// No layer factory registered for a discovered kind
    #[error("No layer registered for kind '{kind}'")]
    UnknownLayer { kind: String },
}

/// Stream-scoped reassembly conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Teardown with an unobserved range below the highest observed offset.
    #[error("stream {stream}: gap [{start}, {end}) never closed")]
    GapNeverClosed { stream: StreamId, start: u64, end: u64 },

    /// The same byte range was supplied twice with different content.
    #[error(
        "stream {stream}: frame {conflicting_frame} overlaps [{start}, {end}) \
         from frame {original_frame} with different content"
    )]
    OverlapMismatch {
        stream: StreamId,
        start: u64,
        end: u64,
        original_frame: FrameId,
        conflicting_frame: FrameId,
        /// Content of the second version; the first stays in the stream.
        conflicting_data: Bytes,
    },

    /// The second pass classified a segment differently than the first.
    #[error(
        "stream {stream}: frame {frame} classified {observed:?} in pass two, \
         pass one recorded {expected:?}"
    )]
    OrderingViolation {
        stream: StreamId,
        frame: FrameId,
        expected: Option<Classification>,
        observed: Option<Classification>,
    },

    /// A consumer asked for more bytes than the per-stream ceiling.
    #[error("stream {stream}: PDU request of {requested} bytes exceeds ceiling of {ceiling}")]
    UnboundedPending {
        stream: StreamId,
        requested: usize,
        ceiling: usize,
    },

    /// Operation on a stream that was never created or already torn down.
    #[error("stream {stream}: no such stream")]
    UnknownStream { stream: StreamId },

    /// A PDU handle that no longer refers to the open PDU.
    #[error("stream {stream}: stale PDU handle {index}")]
    StaleHandle { stream: StreamId, index: u64 },

    /// A segment whose last byte lies beyond the largest representable offset.
    #[error("stream {stream}: segment of {len} bytes at offset {offset} overflows the offset space")]
    OffsetOverflow { stream: StreamId, offset: u64, len: usize },

    /// A byte-stream binding was requested below bytes already handed out as PDUs.
    #[error("stream {stream}: cannot attach at offset {offset}, PDUs already consumed up to {cursor}")]
    AttachBelowCursor {
        stream: StreamId,
        offset: u64,
        cursor: u64,
    },
}

impl ReassemblyError {
    /// Stream the error is scoped to.
    pub fn stream(&self) -> StreamId {
        match self {
            ReassemblyError::GapNeverClosed { stream, .. }
            | ReassemblyError::OverlapMismatch { stream, .. }
            | ReassemblyError::OrderingViolation { stream, .. }
            | ReassemblyError::UnboundedPending { stream, .. }
            | ReassemblyError::UnknownStream { stream }
            | ReassemblyError::StaleHandle { stream, .. }
            | ReassemblyError::OffsetOverflow { stream, .. }
            | ReassemblyError::AttachBelowCursor { stream, .. } => *stream,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
