use std::ops::Range;

use bytes::Bytes;

use super::{LayerContext, Pdu};

/// Where the next PDU boundary lies in the bytes available on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// The next PDU is `len` bytes long (may exceed what is available).
    Pdu { len: usize },

    /// Not enough bytes to find a boundary.
    NeedMore {
        /// Total bytes needed before framing can be retried, if known.
        minimum_bytes: Option<usize>,
    },

    /// The stream switches protocol after `consumed` bytes; the rest belongs
    /// to a child stream of `kind`.
    Upgrade { kind: &'static str, consumed: usize },

    /// The bytes don't belong to this protocol.
    NotThisProtocol,

    /// Parse error.
    Error {
        message: String,
        /// Bytes to skip for recovery; `None` stops parsing the stream.
        skip_bytes: Option<usize>,
    },
}

/// What to do with a completed PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduAction {
    /// Hand the PDU to the caller; this layer is its terminal consumer.
    Deliver,

    /// Feed `range` of the PDU to the child stream `(kind, channel)`.
    Forward {
        kind: &'static str,
        channel: u64,
        range: Range<usize>,
    },

    /// Feed transformed bytes (decrypted, decompressed) to the child stream
    /// `(kind, channel)`.
    Inject {
        kind: &'static str,
        channel: u64,
        data: Bytes,
    },

    /// Consume the PDU without output.
    Discard,
}

/// Finds PDU boundaries on one stream instance.
///
/// One parser is created per stream, so it may keep per-stream state such
/// as "the preface has been seen".
pub trait LayerParser: Send {
    /// Layer kind (e.g., "http", "tls").
    fn name(&self) -> &'static str;

    /// Locate the next PDU boundary in `data`, the contiguous bytes from the
    /// start of the next PDU.
    ///
    /// Called again whenever more bytes arrive while a PDU is open.
    fn frame(&mut self, data: &[u8], context: &LayerContext) -> Framing;

    /// Decide what happens to a completed PDU.
    fn on_pdu(&mut self, pdu: &Pdu, context: &LayerContext) -> Vec<PduAction> {
        let _ = (pdu, context);
        vec![PduAction::Deliver]
    }
}

/// Creates parsers for one layer kind.
pub trait LayerFactory: Send + Sync {
    /// Layer kind this factory creates parsers for.
    fn kind(&self) -> &'static str;

    /// Human-readable name.
    fn display_name(&self) -> &'static str {
        self.kind()
    }

    /// Whether a new root stream should be parsed by this layer.
    ///
    /// Child streams are created by kind and never consult this.
    fn matches(&self, context: &LayerContext) -> bool {
        let _ = context;
        false
    }

    /// Create a parser for a new stream.
    fn create(&self, context: &LayerContext) -> Box<dyn LayerParser>;
}
