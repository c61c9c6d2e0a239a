use std::fmt;

use smallvec::SmallVec;

use super::StreamKey;

/// Frame number assigned by the capture layer.
pub type FrameId = u64;

/// Direction of data flow in a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    /// Return a string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }

    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Handle of one stream node in a [`LayerChain`](super::LayerChain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One layer below a root stream: the layer kind and the channel that
/// distinguishes sibling instances (e.g. the HTTP/2 stream id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerStep {
    pub kind: &'static str,
    pub channel: u64,
}

/// Pass-independent name of a stream.
///
/// Stream ids depend on allocation order; paths depend only on what the
/// capture contains, so the two passes of a run can be compared by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPath {
    pub root: StreamKey,
    pub layers: SmallVec<[LayerStep; 4]>,
}

impl StreamPath {
    pub fn root(key: StreamKey) -> Self {
        Self {
            root: key,
            layers: SmallVec::new(),
        }
    }

    pub fn child(&self, kind: &'static str, channel: u64) -> Self {
        let mut layers = self.layers.clone();
        layers.push(LayerStep { kind, channel });
        Self {
            root: self.root,
            layers,
        }
    }

    /// Number of layers above the root stream.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

impl fmt::Display for StreamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for step in &self.layers {
            write!(f, "/{}:{}", step.kind, step.channel)?;
        }
        Ok(())
    }
}

/// Which pass of a run is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Single forward pass; annotations may be completed retroactively.
    Single,
    /// First of two passes; builds the complete annotation log.
    First,
    /// Second of two passes; emits final annotations.
    Second,
}

/// Context handed to layer parsers.
#[derive(Debug, Clone)]
pub struct LayerContext {
    pub stream: StreamId,
    pub path: StreamPath,
    pub direction: Direction,
    /// Frame whose processing triggered this call.
    pub frame: FrameId,
    pub pass: Pass,
    /// Bytes already handed out as PDUs on this stream.
    pub bytes_parsed: u64,
    /// PDUs already completed on this stream.
    pub pdus_parsed: u64,
}

impl LayerContext {
    /// Whether either endpoint of the root connection uses `port`.
    pub fn has_port(&self, port: u16) -> bool {
        self.path.root.connection.has_port(port)
    }

    /// Whether this is a transport-level stream (no layer below it but the capture).
    pub fn is_root(&self) -> bool {
        self.path.depth() == 0
    }
}
