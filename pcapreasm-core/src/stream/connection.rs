use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{Direction, SegmentInput, Teardown};

/// Normalized connection key (lower IP/port first for consistent lookup).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionKey {
    ip_a: IpAddr,
    port_a: u16,
    ip_b: IpAddr,
    port_b: u16,
}

impl ConnectionKey {
    /// Create a normalized connection key.
    /// Ensures (ip_a, port_a) <= (ip_b, port_b) lexicographically.
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        if (src_ip, src_port) <= (dst_ip, dst_port) {
            Self {
                ip_a: src_ip,
                port_a: src_port,
                ip_b: dst_ip,
                port_b: dst_port,
            }
        } else {
            Self {
                ip_a: dst_ip,
                port_a: dst_port,
                ip_b: src_ip,
                port_b: src_port,
            }
        }
    }

    /// Lower endpoint.
    pub fn endpoint_a(&self) -> (IpAddr, u16) {
        (self.ip_a, self.port_a)
    }

    /// Higher endpoint.
    pub fn endpoint_b(&self) -> (IpAddr, u16) {
        (self.ip_b, self.port_b)
    }

    /// Whether either endpoint uses `port`.
    pub fn has_port(&self, port: u16) -> bool {
        self.port_a == port || self.port_b == port
    }

    /// Determine direction based on who sent this packet, assuming A is the client.
    pub fn direction(&self, src_ip: IpAddr, src_port: u16) -> Direction {
        if src_ip == self.ip_a && src_port == self.port_a {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}<->{}:{}",
            self.ip_a, self.port_a, self.ip_b, self.port_b
        )
    }
}

/// Identity of one root byte stream: an endpoint pair, a direction and a
/// transport channel (0 for TCP; e.g. the crypto level for QUIC).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct StreamKey {
    pub connection: ConnectionKey,
    pub direction: Direction,
    pub channel: u64,
}

impl StreamKey {
    pub fn new(connection: ConnectionKey, direction: Direction) -> Self {
        Self {
            connection,
            direction,
            channel: 0,
        }
    }

    /// Address a secondary byte stream of the same endpoint pair.
    pub fn with_channel(mut self, channel: u64) -> Self {
        self.channel = channel;
        self
    }

    /// The key of the opposite direction.
    pub fn reverse(&self) -> Self {
        Self {
            direction: self.direction.reverse(),
            ..*self
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.connection, self.direction.as_str())?;
        if self.channel != 0 {
            write!(f, " ch{}", self.channel)?;
        }
        Ok(())
    }
}

/// TCP flags relevant to stream boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Per-direction mapping from 32-bit sequence numbers to stream offsets.
#[derive(Debug, Clone, Default)]
struct SeqMapper {
    /// Sequence number of stream offset 0.
    base: Option<u32>,
    /// Whether the base came from a SYN (definitive) or the first data segment.
    base_from_syn: bool,
    /// Highest sequence number mapped so far and its offset.
    last_seq: u32,
    last_offset: u64,
}

impl SeqMapper {
    fn set_syn(&mut self, seq: u32) {
        // SYN consumes one sequence number
        let base = seq.wrapping_add(1);
        self.base = Some(base);
        self.base_from_syn = true;
        self.last_seq = base;
        self.last_offset = 0;
    }

    /// Map `seq` to an offset, unwrapping across 2^32 boundaries.
    /// Returns `None` for data that precedes offset 0.
    fn offset(&mut self, seq: u32) -> Option<u64> {
        if self.base.is_none() {
            self.base = Some(seq);
            self.last_seq = seq;
            self.last_offset = 0;
        }

        let delta = seq.wrapping_sub(self.last_seq) as i32 as i64;
        let offset = self.last_offset as i64 + delta;
        if offset < 0 {
            return None;
        }
        if delta > 0 {
            self.last_seq = seq;
            self.last_offset = offset as u64;
        }
        Some(offset as u64)
    }
}

/// A tracked TCP connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    pub key: ConnectionKey,

    /// Which endpoint is the client (sent SYN).
    /// True if ip_a/port_a is client.
    pub client_is_a: bool,

    /// Frame references.
    pub first_frame: u64,
    pub last_frame: u64,

    to_server: SeqMapper,
    to_client: SeqMapper,
}

impl Connection {
    /// Determine direction based on source IP/port.
    /// This correctly accounts for which endpoint is the client.
    pub fn direction(&self, src_ip: IpAddr, src_port: u16) -> Direction {
        let (ip_a, port_a) = self.key.endpoint_a();
        let is_from_a = src_ip == ip_a && src_port == port_a;

        if is_from_a == self.client_is_a {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Whether the initial sequence number of `direction` came from a SYN.
    pub fn saw_syn(&self, direction: Direction) -> bool {
        self.mapper(direction).base_from_syn
    }

    fn mapper(&self, direction: Direction) -> &SeqMapper {
        match direction {
            Direction::ToServer => &self.to_server,
            Direction::ToClient => &self.to_client,
        }
    }

    fn mapper_mut(&mut self, direction: Direction) -> &mut SeqMapper {
        match direction {
            Direction::ToServer => &mut self.to_server,
            Direction::ToClient => &mut self.to_client,
        }
    }
}

/// Converts TCP segments into transport-agnostic [`SegmentInput`]s.
///
/// The tracker owns the TCP-specific knowledge the reassembly engine does not
/// have: which endpoint is the client, where each direction's byte 0 is, how
/// 32-bit sequence numbers wrap, and which flags end a stream.
pub struct TcpTracker {
    connections: HashMap<ConnectionKey, Connection>,
    next_id: u64,
}

impl TcpTracker {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Translate one TCP segment.
    ///
    /// A SYN with a new initial sequence number opens the direction it was
    /// sent in, which reopens a key that a previous connection on the same
    /// endpoints closed. Returns `None` when the segment carries nothing for
    /// the engine: a pure ACK, a retransmitted SYN, or data that precedes the
    /// start of a stream picked up mid-capture.
    #[allow(clippy::too_many_arguments)]
    pub fn segment(
        &mut self,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        seq: u32,
        flags: TcpFlags,
        payload: Bytes,
        frame_number: u64,
    ) -> Option<SegmentInput> {
        let key = ConnectionKey::new(src_ip, src_port, dst_ip, dst_port);
        let conn = self.get_or_create(key, src_ip, src_port, flags, frame_number);
        conn.last_frame = frame_number;
        let direction = conn.direction(src_ip, src_port);

        let mut open = false;
        if flags.syn {
            let mapper = conn.mapper_mut(direction);
            open = !mapper.base_from_syn || mapper.base != Some(seq.wrapping_add(1));
            mapper.set_syn(seq);
            trace!(connection = %key, ?direction, seq, open, "initial sequence number");
        }

        let teardown = if flags.rst {
            Some(Teardown::Reset)
        } else if flags.fin {
            Some(Teardown::Fin)
        } else {
            None
        };

        if payload.is_empty() && teardown.is_none() && !open {
            return None;
        }

        let data_seq = if flags.syn { seq.wrapping_add(1) } else { seq };
        let Some(offset) = conn.mapper_mut(direction).offset(data_seq) else {
            debug!(
                connection = %key,
                frame = frame_number,
                seq,
                "segment precedes the start of a mid-stream capture"
            );
            return None;
        };

        Some(SegmentInput {
            key: StreamKey::new(key, direction),
            offset,
            payload,
            open,
            teardown,
        })
    }

    fn get_or_create(
        &mut self,
        key: ConnectionKey,
        src_ip: IpAddr,
        src_port: u16,
        flags: TcpFlags,
        frame_number: u64,
    ) -> &mut Connection {
        let next_id = &mut self.next_id;
        self.connections.entry(key).or_insert_with(|| {
            let (ip_a, port_a) = key.endpoint_a();
            let (_, port_b) = key.endpoint_b();
            let client_is_a = if flags.syn && !flags.ack {
                // This is the SYN - sender is client
                src_ip == ip_a && src_port == port_a
            } else if flags.syn && flags.ack {
                // SYN-ACK - sender is server
                !(src_ip == ip_a && src_port == port_a)
            } else {
                // Mid-stream connection - guess client by port (lower port = server)
                port_a > port_b
            };

            let conn = Connection {
                id: *next_id,
                key,
                client_is_a,
                first_frame: frame_number,
                last_frame: frame_number,
                to_server: SeqMapper::default(),
                to_client: SeqMapper::default(),
            };
            *next_id += 1;
            conn
        })
    }

    /// Get a connection by key.
    pub fn get(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.connections.get(key)
    }
}

impl Default for TcpTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn syn() -> TcpFlags {
        TcpFlags {
            syn: true,
            ..Default::default()
        }
    }

    fn ack() -> TcpFlags {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    // Test 1: Connection key normalization
    #[test]
    fn test_connection_key_normalization() {
        let key1 = ConnectionKey::new(ip(192, 168, 1, 1), 54321, ip(192, 168, 1, 2), 80);
        let key2 = ConnectionKey::new(ip(192, 168, 1, 2), 80, ip(192, 168, 1, 1), 54321);
        assert_eq!(key1, key2);
    }

    // Test 2: SYN sets offset 0 at ISN + 1
    #[test]
    fn test_syn_sets_base() {
        let mut tracker = TcpTracker::new();
        let client = ip(10, 0, 0, 1);
        let server = ip(10, 0, 0, 2);

        let open = tracker
            .segment(client, 40000, server, 80, 1000, syn(), Bytes::new(), 1)
            .unwrap();
        assert!(open.open);
        assert!(open.payload.is_empty());
        assert_eq!(open.offset, 0);

        // Retransmitted SYN opens nothing
        assert!(tracker
            .segment(client, 40000, server, 80, 1000, syn(), Bytes::new(), 2)
            .is_none());

        let seg = tracker
            .segment(client, 40000, server, 80, 1003, ack(), Bytes::from_static(b"x"), 2)
            .unwrap();
        assert_eq!(seg.offset, 2);
        assert!(!seg.open);
        assert_eq!(seg.key.direction, Direction::ToServer);

        let seg = tracker
            .segment(client, 40000, server, 80, 1001, ack(), Bytes::from_static(b"H"), 3)
            .unwrap();
        assert_eq!(seg.offset, 0);
    }

    // Test 3: Mid-stream pickup uses first data segment as offset 0
    #[test]
    fn test_mid_stream_base() {
        let mut tracker = TcpTracker::new();
        let seg = tracker
            .segment(
                ip(10, 0, 0, 2),
                443,
                ip(10, 0, 0, 1),
                50000,
                7777,
                ack(),
                Bytes::from_static(b"abc"),
                1,
            )
            .unwrap();
        assert_eq!(seg.offset, 0);
        // Port heuristic: 443 is the server, so this flows to the client
        assert_eq!(seg.key.direction, Direction::ToClient);

        // Data before the picked-up start cannot be placed
        let early = tracker.segment(
            ip(10, 0, 0, 2),
            443,
            ip(10, 0, 0, 1),
            50000,
            7000,
            ack(),
            Bytes::from_static(b"zzz"),
            2,
        );
        assert!(early.is_none());
    }

    // Test 4: Sequence number wraparound
    #[test]
    fn test_sequence_wraparound() {
        let mut tracker = TcpTracker::new();
        let near_max = u32::MAX - 2;
        let a = ip(10, 0, 0, 1);
        let b = ip(10, 0, 0, 2);

        let first = tracker
            .segment(a, 5000, b, 80, near_max, ack(), Bytes::from_static(b"ABC"), 1)
            .unwrap();
        let second = tracker
            .segment(
                a,
                5000,
                b,
                80,
                near_max.wrapping_add(3),
                ack(),
                Bytes::from_static(b"DEF"),
                2,
            )
            .unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 3);
    }

    // Test 5: FIN and RST become teardown markers
    #[test]
    fn test_fin_and_rst() {
        let mut tracker = TcpTracker::new();
        let a = ip(10, 0, 0, 1);
        let b = ip(10, 0, 0, 2);
        tracker.segment(a, 5000, b, 80, 100, syn(), Bytes::new(), 1);

        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        let seg = tracker
            .segment(a, 5000, b, 80, 101, fin, Bytes::new(), 2)
            .unwrap();
        assert_eq!(seg.teardown, Some(Teardown::Fin));
        assert!(seg.payload.is_empty());

        let rst = TcpFlags {
            rst: true,
            ..Default::default()
        };
        let seg = tracker
            .segment(b, 80, a, 5000, 9000, rst, Bytes::new(), 3)
            .unwrap();
        assert_eq!(seg.teardown, Some(Teardown::Reset));
        assert_eq!(seg.key.direction, Direction::ToClient);
    }

    // Test 6: Stream keys per direction share the connection
    #[test]
    fn test_stream_key_reverse() {
        let conn = ConnectionKey::new(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 80);
        let key = StreamKey::new(conn, Direction::ToServer).with_channel(2);
        let rev = key.reverse();
        assert_eq!(rev.direction, Direction::ToClient);
        assert_eq!(rev.channel, 2);
        assert_eq!(rev.connection, key.connection);
    }

    // Test 7: SYN-ACK seen first identifies the server
    #[test]
    fn test_syn_ack_identifies_server() {
        let mut tracker = TcpTracker::new();
        let syn_ack = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        tracker.segment(ip(10, 0, 0, 9), 8080, ip(10, 0, 0, 1), 40000, 50, syn_ack, Bytes::new(), 1);
        let key = ConnectionKey::new(ip(10, 0, 0, 9), 8080, ip(10, 0, 0, 1), 40000);
        let conn = tracker.get(&key).unwrap();
        assert_eq!(conn.direction(ip(10, 0, 0, 9), 8080), Direction::ToClient);
        assert!(conn.saw_syn(Direction::ToClient));
    }

    // Test 8: A SYN with a new ISN restarts the direction at offset 0
    #[test]
    fn test_new_syn_reopens() {
        let mut tracker = TcpTracker::new();
        let a = ip(10, 0, 0, 1);
        let b = ip(10, 0, 0, 2);
        tracker.segment(a, 5000, b, 80, 100, syn(), Bytes::new(), 1);
        let before = tracker
            .segment(a, 5000, b, 80, 106, ack(), Bytes::from_static(b"x"), 2)
            .unwrap();
        assert_eq!(before.offset, 5);

        let open = tracker
            .segment(a, 5000, b, 80, 5000, syn(), Bytes::new(), 3)
            .unwrap();
        assert!(open.open);
        assert_eq!(open.key, before.key);

        let after = tracker
            .segment(a, 5000, b, 80, 5001, ack(), Bytes::from_static(b"y"), 4)
            .unwrap();
        assert_eq!(after.offset, 0);
    }
}
