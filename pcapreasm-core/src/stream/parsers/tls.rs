use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::length_prefixed;
use crate::stream::{Framing, LayerContext, LayerFactory, LayerParser, Pdu, PduAction};

/// TLS content types.
pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
    pub const HEARTBEAT: u8 = 24;
}

/// TLS record header size.
const RECORD_HEADER_LEN: usize = 5;

/// Largest ciphertext a record may carry (2^14 + 2048).
const MAX_RECORD_LEN: usize = 18432;

/// One TLS record handed to a [`RecordDecryptor`].
#[derive(Debug, Clone, Copy)]
pub struct TlsRecord<'a> {
    pub content_type: u8,
    pub version: u16,
    /// Record payload without the 5-byte header.
    pub payload: &'a [u8],
    /// Index among the application-data records of this stream direction.
    pub sequence: u64,
}

/// External key material for application-data records.
pub trait RecordDecryptor: Send + Sync {
    /// Plaintext of `record`, or `None` when it cannot be decrypted.
    fn decrypt(&self, context: &LayerContext, record: &TlsRecord<'_>) -> Option<Bytes>;
}

/// Parse a TLS record header.
fn parse_record_header(data: &[u8]) -> Option<(u8, u16, u16)> {
    if data.len() < RECORD_HEADER_LEN {
        return None;
    }
    let content_type = data[0];
    let version = u16::from_be_bytes([data[1], data[2]]);
    let length = u16::from_be_bytes([data[3], data[4]]);
    Some((content_type, version, length))
}

/// TLS record framer.
pub struct TlsFramer {
    decryptor: Option<Arc<dyn RecordDecryptor>>,
    inner_kind: &'static str,
    app_records: u64,
}

impl TlsFramer {
    pub fn new(decryptor: Option<Arc<dyn RecordDecryptor>>, inner_kind: &'static str) -> Self {
        Self {
            decryptor,
            inner_kind,
            app_records: 0,
        }
    }
}

impl LayerParser for TlsFramer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn frame(&mut self, data: &[u8], context: &LayerContext) -> Framing {
        // Garbage before any record means this was never TLS.
        if context.pdus_parsed == 0 && !data.is_empty() {
            let known = (content_type::CHANGE_CIPHER_SPEC..=content_type::HEARTBEAT).contains(&data[0]);
            if !known || (data.len() > 1 && data[1] != 3) {
                return Framing::NotThisProtocol;
            }
        }

        length_prefixed(data, RECORD_HEADER_LEN, |header| {
            let Some((kind, version, length)) = parse_record_header(header) else {
                return Err("short TLS record header".to_string());
            };
            if !(content_type::CHANGE_CIPHER_SPEC..=content_type::HEARTBEAT).contains(&kind) {
                return Err(format!("unknown TLS content type {kind}"));
            }
            if version >> 8 != 3 {
                return Err(format!("unsupported TLS version 0x{version:04x}"));
            }
            let length = length as usize;
            if length > MAX_RECORD_LEN {
                return Err(format!("TLS record length {length} exceeds maximum"));
            }
            Ok(length)
        })
    }

    fn on_pdu(&mut self, pdu: &Pdu, context: &LayerContext) -> Vec<PduAction> {
        let Some((kind, version, _)) = parse_record_header(&pdu.bytes) else {
            return vec![PduAction::Deliver];
        };
        if kind != content_type::APPLICATION_DATA {
            return vec![PduAction::Deliver];
        }
        let Some(decryptor) = &self.decryptor else {
            return vec![PduAction::Deliver];
        };

        let record = TlsRecord {
            content_type: kind,
            version,
            payload: &pdu.bytes[RECORD_HEADER_LEN..],
            sequence: self.app_records,
        };
        self.app_records += 1;

        match decryptor.decrypt(context, &record) {
            Some(plaintext) => vec![PduAction::Inject {
                kind: self.inner_kind,
                channel: 0,
                data: plaintext,
            }],
            None => {
                trace!(stream = %context.stream, sequence = record.sequence, "record not decrypted");
                vec![PduAction::Deliver]
            }
        }
    }
}

/// Creates [`TlsFramer`]s for streams on port 443.
#[derive(Clone)]
pub struct TlsFactory {
    decryptor: Option<Arc<dyn RecordDecryptor>>,
    inner_kind: &'static str,
}

impl TlsFactory {
    pub fn new() -> Self {
        Self {
            decryptor: None,
            inner_kind: "http2",
        }
    }

    /// Decrypt application data and feed the plaintext to the inner layer.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn RecordDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Layer kind receiving decrypted application data (default `http2`).
    pub fn with_inner_kind(mut self, kind: &'static str) -> Self {
        self.inner_kind = kind;
        self
    }
}

impl Default for TlsFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerFactory for TlsFactory {
    fn kind(&self) -> &'static str {
        "tls"
    }

    fn display_name(&self) -> &'static str {
        "TLS"
    }

    fn matches(&self, context: &LayerContext) -> bool {
        context.is_root() && context.has_port(443)
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(TlsFramer::new(self.decryptor.clone(), self.inner_kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::parsers::test_util::context;
    use crate::stream::{Completeness, Direction, StreamId};
    use smallvec::smallvec;

    /// XORs every payload byte with 0xff.
    struct XorDecryptor;

    impl RecordDecryptor for XorDecryptor {
        fn decrypt(&self, _context: &LayerContext, record: &TlsRecord<'_>) -> Option<Bytes> {
            Some(record.payload.iter().map(|b| b ^ 0xff).collect::<Vec<_>>().into())
        }
    }

    fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![kind, 3, 3];
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn pdu(bytes: Vec<u8>) -> Pdu {
        let ctx = context(443, Direction::ToServer);
        Pdu {
            stream: StreamId(0),
            path: ctx.path,
            kind: "tls",
            start_offset: 0,
            bytes: bytes.into(),
            originating_frames: smallvec![1],
            completing_frame: 1,
            completeness: Completeness::Complete,
            conflict: false,
        }
    }

    // Test 1: TLS record header parsing
    #[test]
    fn test_record_header() {
        let header = parse_record_header(&[22, 3, 3, 0, 5]);
        assert_eq!(header, Some((22, 0x0303, 5)));
        assert_eq!(parse_record_header(&[22, 3]), None);
    }

    // Test 2: Record length comes from the header
    #[test]
    fn test_frame_record() {
        let mut framer = TlsFramer::new(None, "http2");
        let data = record(content_type::HANDSHAKE, &[1, 0, 0, 0]);
        let framing = framer.frame(&data[..7], &context(443, Direction::ToServer));
        assert_eq!(framing, Framing::Pdu { len: 9 });
    }

    // Test 3: Short header waits for five bytes
    #[test]
    fn test_short_header() {
        let mut framer = TlsFramer::new(None, "http2");
        let framing = framer.frame(&[22, 3], &context(443, Direction::ToServer));
        assert_eq!(
            framing,
            Framing::NeedMore {
                minimum_bytes: Some(5)
            }
        );
    }

    // Test 4: Plaintext protocol on port 443 is not TLS
    #[test]
    fn test_not_tls() {
        let mut framer = TlsFramer::new(None, "http2");
        let framing = framer.frame(b"GET / HTTP/1.1\r\n\r\n", &context(443, Direction::ToServer));
        assert_eq!(framing, Framing::NotThisProtocol);
    }

    // Test 5: Bad record mid-stream is an error
    #[test]
    fn test_invalid_record_midstream() {
        let mut framer = TlsFramer::new(None, "http2");
        let mut ctx = context(443, Direction::ToServer);
        ctx.pdus_parsed = 3;
        assert!(matches!(
            framer.frame(&[99, 3, 3, 0, 1, 0], &ctx),
            Framing::Error { skip_bytes: None, .. }
        ));
        assert!(matches!(
            framer.frame(&[23, 3, 3, 0xff, 0xff], &ctx),
            Framing::Error { skip_bytes: None, .. }
        ));
    }

    // Test 6: Decrypted application data goes to the inner layer
    #[test]
    fn test_inject_plaintext() {
        let mut framer = TlsFramer::new(Some(Arc::new(XorDecryptor)), "http2");
        let ctx = context(443, Direction::ToServer);
        let actions = framer.on_pdu(&pdu(record(content_type::APPLICATION_DATA, &[0xfe, 0xfd])), &ctx);
        assert_eq!(
            actions,
            vec![PduAction::Inject {
                kind: "http2",
                channel: 0,
                data: Bytes::from_static(&[0x01, 0x02]),
            }]
        );
        assert_eq!(framer.app_records, 1);
    }

    // Test 7: Without a decryptor records are delivered
    #[test]
    fn test_deliver_without_decryptor() {
        let mut framer = TlsFramer::new(None, "http2");
        let ctx = context(443, Direction::ToServer);
        let actions = framer.on_pdu(&pdu(record(content_type::APPLICATION_DATA, &[1])), &ctx);
        assert_eq!(actions, vec![PduAction::Deliver]);

        let mut framer = TlsFramer::new(Some(Arc::new(XorDecryptor)), "http2");
        let actions = framer.on_pdu(&pdu(record(content_type::HANDSHAKE, &[1])), &ctx);
        assert_eq!(actions, vec![PduAction::Deliver]);
    }

    // Test 8: Factory claims port 443
    #[test]
    fn test_factory_matches() {
        let factory = TlsFactory::new();
        assert!(factory.matches(&context(443, Direction::ToServer)));
        assert!(!factory.matches(&context(80, Direction::ToServer)));
    }
}
