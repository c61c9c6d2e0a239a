//! HTTP/1.x message framing using httparse.
//!
//! Finds message boundaries for keep-alive connections with multiple
//! messages per stream:
//! - Content-Length bodies
//! - Chunked transfer encoding (with extensions and trailers)
//! - Bodyless responses (1xx, 204, 304)
//!
//! A `101 Switching Protocols` to `h2c`, or an HTTP/2 prior-knowledge
//! preface, hands the rest of the stream to the `http2` layer.

use httparse::{Header, Request, Response, Status, EMPTY_HEADER};

use super::http2::CONNECTION_PREFACE;
use crate::stream::{Framing, LayerContext, LayerFactory, LayerParser};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// Common HTTP ports.
const HTTP_PORTS: [u16; 6] = [80, 8080, 8000, 8888, 3000, 5000];

/// Request methods used to tell broken HTTP from other protocols.
const METHOD_PREFIXES: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"HTTP/",
];

/// Result of scanning a chunked body.
#[derive(Debug, PartialEq, Eq)]
enum ChunkedBody {
    /// Body length including the last chunk and trailers.
    Complete(usize),
    Partial,
    Malformed,
}

/// HTTP/1.x framer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFramer;

impl HttpFramer {
    pub fn new() -> Self {
        Self
    }

    fn header_value<'h>(headers: &'h [Header<'_>], name: &str) -> Option<&'h str> {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    }

    fn is_chunked(headers: &[Header<'_>]) -> bool {
        Self::header_value(headers, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Scan a chunked body starting at `data[0]`.
    fn parse_chunked_body(data: &[u8]) -> ChunkedBody {
        let mut pos = 0;

        loop {
            let Some(line_end) = data[pos..]
                .windows(2)
                .position(|w| w == b"\r\n")
                .map(|p| pos + p)
            else {
                return ChunkedBody::Partial;
            };

            let Ok(size_str) = std::str::from_utf8(&data[pos..line_end]) else {
                return ChunkedBody::Malformed;
            };
            // Chunk extensions follow a semicolon
            let size_part = size_str.split(';').next().unwrap_or(size_str);
            let Ok(chunk_size) = usize::from_str_radix(size_part.trim(), 16) else {
                return ChunkedBody::Malformed;
            };

            pos = line_end + 2;

            if chunk_size == 0 {
                if data.len() >= pos + 2 && &data[pos..pos + 2] == b"\r\n" {
                    return ChunkedBody::Complete(pos + 2);
                }
                // Trailers end with an empty line
                return match data[pos..].windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(end) => ChunkedBody::Complete(pos + end + 4),
                    None => ChunkedBody::Partial,
                };
            }

            let Some(chunk_end) = pos.checked_add(chunk_size) else {
                return ChunkedBody::Malformed;
            };
            if data.len() < chunk_end + 2 {
                return ChunkedBody::Partial;
            }
            if &data[chunk_end..chunk_end + 2] != b"\r\n" {
                return ChunkedBody::Malformed;
            }

            pos = chunk_end + 2;
        }
    }

    /// Frame a message whose headers end at `header_len`.
    fn message_framing(
        data: &[u8],
        header_len: usize,
        headers: &[Header<'_>],
        bodyless: bool,
    ) -> Framing {
        if bodyless {
            return Framing::Pdu { len: header_len };
        }

        if Self::is_chunked(headers) {
            return match Self::parse_chunked_body(&data[header_len..]) {
                ChunkedBody::Complete(len) => Framing::Pdu {
                    len: header_len + len,
                },
                ChunkedBody::Partial => Framing::NeedMore {
                    minimum_bytes: None,
                },
                ChunkedBody::Malformed => Framing::Error {
                    message: "malformed chunked body".to_string(),
                    skip_bytes: None,
                },
            };
        }

        match Self::header_value(headers, "content-length") {
            Some(value) => match value.parse::<usize>() {
                Ok(content_length) => Framing::Pdu {
                    len: header_len + content_length,
                },
                Err(_) => Framing::Error {
                    message: format!("invalid Content-Length: {value}"),
                    skip_bytes: None,
                },
            },
            // Close-delimited bodies are not framed; the message ends
            // with its headers.
            None => Framing::Pdu { len: header_len },
        }
    }

    fn looks_like_http(data: &[u8]) -> bool {
        METHOD_PREFIXES.iter().any(|prefix| data.starts_with(prefix))
    }
}

impl LayerParser for HttpFramer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn frame(&mut self, data: &[u8], _context: &LayerContext) -> Framing {
        if data.starts_with(CONNECTION_PREFACE) {
            return Framing::Upgrade {
                kind: "http2",
                consumed: 0,
            };
        }
        if data.len() < CONNECTION_PREFACE.len() && CONNECTION_PREFACE.starts_with(data) {
            return Framing::NeedMore {
                minimum_bytes: Some(CONNECTION_PREFACE.len()),
            };
        }

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut req = Request::new(&mut headers);
        match req.parse(data) {
            Ok(Status::Complete(header_len)) => {
                return Self::message_framing(data, header_len, req.headers, false);
            }
            Ok(Status::Partial) => {
                return Framing::NeedMore {
                    minimum_bytes: None,
                };
            }
            Err(_) => {}
        }

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut resp = Response::new(&mut headers);
        match resp.parse(data) {
            Ok(Status::Complete(header_len)) => {
                let code = resp.code.unwrap_or(0);
                let upgrade = Self::header_value(resp.headers, "upgrade");
                if code == 101 && upgrade.is_some_and(|v| v.eq_ignore_ascii_case("h2c")) {
                    return Framing::Upgrade {
                        kind: "http2",
                        consumed: header_len,
                    };
                }
                let bodyless = (100..200).contains(&code) || code == 204 || code == 304;
                Self::message_framing(data, header_len, resp.headers, bodyless)
            }
            Ok(Status::Partial) => Framing::NeedMore {
                minimum_bytes: None,
            },
            Err(e) if Self::looks_like_http(data) => Framing::Error {
                message: format!("malformed HTTP message: {e}"),
                skip_bytes: None,
            },
            Err(_) => Framing::NotThisProtocol,
        }
    }
}

/// Creates [`HttpFramer`]s for streams on common HTTP ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFactory;

impl LayerFactory for HttpFactory {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn display_name(&self) -> &'static str {
        "HTTP"
    }

    fn matches(&self, context: &LayerContext) -> bool {
        context.is_root() && HTTP_PORTS.iter().any(|port| context.has_port(*port))
    }

    fn create(&self, _context: &LayerContext) -> Box<dyn LayerParser> {
        Box::new(HttpFramer::new())
    }
}
