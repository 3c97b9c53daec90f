//! HTTP/1 request-head decoding built on `httparse`.
//!
//! Malformed input does not abort the pipeline: the decoder emits a message
//! with the fault attached so later stages can forward it in order.

use bytes::{Buf, Bytes, BytesMut};

use crate::message::{Headers, HttpMessage, RequestLine};
use crate::Error;

const MAX_HEADERS: usize = 128;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Outcome of a single decode attempt over the buffered bytes.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes for a full request head (or declared body).
    Incomplete,
    /// A complete message; the consumed bytes were drained from the buffer.
    Message(HttpMessage),
}

/// Tries to decode one request from `buf`.
///
/// On a parse error the offending bytes are discarded and the returned
/// message carries the fault.
pub fn decode_request(buf: &mut BytesMut) -> Decoded {
    if buf.is_empty() {
        return Decoded::Incomplete;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                buf.clear();
                return Decoded::Message(HttpMessage::faulty(Error::MalformedHeader(
                    "request head exceeds maximum size".to_string(),
                )));
            }
            return Decoded::Incomplete;
        }
        Err(e) => {
            buf.clear();
            return Decoded::Message(HttpMessage::faulty(Error::MalformedHeader(e.to_string())));
        }
    };

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    let version = match req.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let mut message = HttpMessage::new(RequestLine {
        method,
        target,
        version: version.to_string(),
    });
    let mut parsed_headers = Headers::new();
    let mut bad_header = None;
    for h in req.headers.iter() {
        match std::str::from_utf8(h.value) {
            Ok(value) => parsed_headers.add(h.name, value.trim()),
            Err(_) => {
                bad_header = Some(h.name.to_string());
                break;
            }
        }
    }
    if let Some(name) = bad_header {
        buf.clear();
        return Decoded::Message(HttpMessage::faulty(Error::MalformedHeader(format!(
            "header {name} has non-UTF-8 value"
        ))));
    }
    message.headers = parsed_headers;

    let body_len = match content_length(&message) {
        Ok(len) => len,
        Err(fault) => {
            buf.clear();
            return Decoded::Message(HttpMessage::faulty(fault));
        }
    };
    if buf.len() < head_len + body_len {
        return Decoded::Incomplete;
    }

    buf.advance(head_len);
    message.body = if body_len > 0 {
        buf.split_to(body_len).freeze()
    } else {
        Bytes::new()
    };

    Decoded::Message(message)
}

fn content_length(message: &HttpMessage) -> Result<usize, Error> {
    match message.headers.get("Content-Length") {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::MalformedHeader(format!("invalid Content-Length: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> (Decoded, BytesMut) {
        let mut buf = BytesMut::from(bytes);
        let decoded = decode_request(&mut buf);
        (decoded, buf)
    }

    #[test]
    fn test_decodes_simple_request() {
        let (decoded, rest) = decode(b"GET /path HTTP/1.1\r\nHost: example.org\r\n\r\n");
        match decoded {
            Decoded::Message(msg) => {
                assert!(!msg.has_fault());
                assert_eq!(msg.request_line.method, "GET");
                assert_eq!(msg.request_line.target, "/path");
                assert_eq!(msg.headers.get("host"), Some("example.org"));
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decodes_request_with_body() {
        let (decoded, rest) = decode(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        match decoded {
            Decoded::Message(msg) => {
                assert_eq!(&msg.body[..], b"hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn test_waits_for_partial_head() {
        let (decoded, rest) = decode(b"GET / HTTP/1.1\r\nHost: exa");
        assert!(matches!(decoded, Decoded::Incomplete));
        assert!(!rest.is_empty());
    }

    #[test]
    fn test_waits_for_declared_body() {
        let (decoded, _) = decode(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhel");
        assert!(matches!(decoded, Decoded::Incomplete));
    }

    #[test]
    fn test_malformed_request_line_attaches_fault() {
        let (decoded, _) = decode(b"Malformed\rRequest HTTP/1.1\r\n\r\n");
        match decoded {
            Decoded::Message(msg) => {
                assert!(matches!(msg.fault, Some(Error::MalformedHeader(_))));
            }
            other => panic!("expected faulty message, got {other:?}"),
        }
    }

    #[test]
    fn test_non_utf8_header_value_attaches_fault() {
        let (decoded, rest) = decode(b"GET / HTTP/1.1\r\nX-Blob: \xff\xfe\r\n\r\n");
        match decoded {
            Decoded::Message(msg) => {
                assert!(matches!(msg.fault, Some(Error::MalformedHeader(_))));
            }
            other => panic!("expected faulty message, got {other:?}"),
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn test_invalid_content_length_attaches_fault() {
        let (decoded, _) = decode(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n");
        match decoded {
            Decoded::Message(msg) => {
                assert!(matches!(msg.fault, Some(Error::MalformedHeader(_))));
            }
            other => panic!("expected faulty message, got {other:?}"),
        }
    }

    #[test]
    fn test_decodes_connect_request() {
        let (decoded, _) = decode(b"CONNECT example.org:443 HTTP/1.1\r\n\r\n");
        match decoded {
            Decoded::Message(msg) => {
                assert!(msg.request_line.is_connect());
                assert_eq!(msg.request_line.target, "example.org:443");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }
}
