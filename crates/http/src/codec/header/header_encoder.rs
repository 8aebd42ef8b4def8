//! HTTP header encoder implementation for serializing HTTP response headers
//!
//! The encoder writes the status line and the header block. It owns the
//! framing headers: `Content-Length` and `Transfer-Encoding` on the wire always
//! agree with the [`PayloadSize`] the body will be written with, and statuses
//! that can't carry a body never get either.

use crate::protocol::{PayloadSize, ResponseHead, SendError, is_bodiless_status};

use bytes::{BufMut, BytesMut};

use http::{HeaderMap, HeaderValue, header};
use std::io;
use std::io::Write;
use tokio_util::codec::Encoder;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

const CHUNKED: HeaderValue = HeaderValue::from_static("chunked");
const ZERO: HeaderValue = HeaderValue::from_static("0");

/// Encoder for HTTP response headers implementing the [`Encoder`] trait.
///
/// Responses are always written as `HTTP/1.1`, whatever version the request
/// carried.
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;
        let status = head.status();

        dst.reserve(INIT_HEADER_SIZE);
        write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        let headers = head.headers_mut();
        if is_bodiless_status(status) {
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::TRANSFER_ENCODING);
        } else {
            match payload_size {
                PayloadSize::Length(n) => {
                    headers.remove(header::TRANSFER_ENCODING);
                    headers.insert(header::CONTENT_LENGTH, n.into());
                }
                PayloadSize::Chunked => {
                    headers.remove(header::CONTENT_LENGTH);
                    if !is_chunked(headers) {
                        headers.insert(header::TRANSFER_ENCODING, CHUNKED);
                    }
                }
                PayloadSize::Empty => {
                    headers.remove(header::TRANSFER_ENCODING);
                    headers.insert(header::CONTENT_LENGTH, ZERO);
                }
            }
        }

        for (header_name, header_value) in head.headers().iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Returns true when the last transfer coding of the header set is `chunked`.
pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .next_back()
        .and_then(|value| value.as_bytes().rsplit(|b| *b == b',').next())
        .is_some_and(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

/// Writes formatted text straight into the reserved buffer.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode};

    fn encode(head: ResponseHead, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn length_replaces_handler_framing() {
        let head = Response::builder()
            .header("content-type", "text/plain")
            .header("transfer-encoding", "chunked")
            .header("content-length", "3")
            .body(())
            .unwrap();

        let raw = encode(head, PayloadSize::Length(60));
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("content-length: 60\r\n"));
        assert!(!raw.contains("transfer-encoding"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunked_and_empty() {
        let raw = encode(Response::new(()), PayloadSize::Chunked);
        assert!(raw.contains("transfer-encoding: chunked\r\n"));
        assert!(!raw.contains("content-length"));

        let raw = encode(Response::new(()), PayloadSize::Empty);
        assert!(raw.contains("content-length: 0\r\n"));
    }

    #[test]
    fn bodiless_status_has_no_framing_headers() {
        for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
            let head = Response::builder().status(status).header("content-length", "10").body(()).unwrap();
            let raw = encode(head, PayloadSize::Length(10));
            assert!(!raw.contains("content-length"), "{status}");
            assert!(!raw.contains("transfer-encoding"), "{status}");
        }
    }

    #[test]
    fn unknown_status_has_empty_reason() {
        let head = Response::builder().status(599).body(()).unwrap();
        assert!(encode(head, PayloadSize::Empty).starts_with("HTTP/1.1 599 \r\n"));
    }

    #[test]
    fn chunked_detection_uses_last_coding() {
        let mut headers = HeaderMap::new();
        assert!(!is_chunked(&headers));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("gzip, Chunked"));
        assert!(is_chunked(&headers));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked, gzip"));
        assert!(!is_chunked(&headers));
    }
}
