//! HTTP request decoder module
//!
//! This module decodes HTTP requests as a stream of messages: one
//! [`Message::Header`] followed by the payload items of its body.
//!
//! # Example
//!
//! ```no_run
//! use portico_http::codec::RequestDecoder;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n"[..]);
//! let result = decoder.decode(&mut buffer);
//! ```

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

/// A decoder for HTTP requests that handles both headers and payload
///
/// The decoder maintains its state through the `payload_decoder` field:
/// - `None`: Currently parsing headers
/// - `Some(PayloadDecoder)`: Currently parsing payload, until its `Eof`
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns true while the body of the last decoded header is still being read.
    pub fn is_reading_payload(&self) -> bool {
        self.payload_decoder.is_some()
    }

    fn decode_payload(&mut self, src: &mut BytesMut, at_eof: bool) -> Result<Option<<Self as Decoder>::Item>, ParseError> {
        let Some(payload_decoder) = &mut self.payload_decoder else {
            return Ok(None);
        };

        let item = if at_eof { payload_decoder.decode_eof(src)? } else { payload_decoder.decode(src)? };
        let message = match item {
            Some(item @ PayloadItem::Eof) => {
                // the next bytes belong to the next request
                self.payload_decoder.take();
                Some(Message::Payload(item))
            }
            Some(item) => Some(Message::Payload(item)),
            None => None,
        };

        Ok(message)
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self { header_decoder: HeaderDecoder, payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    /// Attempts to decode an HTTP request from the provided buffer
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Message::Header(_)))`: Successfully decoded request headers
    /// - `Ok(Some(Message::Payload(_)))`: Successfully decoded a payload item
    /// - `Ok(None)`: Need more data to proceed
    /// - `Err(_)`: Encountered a parsing error
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.payload_decoder.is_some() {
            return self.decode_payload(src, false);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                let declared_trailers =
                    if payload_size.is_chunked() { header.declared_trailers()? } else { Vec::new() };
                self.payload_decoder = Some(PayloadDecoder::from_size(payload_size, declared_trailers));
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }

    /// Called once the peer closed its write side.
    ///
    /// A close between requests, even with a partial header buffered, ends the
    /// stream quietly. A close in the middle of a body is an error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.payload_decoder.is_some() {
            return self.decode_payload(src, true);
        }

        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    trace!(buffered = src.len(), "peer closed with a partial request header");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn crlf(raw: &str) -> BytesMut {
        BytesMut::from(raw.replace('\n', "\r\n").as_str())
    }

    #[test]
    fn header_then_payload_then_next_request() {
        let mut buffer = crlf(indoc! {"
            POST /upload HTTP/1.1
            Host: a.example
            Content-Length: 5

            helloGET / HTTP/1.1
            Host: a.example

        "});
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((header, size))) = decoder.decode(&mut buffer).unwrap() else { panic!("expected header") };
        assert_eq!(header.uri().path(), "/upload");
        assert_eq!(size, PayloadSize::Length(5));

        let Some(Message::Payload(chunk)) = decoder.decode(&mut buffer).unwrap() else { panic!("expected chunk") };
        assert_eq!(chunk.as_bytes().unwrap(), &b"hello"[..]);

        let Some(Message::Payload(eof)) = decoder.decode(&mut buffer).unwrap() else { panic!("expected eof") };
        assert!(eof.is_eof());
        assert!(!decoder.is_reading_payload());

        let Some(Message::Header((header, size))) = decoder.decode(&mut buffer).unwrap() else { panic!("expected header") };
        assert_eq!(header.uri().path(), "/");
        assert!(size.is_empty());
    }

    #[test]
    fn chunked_body_with_trailers() {
        let mut buffer = crlf(indoc! {"
            POST / HTTP/1.1
            Host: a.example
            Transfer-Encoding: chunked
            Trailer: x-sum

            3
            abc
            0
            X-Sum: 6

        "});
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buffer).unwrap(), Some(Message::Header(_))));
        let Some(Message::Payload(chunk)) = decoder.decode(&mut buffer).unwrap() else { panic!("expected chunk") };
        assert_eq!(chunk.as_bytes().unwrap(), &b"abc"[..]);
        let Some(Message::Payload(trailers)) = decoder.decode(&mut buffer).unwrap() else { panic!("expected trailers") };
        assert_eq!(trailers.as_trailers().unwrap().get("x-sum").unwrap(), "6");
        let Some(Message::Payload(eof)) = decoder.decode(&mut buffer).unwrap() else { panic!("expected eof") };
        assert!(eof.is_eof());
        assert!(buffer.is_empty());
    }

    #[test]
    fn close_between_requests_is_quiet() {
        let mut decoder = RequestDecoder::new();

        let mut buffer = BytesMut::new();
        assert!(decoder.decode_eof(&mut buffer).unwrap().is_none());

        let mut buffer = BytesMut::from(&b"GET / HT"[..]);
        assert!(decoder.decode_eof(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn close_inside_body_is_an_error() {
        let mut buffer = crlf("POST / HTTP/1.1\nHost: a\nContent-Length: 10\n\n");
        buffer.extend_from_slice(b"abc");
        let mut decoder = RequestDecoder::new();

        assert!(matches!(decoder.decode(&mut buffer).unwrap(), Some(Message::Header(_))));
        assert!(matches!(decoder.decode_eof(&mut buffer).unwrap(), Some(Message::Payload(PayloadItem::Chunk(_)))));
        assert!(decoder.decode_eof(&mut buffer).is_err());
    }
}
