//! HTTP response encoder.
//!
//! Encodes a [`Message::Header`] followed by the payload items of the body.
//! [`ResponseEncoder::set_head_only`] turns the next response into a `HEAD`
//! answer: the header block is written as for `GET`, body items are swallowed.

use crate::codec::body::PayloadEncoder;
use crate::codec::header::{HeaderEncoder, is_chunked};
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError, is_bodiless_status};
use bytes::{Buf, BytesMut};
use http::header::CONTENT_LENGTH;
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
    head_only: bool,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Writes only the header block of the next response.
    pub fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    /// Returns true when a header was written and its body is not finished yet.
    pub fn is_sending_payload(&self) -> bool {
        self.payload_encoder.is_some()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None, head_only: false }
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                let head_only = std::mem::take(&mut self.head_only);
                let payload_encoder = if head_only || is_bodiless_status(head.status()) {
                    PayloadEncoder::empty()
                } else {
                    PayloadEncoder::from_size(payload_size)
                };
                self.payload_encoder = Some(payload_encoder);
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let is_eof = payload_item.is_eof();
                let result = payload_encoder.encode(payload_item, dst);

                if result.is_err() || is_eof {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}

/// Picks the framing of a response body.
///
/// Framing headers set by the handler win: a final `chunked` transfer coding
/// forces chunked framing, a valid `Content-Length` forces a fixed length.
/// Otherwise an exact body size gives a fixed length and anything else is
/// streamed chunked. The length encoder then holds the body to that exact
/// byte count.
pub fn response_payload_size(head: &ResponseHead, exact_size: Option<u64>) -> PayloadSize {
    if is_chunked(head.headers()) {
        return PayloadSize::Chunked;
    }

    let declared = head
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    match (declared, exact_size) {
        (Some(length), _) => PayloadSize::Length(length),
        (None, Some(0)) => PayloadSize::Empty,
        (None, Some(length)) => PayloadSize::Length(length),
        (None, None) => PayloadSize::Chunked,
    }
}
