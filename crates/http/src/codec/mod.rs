//! HTTP/1.1 wire codec.
//!
//! - [`RequestDecoder`]: decodes a request header, then the payload items of its body
//! - [`ResponseEncoder`]: encodes a response header, then the payload items of its body
//!
//! Both plug into `tokio_util::codec::{FramedRead, FramedWrite}`.
//!
//! ```no_run
//! use portico_http::codec::{RequestDecoder, ResponseEncoder};
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut request_buffer = BytesMut::new();
//! let request = decoder.decode(&mut request_buffer);
//!
//! let mut encoder = ResponseEncoder::new();
//! encoder.set_head_only(true);
//! ```

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::{ResponseEncoder, response_payload_size};
