//! HTTP header processing for requests and responses.
//!
//! - [`HeaderDecoder`]: parses the request line and header block, resolves the
//!   body framing and rejects ambiguous framing
//! - [`HeaderEncoder`]: writes the status line and headers, keeping the framing
//!   headers consistent with the body
//!
//! Request headers are limited to [`MAX_HEADER_NUM`] fields and
//! [`MAX_HEADER_BYTES`] bytes. The same limits apply to chunked trailer blocks.

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub(crate) use header_decoder::{MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use header_encoder::HeaderEncoder;
pub(crate) use header_encoder::is_chunked;
