//! HTTP body handling module for processing request and response payloads
//!
//! Request bodies are decoded and response bodies encoded with one of three
//! framings: chunked transfer coding, a fixed `Content-Length`, or no body.
//!
//! ## Decoders
//! - [`PayloadDecoder`]: dispatches to the chunked or length decoder, validates trailers
//!
//! ## Encoders
//! - [`PayloadEncoder`]: dispatches to the chunked or length encoder, keeps the
//!   byte count exact

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
