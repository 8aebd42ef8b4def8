//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module provides functionality to decode HTTP messages that use chunked transfer encoding
//! as specified in [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//!
//! The chunked encoding allows the sender to transmit message data in a series of chunks,
//! indicating the size of each chunk before its data. The last chunk may be followed by
//! a trailer block, which is validated against the names the request declared in its
//! `Trailer` header.

use crate::codec::header::MAX_HEADER_BYTES;
use crate::codec::header::MAX_HEADER_NUM;
use crate::protocol::{ParseError, PayloadItem};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRAILER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::task::Poll;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal
/// - Followed by optional extensions and CRLF
/// - Then the chunk data and CRLF
/// - A zero-sized chunk indicates the end of the message, optionally followed by trailers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    trailer_buf: BytesMut,
    declared_trailers: Vec<HeaderName>,
    trailers: Option<HeaderMap>,
}

impl ChunkedDecoder {
    /// Creates a new ChunkedDecoder instance.
    ///
    /// `declared_trailers` are the field names announced by the request's `Trailer`
    /// header; the received trailer block must contain exactly these names.
    pub fn new(declared_trailers: Vec<HeaderName>) -> Self {
        Self { state: SizeStart, remaining_size: 0, trailer_buf: BytesMut::new(), declared_trailers, trailers: None }
    }

    /// Parses the collected trailer block and checks it against the declared names.
    fn finish_trailers(&mut self) -> Result<Option<HeaderMap>, ParseError> {
        if self.trailer_buf.is_empty() {
            ensure_declared_present(&self.declared_trailers, &HeaderMap::new())?;
            return Ok(None);
        }

        self.trailer_buf.put_slice(b"\r\n");
        let block = self.trailer_buf.split().freeze();

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let parsed = httparse::parse_headers(&block, &mut headers).map_err(ParseError::invalid_trailer)?;
        let httparse::Status::Complete((_, parsed)) = parsed else {
            return Err(ParseError::invalid_trailer("incomplete trailer block"));
        };

        let mut trailers = HeaderMap::with_capacity(parsed.len());
        for field in parsed {
            let name = HeaderName::from_bytes(field.name.as_bytes()).map_err(ParseError::invalid_trailer)?;

            if name == TRANSFER_ENCODING || name == CONTENT_LENGTH || name == TRAILER {
                return Err(ParseError::invalid_trailer(format!("{name} is not allowed as a trailer field")));
            }
            if !self.declared_trailers.contains(&name) {
                return Err(ParseError::invalid_trailer(format!("{name} was not declared in the trailer header")));
            }

            let value = HeaderValue::from_bytes(field.value).map_err(ParseError::invalid_trailer)?;
            trailers.append(name, value);
        }

        ensure_declared_present(&self.declared_trailers, &trailers)?;
        trace!(count = trailers.len(), "validated chunked trailers");
        Ok(Some(trailers))
    }
}

fn ensure_declared_present(declared: &[HeaderName], received: &HeaderMap) -> Result<(), ParseError> {
    match declared.iter().find(|name| !received.contains_key(*name)) {
        Some(missing) => Err(ParseError::invalid_trailer(format!("declared trailer {missing} is missing"))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the first hex digit of the chunk size
    SizeStart,
    /// Read the chunk size in hex
    Size,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read chunk data
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Read a trailer field line
    Trailer,
    /// Read LF after a trailer field
    TrailerLf,
    /// Read final CR, or the first byte of a trailer field
    EndCr,
    /// Read final LF
    EndLf,
    /// Final state after reading last chunk
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(PayloadItem::Chunk(bytes)))` when a chunk is successfully decoded
    /// - `Ok(Some(PayloadItem::Trailers(map)))` once, when a valid trailer block was received
    /// - `Ok(Some(PayloadItem::Eof))` when the final chunk is processed
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked encoding or the trailers are invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                if let Some(trailers) = self.trailers.take() {
                    return Ok(Some(PayloadItem::Trailers(trailers)));
                }
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                // need more data
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.state.step(src, &mut self.remaining_size, &mut self.trailer_buf, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(e),
            };

            if self.state == End {
                self.trailers = self.finish_trailers()?;
            }

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

impl ChunkedState {
    /// Processes the next step in the chunked decoding state machine.
    fn step(
        self,
        src: &mut BytesMut,
        remaining_size: &mut u64,
        trailer_buf: &mut BytesMut,
        buf: &mut Option<Bytes>,
    ) -> Poll<Result<ChunkedState, ParseError>> {
        match self {
            SizeStart => ChunkedState::read_size_start(src, remaining_size),
            Size => ChunkedState::read_size(src, remaining_size),
            SizeLws => ChunkedState::read_size_lws(src),
            Extension => ChunkedState::read_extension(src),
            SizeLf => ChunkedState::read_size_lf(src, *remaining_size),
            Body => ChunkedState::read_body(src, remaining_size, buf),
            BodyCr => ChunkedState::read_body_cr(src),
            BodyLf => ChunkedState::read_body_lf(src),
            Trailer => ChunkedState::read_trailer(src, trailer_buf),
            TrailerLf => ChunkedState::read_trailer_lf(src, trailer_buf),
            EndCr => ChunkedState::read_end_cr(src, trailer_buf),
            EndLf => ChunkedState::read_end_lf(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// A chunk size line must start with a hex digit; anything else, a sign
    /// included, can't be parsed as a size.
    fn read_size_start(src: &mut BytesMut, size_per_chunk: &mut u64) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        match hex_value(b) {
            Some(digit) => {
                *size_per_chunk = u64::from(digit);
                Poll::Ready(Ok(Size))
            }
            None => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size line: missing size"))),
        }
    }

    /// Reads and parses the chunk size in hexadecimal format.
    ///
    /// # State Transitions
    /// - On hex digit (0-9, a-f, A-F): Stay in Size state to read more digits
    /// - On whitespace (tab/space): Transition to SizeLws state
    /// - On semicolon: Transition to Extension state to handle chunk extensions
    /// - On CR: Transition to SizeLf state to finish size line
    /// - On invalid character: Return error
    fn read_size(src: &mut BytesMut, size_per_chunk: &mut u64) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        if let Some(digit) = hex_value(b) {
            *size_per_chunk = match size_per_chunk.checked_mul(16).and_then(|size| size.checked_add(u64::from(digit))) {
                Some(size) => size,
                None => return Poll::Ready(Err(ParseError::invalid_chunk("invalid overflow chunked length"))),
            };
            return Poll::Ready(Ok(Size));
        }

        match b {
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size line: Invalid Size"))),
        }
    }

    /// Processes linear whitespace (LWS) after the chunk size.
    ///
    /// State transitions:
    /// - On tab/space: Stay in SizeLws state to handle more whitespace
    /// - On semicolon: Move to Extension state to process chunk extensions
    /// - On CR: Move to SizeLf state to finish size line
    /// - On invalid char: Return error
    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size linear white space"))),
        }
    }

    /// Skips chunk extensions up to the next CRLF.
    ///
    /// Plain LF is rejected inside extensions, so peers that forget the CR
    /// can't smuggle a second size line through.
    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk extension contains newline"))),
            _ => Poll::Ready(Ok(Extension)), // no supported extensions
        }
    }

    /// Validates the LF byte after the chunk size line.
    ///
    /// # State Transitions
    /// - On LF with size 0: Move to EndCr state for trailers or the final CRLF
    /// - On LF with size > 0: Move to Body state to read chunk data
    /// - On any other byte: Return error
    fn read_size_lf(src: &mut BytesMut, size_per_chunk: u64) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' if size_per_chunk == 0 => Poll::Ready(Ok(EndCr)),
            b'\n' => Poll::Ready(Ok(Body)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size LF"))),
        }
    }

    /// Reads the actual chunk data bytes.
    ///
    /// Returns whatever part of the chunk is buffered, so large chunks stream
    /// through without being collected first.
    fn read_body(src: &mut BytesMut, size_per_chunk: &mut u64, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        if src.is_empty() {
            return Poll::Ready(Ok(Body));
        }

        if *size_per_chunk == 0 {
            return Poll::Ready(Ok(BodyCr));
        }

        // cap remaining bytes at the max capacity of usize
        let remaining = usize::try_from(*size_per_chunk).unwrap_or(usize::MAX);
        let read_size = std::cmp::min(remaining, src.len());

        *size_per_chunk -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if *size_per_chunk > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(SizeStart)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body LF"))),
        }
    }

    /// Collects a trailer field line into `trailer_buf`.
    ///
    /// # State Transitions
    /// - On CR: Move to TrailerLf state
    /// - On LF: Return error, trailer lines end with CRLF like size lines do
    /// - On any other byte: Stay in Trailer state
    fn read_trailer(src: &mut BytesMut, trailer_buf: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        if b == b'\n' {
            return Poll::Ready(Err(ParseError::invalid_trailer("trailer line ends with a bare LF")));
        }
        if trailer_buf.len() >= MAX_HEADER_BYTES {
            return Poll::Ready(Err(ParseError::invalid_trailer("trailer block too large")));
        }
        trailer_buf.put_u8(b);
        match b {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            _ => Poll::Ready(Ok(Trailer)),
        }
    }

    fn read_trailer_lf(src: &mut BytesMut, trailer_buf: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => {
                trailer_buf.put_u8(b'\n');
                Poll::Ready(Ok(EndCr))
            }
            _ => Poll::Ready(Err(ParseError::invalid_trailer("invalid trailer end LF"))),
        }
    }

    /// Either the final CR, or the first byte of another trailer field.
    fn read_end_cr(src: &mut BytesMut, trailer_buf: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(EndLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_chunk("last chunk ends with a bare LF"))),
            b => {
                trailer_buf.put_u8(b);
                Poll::Ready(Ok(Trailer))
            }
        }
    }

    fn read_end_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(End)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk end LF"))),
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b + 10 - b'a'),
        b'A'..=b'F' => Some(b + 10 - b'A'),
        _ => None,
    }
}
