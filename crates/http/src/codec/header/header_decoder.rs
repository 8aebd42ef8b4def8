//! HTTP header decoder implementation for parsing HTTP request headers
//!
//! This module decodes the request line and header block from raw bytes into a
//! [`RequestHeader`] and resolves, exactly once, how the body that follows is framed.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header size: 8KB
//! - Only HTTP/1.0 and HTTP/1.1
//!
//! # Body length resolution
//!
//! Evaluated in this order, any violation is a [`ParseError`]:
//!
//! 1. `Content-Length` together with `Transfer-Encoding` is rejected outright
//! 2. `Transfer-Encoding` must be exactly `chunked`
//! 3. `Content-Length` must be a plain decimal, repeated occurrences must be identical
//! 4. otherwise there is no body
//!
//! The implementation records the byte ranges of header names and values and
//! slices them out of the frozen header block, so no header byte is copied.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;

use crate::protocol::{ParseError, PayloadSize, RequestHeader, RequestTarget};

/// Maximum number of headers allowed in a request
pub(crate) const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decoder for HTTP request headers implementing the [`Decoder`] trait.
///
/// This decoder parses raw bytes into a structured [`RequestHeader`] and determines the
/// [`PayloadSize`] based on the Content-Length and Transfer-Encoding headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    /// Attempts to decode HTTP headers from the provided bytes buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((header, payload_size)))` if a complete header was successfully parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if parsing failed or the body framing is ambiguous
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let parsed_result = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            Error::Version => ParseError::InvalidVersion(None),
            e => ParseError::invalid_header(e),
        });

        match parsed_result? {
            Status::Complete(body_offset) => {
                trace!(header_size = body_offset, "parsed request header");
                ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

                let header_count = req.headers.len();

                // Calculate and record byte range indices for each header
                let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
                HeaderIndex::record(src, req.headers, &mut header_index);

                let version = match req.version {
                    Some(0) => http::Version::HTTP_10,
                    Some(1) => http::Version::HTTP_11,
                    v => return Err(ParseError::InvalidVersion(v)),
                };

                let method = req.method.ok_or(ParseError::InvalidMethod)?;
                let method = Method::from_bytes(method.as_bytes()).map_err(|_e| ParseError::InvalidMethod)?;

                let path = req.path.ok_or_else(|| ParseError::invalid_target("missing request target"))?;
                let uri = Uri::try_from(path).map_err(ParseError::invalid_target)?;
                RequestTarget::of(&uri).validate(&method)?;

                let mut header_builder = Request::builder().method(method).uri(uri).version(version);

                let headers = header_builder.headers_mut().ok_or_else(|| ParseError::invalid_header("request builder rejected the request line"))?;
                headers.reserve(header_count);

                // Split header portion from source buffer
                let header_bytes = src.split_to(body_offset).freeze();
                for index in &header_index[..header_count] {
                    let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
                    let value = header_value(header_bytes.slice(index.value.0..index.value.1))?;
                    headers.append(name, value);
                }

                let payload_size = parse_payload(headers)?;
                let header = RequestHeader::from(header_builder.body(()).map_err(ParseError::invalid_header)?);

                Ok(Some((header, payload_size)))
            }
            // If parsing incomplete, ensure current buffer size does not exceed limit
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                Ok(None)
            }
        }
    }
}

/// Builds a header value that keeps obs-text and embedded tabs intact.
fn header_value(bytes: Bytes) -> Result<HeaderValue, ParseError> {
    HeaderValue::from_maybe_shared(bytes).map_err(ParseError::invalid_header)
}

/// Stores the byte range positions of a header's name and value within the original buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    /// Start and end byte positions of the header name
    name: (usize, usize),
    /// Start and end byte positions of the header value
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    /// Records the byte positions of header names and values from the parsed headers.
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Determines how the request body is framed, refer to
/// <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>.
///
/// The length is resolved for every method: a `GET` that declares a body still
/// has that body framed and drained.
pub(crate) fn parse_payload(headers: &HeaderMap) -> Result<PayloadSize, ParseError> {
    let has_te = headers.contains_key(TRANSFER_ENCODING);
    let has_cl = headers.contains_key(CONTENT_LENGTH);

    match (has_te, has_cl) {
        (false, false) => Ok(PayloadSize::Empty),
        (true, true) => Err(ParseError::invalid_transfer_encoding("transfer-encoding and content-length both present in headers")),
        (true, false) => parse_transfer_encoding(headers),
        (false, true) => parse_content_length(headers).map(PayloadSize::Length),
    }
}

/// Only a bare `chunked` coding is accepted; every occurrence must say the same.
fn parse_transfer_encoding(headers: &HeaderMap) -> Result<PayloadSize, ParseError> {
    const CHUNKED: &[u8] = b"chunked";

    for value in headers.get_all(TRANSFER_ENCODING) {
        let coding = value.as_bytes().trim_ascii();
        ensure!(
            coding.eq_ignore_ascii_case(CHUNKED),
            ParseError::invalid_transfer_encoding(format!("unsupported transfer coding {:?}", String::from_utf8_lossy(coding)))
        );
    }

    Ok(PayloadSize::Chunked)
}

/// Repeated occurrences must be character-for-character identical.
fn parse_content_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let first = values.next().ok_or_else(|| ParseError::invalid_content_length("missing value"))?;

    for other in values {
        ensure!(other.as_bytes() == first.as_bytes(), ParseError::invalid_content_length("conflicting content-length values"));
    }

    let digits = first.as_bytes().trim_ascii();
    ensure!(!digits.is_empty(), ParseError::invalid_content_length("empty value"));
    ensure!(digits.iter().all(u8::is_ascii_digit), ParseError::invalid_content_length("value is not a plain decimal"));

    // only ascii digits remain, so the conversion can't fail
    let digits = std::str::from_utf8(digits).map_err(ParseError::invalid_content_length)?;
    digits.parse::<u64>().map_err(|_e| ParseError::invalid_content_length(format!("value {digits} is not u64")))
}
