use bytes::{Buf, Bytes};
use http::HeaderMap;

/// One unit of a framed message stream: the head, then payload items.
///
/// `T` is the head type, `(RequestHeader, PayloadSize)` when decoding and
/// `(ResponseHead, PayloadSize)` when encoding.
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

/// A piece of a message body.
///
/// A body is a run of chunks, at most one trailer block (chunked framing only),
/// then exactly one `Eof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    /// trailer fields, already checked against the `Trailer` declaration
    Trailers(HeaderMap),
    Eof,
}

/// How the length of a body is determined on the wire.
///
/// Resolved once per message, before any body byte is read or written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// exactly this many bytes, announced by `Content-Length`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// no body at all
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }

    /// Whether any body bytes follow the head; `Content-Length: 0` carries none.
    #[inline]
    pub fn has_body(&self) -> bool {
        !matches!(self, PayloadSize::Empty | PayloadSize::Length(0))
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Trailers(_) | PayloadItem::Eof => None,
        }
    }

    pub fn as_trailers(&self) -> Option<&HeaderMap> {
        match self {
            PayloadItem::Trailers(trailers) => Some(trailers),
            PayloadItem::Chunk(_) | PayloadItem::Eof => None,
        }
    }
}
