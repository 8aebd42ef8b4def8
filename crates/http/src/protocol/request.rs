//! HTTP request header handling implementation.
//!
//! This module provides the core abstractions for handling HTTP request headers.
//! It wraps the standard `http::Request` type to provide the framing related
//! queries the connection needs: request-target form, effective request URI,
//! persistence, `Expect` and declared trailer fields.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, COOKIE, EXPECT, HOST, TRAILER, UPGRADE};
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, HeaderName, Method, Request, Uri, Version};

use crate::protocol::ParseError;

/// The four request-target forms of RFC 9112 section 3.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `/path?query`
    Origin,
    /// `http://host/path`, used by proxies
    Absolute,
    /// `host:port`, only valid for `CONNECT`
    Authority,
    /// `*`, only valid for `OPTIONS`
    Asterisk,
}

impl RequestTarget {
    /// Classifies a parsed request-target.
    pub fn of(uri: &Uri) -> Self {
        if uri.scheme().is_some() {
            RequestTarget::Absolute
        } else if uri.authority().is_some() {
            RequestTarget::Authority
        } else if uri.path() == "*" {
            RequestTarget::Asterisk
        } else {
            RequestTarget::Origin
        }
    }

    /// Checks the method/target pairing.
    pub fn validate(self, method: &Method) -> Result<Self, ParseError> {
        match (self, method == Method::CONNECT) {
            (RequestTarget::Authority, true) => Ok(self),
            (RequestTarget::Authority, false) => Err(ParseError::invalid_target("authority-form is only allowed with CONNECT")),
            (_, true) => Err(ParseError::invalid_target("CONNECT requires authority-form")),
            (RequestTarget::Asterisk, false) if method != Method::OPTIONS => {
                Err(ParseError::invalid_target("asterisk-form is only allowed with OPTIONS"))
            }
            _ => Ok(self),
        }
    }
}

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Conversion from different request formats
/// - Body attachment capabilities
/// - Request metadata inspection
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    pub fn target(&self) -> RequestTarget {
        RequestTarget::of(self.uri())
    }

    /// Resolves the effective request URI.
    ///
    /// An absolute-form target wins over the `Host` header; otherwise the URI is
    /// rebuilt from `scheme`, `Host` and the origin-form path.
    pub fn effective_uri(&self, scheme: Scheme) -> Result<Uri, ParseError> {
        if self.target() == RequestTarget::Absolute {
            return Ok(self.uri().clone());
        }

        let host = self.headers().get(HOST).ok_or_else(|| ParseError::invalid_header("missing host header"))?;
        let authority = Authority::try_from(host.as_bytes()).map_err(ParseError::invalid_header)?;

        let mut builder = Uri::builder().scheme(scheme).authority(authority);
        if self.target() == RequestTarget::Origin {
            let path_and_query = self.uri().path_and_query().cloned().unwrap_or_else(|| PathAndQuery::from_static("/"));
            builder = builder.path_and_query(path_and_query);
        } else {
            builder = builder.path_and_query("/");
        }
        builder.build().map_err(ParseError::invalid_target)
    }

    /// Joins every occurrence of `name` in receipt order with `separator`.
    ///
    /// Values are joined as raw bytes so obs-text survives untouched.
    pub fn joined(&self, name: impl http::header::AsHeaderName, separator: &str) -> Option<Bytes> {
        let mut values = self.headers().get_all(name).iter();
        let first = values.next()?;

        let mut buf = BytesMut::from(first.as_bytes());
        for value in values {
            buf.put_slice(separator.as_bytes());
            buf.put_slice(value.as_bytes());
        }
        Some(buf.freeze())
    }

    /// All `cookie` fields joined with `"; "`.
    pub fn cookies(&self) -> Option<Bytes> {
        self.joined(COOKIE, "; ")
    }

    /// Returns true if the connection may carry another request after this one.
    ///
    /// HTTP/1.0 has no default persistence; HTTP/1.1 persists unless the
    /// client sent `Connection: close`.
    pub fn is_persistent(&self) -> bool {
        self.version() == Version::HTTP_11 && !has_connection_token(self.headers(), "close")
    }

    /// Returns true for `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers().get(EXPECT).is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }

    /// Returns true when the client asked for a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.headers().contains_key(UPGRADE) && has_connection_token(self.headers(), "upgrade")
    }

    /// Field names announced by the `Trailer` header, lowercased, in order.
    pub fn declared_trailers(&self) -> Result<Vec<HeaderName>, ParseError> {
        let mut names = Vec::new();
        for value in self.headers().get_all(TRAILER) {
            for token in value.as_bytes().split(|b| *b == b',') {
                let token = token.trim_ascii();
                if token.is_empty() {
                    continue;
                }
                let name = HeaderName::from_bytes(token).map_err(ParseError::invalid_header)?;
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}

/// Returns true if the comma separated `Connection` header contains `token`.
pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .flat_map(|value| value.as_bytes().split(|b| *b == b','))
        .any(|item| item.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
