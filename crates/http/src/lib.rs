//! An asynchronous HTTP/1.1 framing engine.
//!
//! This crate turns a byte stream into well-formed requests for an application
//! handler and writes the handler's responses back with correct framing. It is
//! transport agnostic: plain TCP and TLS sessions plug in the same way.
//!
//! # Features
//!
//! - Request line and header parsing with target-form validation
//! - Body length resolution that rejects ambiguous framing (`Content-Length`
//!   together with `Transfer-Encoding`, conflicting lengths, unknown codings)
//! - Chunked request bodies with trailer validation
//! - Lazily read request bodies and on-demand `100 Continue`
//! - Byte-exact `Content-Length` or chunked responses, `HEAD`, `204` and `304`
//! - Keep-alive with draining of unread request bodies
//! - Handler errors and panics turned into responses by an error hook
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response, StatusCode};
//! use http_body_util::{BodyExt, Full};
//! use std::error::Error;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tracing::{error, info, warn};
//! use portico_http::connection::HttpConnection;
//! use portico_http::handler::make_handler;
//! use portico_http::protocol::body::ReqBody;
//!
//! #[tokio::main]
//! async fn main() {
//!     let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
//!         Ok(tcp_listener) => tcp_listener,
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     let handler = Arc::new(make_handler(hello_world));
//!
//!     loop {
//!         let (tcp_stream, _remote_addr) = match tcp_listener.accept().await {
//!             Ok(stream_and_addr) => stream_and_addr,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let handler = handler.clone();
//!         tokio::spawn(async move {
//!             let (reader, writer) = tcp_stream.into_split();
//!             if let Err(e) = HttpConnection::new(reader, writer).process(handler).await {
//!                 info!(cause = %e, "connection closed with error");
//!             }
//!         });
//!     }
//! }
//!
//! async fn hello_world(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, Box<dyn Error + Send + Sync>> {
//!     let body = request.into_body().collect().await?.to_bytes();
//!     info!(size = body.len(), "received request body");
//!
//!     let mut response = Response::new(Full::new(Bytes::from_static(b"Hello World!\r\n")));
//!     *response.status_mut() = StatusCode::OK;
//!     Ok(response)
//! }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: the per-connection request loop
//! - [`protocol`]: request/response types, body streaming and errors
//! - [`codec`]: the wire decoder and encoder
//! - [`handler`]: handler and error hook traits
//!
//! # Limits
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - Maximum header block and trailer block size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
