//! HTTP connection handling.
//!
//! [`HttpConnection`] drives one transport stream: it decodes requests, runs the
//! handler with a lazily read body, recovers from handler failures through an
//! [`ErrorHook`](crate::handler::ErrorHook), encodes responses and decides
//! between keep-alive and close.
//!
//! Requests on a connection are served one at a time. Pipelined requests wait
//! in the read buffer until the previous response has been written.

mod http_connection;

pub use http_connection::HttpConnection;
