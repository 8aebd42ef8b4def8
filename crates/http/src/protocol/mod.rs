//! Core HTTP protocol abstractions.
//!
//! This module provides the fundamental building blocks shared by the codec and
//! the connection layer.
//!
//! - **Message Handling** ([`message`]): Core message types and payload processing
//!   - [`Message`]: Represents either headers or payload items
//!   - [`PayloadItem`]: A payload chunk, a trailer block or EOF
//!   - [`PayloadSize`]: The body length mechanism resolved for a message
//!
//! - **Request Processing** ([`request`]): Request header handling
//!   - [`RequestHeader`]: Wraps HTTP request headers with framing queries
//!   - [`RequestTarget`]: The request-target form
//!
//! - **Response Processing** ([`response`]): Response header handling
//!   - [`ResponseHead`]: Type alias for response headers before body attachment
//!
//! - **Body Streaming** ([`body`]): Lazily read request bodies
//!   - [`body::ReqBody`]: Consumer side implementing `http_body::Body`
//!
//! - **Error Handling** ([`error`]):
//!   - [`HttpError`]: Top-level error type
//!   - [`ParseError`]: Request parsing errors
//!   - [`SendError`]: Response sending errors

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;
pub use request::RequestTarget;
pub(crate) use request::has_connection_token;

mod response;
pub use response::ResponseHead;
pub use response::is_bodiless_status;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
