//! Request handler traits.
//!
//! A [`Handler`] turns a request with a lazily read [`ReqBody`] into a response.
//! When it fails or panics the connection asks an [`ErrorHook`] for a response
//! instead. [`DefaultErrorHook`] answers `400` for request framing failures and
//! `500` for anything else, without echoing the error text.

use std::any::Any;
use std::error::Error;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Body;
use http_body_util::Full;
use thiserror::Error;

use crate::protocol::ParseError;
use crate::protocol::body::ReqBody;

pub type BoxError = Box<dyn Error + Send + Sync>;

#[async_trait]
pub trait Handler: Send + Sync {
    type RespBody: Body + Send;
    type Error: Into<BoxError> + Send;

    async fn call(&self, req: Request<ReqBody>) -> Result<Response<Self::RespBody>, Self::Error>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<RespBody, Err, F, Fut> Handler for HandlerFn<F>
where
    RespBody: Body + Send,
    F: Fn(Request<ReqBody>) -> Fut + Send + Sync,
    Err: Into<BoxError> + Send,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send,
{
    type RespBody = RespBody;
    type Error = Err;

    async fn call(&self, req: Request<ReqBody>) -> Result<Response<Self::RespBody>, Self::Error> {
        (self.f)(req).await
    }
}

pub fn make_handler<F, RespBody, Err, Ret>(f: F) -> HandlerFn<F>
where
    RespBody: Body,
    Err: Into<BoxError>,
    Ret: Future<Output = Result<Response<RespBody>, Err>>,
    F: Fn(Request<ReqBody>) -> Ret,
{
    HandlerFn { f }
}

/// Produces the response sent when a handler fails.
///
/// Returning an error, or panicking, makes the connection fall back to a fixed
/// `500 Internal Server Error`.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(&self, error: &(dyn Error + Send + Sync + 'static)) -> Result<Response<Full<Bytes>>, BoxError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHook;

#[async_trait]
impl ErrorHook for DefaultErrorHook {
    async fn on_error(&self, error: &(dyn Error + Send + Sync + 'static)) -> Result<Response<Full<Bytes>>, BoxError> {
        let status = if is_parse_error(error) { StatusCode::BAD_REQUEST } else { StatusCode::INTERNAL_SERVER_ERROR };
        Ok(status_response(status))
    }
}

/// Looks for a [`ParseError`] anywhere in the source chain.
fn is_parse_error(error: &(dyn Error + Send + Sync + 'static)) -> bool {
    let mut current: Option<&(dyn Error + 'static)> = Some(error as &(dyn Error + 'static));
    while let Some(error) = current {
        if error.is::<ParseError>() {
            return true;
        }
        current = error.source();
    }
    false
}

/// A response with the given status and an empty body.
pub fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// A handler or error hook panicked while producing a response.
#[derive(Debug, Error)]
#[error("handler panicked: {message}")]
pub struct HandlerPanic {
    message: String,
}

impl HandlerPanic {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
