use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use http::header::CONNECTION;
use http::{HeaderValue, Method, Response, StatusCode, Version};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::codec::{RequestDecoder, ResponseEncoder, response_payload_size};
use crate::handler::{BoxError, DefaultErrorHook, ErrorHook, Handler, HandlerPanic, status_response};
use crate::protocol::body::{body_channel, skip_body};
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError, has_connection_token,
    is_bodiless_status,
};

type ResponseMessage<D> = Message<(ResponseHead, PayloadSize), D>;

/// Initial capacity of the read buffer, one full header block.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// An HTTP/1.1 connection serving requests one after another.
///
/// `HttpConnection` handles the full lifecycle of a connection:
/// - reading and decoding requests, answering `400` to malformed ones
/// - handing the request with a lazily read body to the handler
/// - sending `100 Continue` when the handler first reads an expecting body
/// - encoding the response, then draining whatever body the handler left unread
/// - keeping the connection alive or closing it
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
}

/// What the body channel saw by the time the handler returned.
struct BodyState {
    eof: bool,
    poisoned: bool,
    continue_pending: bool,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), READ_BUFFER_SIZE),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
        }
    }

    /// Serves requests with the [`DefaultErrorHook`] until the connection closes.
    pub async fn process<H>(self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler,
        <H::RespBody as Body>::Error: Into<BoxError>,
    {
        self.process_with_hook(handler, Arc::new(DefaultErrorHook)).await
    }

    /// Serves requests until the peer closes, a response asks to close, or the
    /// stream can no longer be framed.
    ///
    /// A malformed request header is answered with `400 Bad Request` and the
    /// connection is closed; the error is returned. A close between requests
    /// returns `Ok`.
    pub async fn process_with_hook<H, E>(mut self, handler: Arc<H>, error_hook: Arc<E>) -> Result<(), HttpError>
    where
        H: Handler,
        <H::RespBody as Body>::Error: Into<BoxError>,
        E: ErrorHook + ?Sized,
    {
        loop {
            match self.framed_read.next().await {
                Some(Ok(Message::Header((header, payload_size)))) => {
                    if !self.do_process(header, payload_size, &*handler, &*error_hook).await? {
                        break;
                    }
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("received payload while waiting for a request header");
                    self.send_bad_request().await;
                    return Err(ParseError::invalid_body("payload without a request header").into());
                }

                Some(Err(e)) => {
                    if e.is_validation() {
                        warn!(cause = %e, "malformed request, closing connection");
                        self.send_bad_request().await;
                    } else {
                        info!(cause = %e, "failed to read request");
                    }
                    return Err(e.into());
                }

                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            }
        }

        if let Err(e) = self.framed_write.get_mut().shutdown().await {
            debug!(cause = %e, "failed to shut down connection");
        }
        Ok(())
    }

    /// Handles one request; returns whether the connection stays open.
    async fn do_process<H, E>(
        &mut self,
        header: RequestHeader,
        payload_size: PayloadSize,
        handler: &H,
        error_hook: &E,
    ) -> Result<bool, HttpError>
    where
        H: Handler,
        <H::RespBody as Body>::Error: Into<BoxError>,
        E: ErrorHook + ?Sized,
    {
        debug!(method = %header.method(), uri = %header.uri(), ?payload_size, "received request");

        let head_only = header.method() == Method::HEAD;
        let mut keep_alive = header.is_persistent();
        let wants_continue = header.expects_continue() && header.version() == Version::HTTP_11 && payload_size.has_body();

        let Self { framed_read, framed_write } = self;

        let (handler_result, body_state) = {
            let continue_writer = if wants_continue { Some(framed_write.get_mut()) } else { None };
            let (req_body, mut body_sender) = body_channel(framed_read, continue_writer, payload_size);
            let request = header.body(req_body);

            // The body is only read when the handler polls it, so both futures run
            // together: the handler waits on body frames the sender produces.
            let result = {
                let mut handle = pin!(AssertUnwindSafe(handler.call(request)).catch_unwind());
                let mut body_future = pin!(body_sender.start());
                let mut body_done = false;

                loop {
                    select! {
                        biased;
                        result = &mut handle => break result,
                        _ = &mut body_future, if !body_done => body_done = true,
                    }
                }
            };
            body_sender.finish_continue().await;

            let body_state = BodyState {
                eof: body_sender.is_eof(),
                poisoned: body_sender.is_poisoned(),
                continue_pending: body_sender.is_continue_pending(),
            };
            (result, body_state)
        };

        if body_state.poisoned || body_state.continue_pending {
            keep_alive = false;
        }

        let sent = match handler_result {
            Ok(Ok(response)) => send_response(framed_write, response, head_only, keep_alive).await,
            Ok(Err(e)) => {
                let e: BoxError = e.into();
                warn!(cause = %e, "handler failed");
                let response = recover(error_hook, &*e).await;
                send_response(framed_write, response, head_only, keep_alive).await
            }
            Err(payload) => {
                let panic = HandlerPanic::from_payload(payload);
                error!(cause = %panic, "handler panicked");
                let response = recover(error_hook, &panic).await;
                send_response(framed_write, response, head_only, keep_alive).await
            }
        };
        let keep_alive = sent?;

        if !body_state.eof && !body_state.poisoned && !body_state.continue_pending {
            if let Err(e) = skip_body(framed_read).await {
                warn!(cause = %e, "failed to drain request body");
                return Ok(false);
            }
        }

        Ok(keep_alive)
    }

    async fn send_bad_request(&mut self) {
        let response = status_response(StatusCode::BAD_REQUEST);
        if let Err(e) = send_response(&mut self.framed_write, response, false, false).await {
            debug!(cause = %e, "failed to send 400 response");
        }
    }
}

/// Asks the error hook for a response, falling back to a fixed `500`.
async fn recover<E>(error_hook: &E, error: &(dyn Error + Send + Sync + 'static)) -> Response<Full<Bytes>>
where
    E: ErrorHook + ?Sized,
{
    match AssertUnwindSafe(error_hook.on_error(error)).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(cause = %e, "error hook failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(payload) => {
            error!(cause = %HandlerPanic::from_payload(payload), "error hook panicked");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Writes one response; returns whether the connection stays open afterwards.
///
/// Each body frame is flushed before the next one is polled. A body that fails
/// midway returns an error without terminating the framing, so the peer sees
/// a truncated message rather than a complete short one.
async fn send_response<W, B>(
    framed_write: &mut FramedWrite<W, ResponseEncoder>,
    response: Response<B>,
    head_only: bool,
    keep_alive: bool,
) -> Result<bool, SendError>
where
    W: AsyncWrite + Unpin,
    B: Body,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let mut head = ResponseHead::from_parts(parts, ());

    let keep_alive = keep_alive && !has_connection_token(head.headers(), "close");
    if !keep_alive {
        head.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let payload_size = response_payload_size(&head, body.size_hint().exact());
    let skip_body = head_only || is_bodiless_status(head.status());
    framed_write.encoder_mut().set_head_only(head_only);

    let header = ResponseMessage::<B::Data>::Header((head, payload_size));
    if skip_body {
        framed_write.feed(header).await?;
        framed_write.send(ResponseMessage::<B::Data>::Payload(PayloadItem::Eof)).await?;
        return Ok(keep_alive);
    }

    if payload_size.is_chunked() {
        // a stream may take a while to produce its first frame
        framed_write.send(header).await?;
    } else {
        framed_write.feed(header).await?;
    }

    let mut body = pin!(body);
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let payload_item = match frame.into_data() {
                    Ok(data) => PayloadItem::Chunk(data),
                    Err(frame) => match frame.into_trailers() {
                        Ok(trailers) => PayloadItem::Trailers(trailers),
                        Err(_) => continue,
                    },
                };
                framed_write.send(ResponseMessage::<B::Data>::Payload(payload_item)).await?;
            }
            Some(Err(e)) => {
                let e: BoxError = e.into();
                return Err(SendError::invalid_body(format!("response body failed: {e}")));
            }
            None => {
                framed_write.send(ResponseMessage::<B::Data>::Payload(PayloadItem::Eof)).await?;
                return Ok(keep_alive);
            }
        }
    }
}
