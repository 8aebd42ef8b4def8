//! Lazily read request bodies.
//!
//! The body handling system consists of two halves talking over bounded channels:
//!
//! - [`ReqBody`]: the consumer side handed to the handler, implements `http_body::Body`
//! - `BodySender`: the producer side, owned by the connection, reads payload items
//!   off the decoded stream only when the handler asks for the next frame
//!
//! Nothing is read from the socket until the handler polls the body. The first
//! poll is also what triggers the interim `100 Continue` response when the client
//! asked for one. Whatever the handler leaves unread is drained by the connection
//! before the next request.

use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, channel::mpsc};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub(crate) enum BodyRequestSignal {
    RequestData,
}

/// Creates the two halves of a request body.
///
/// `continue_writer` is the raw connection writer when the request carries
/// `Expect: 100-continue` and a body; the interim response goes through it on
/// the first read.
pub(crate) fn body_channel<'conn, S, W>(
    payload_stream: &'conn mut S,
    continue_writer: Option<&'conn mut W>,
    payload_size: PayloadSize,
) -> (ReqBody, BodySender<'conn, S, W>)
where
    S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let (signal_sender, signal_receiver) = mpsc::channel(8);
    let (data_sender, data_receiver) = mpsc::channel(8);

    (
        ReqBody::new(signal_sender, data_receiver, payload_size),
        BodySender {
            payload_stream,
            continue_writer,
            continue_written: 0,
            signal_receiver,
            data_sender,
            eof: false,
            poisoned: false,
        },
    )
}

pub(crate) struct BodySender<'conn, S, W> {
    payload_stream: &'conn mut S,
    continue_writer: Option<&'conn mut W>,
    continue_written: usize,
    signal_receiver: mpsc::Receiver<BodyRequestSignal>,
    data_sender: mpsc::Sender<Result<PayloadItem, ParseError>>,
    eof: bool,
    poisoned: bool,
}

impl<S, W> BodySender<'_, S, W>
where
    S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Answers read signals until the body is done, fails, or the [`ReqBody`] is dropped.
    pub(crate) async fn start(&mut self) {
        if self.eof || self.poisoned {
            return;
        }

        while let Some(BodyRequestSignal::RequestData) = self.signal_receiver.next().await {
            let result = match self.send_continue().await {
                Ok(()) => read_payload(&mut *self.payload_stream).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(payload_item) => {
                    self.eof = payload_item.is_eof();
                    if self.data_sender.send(Ok(payload_item)).await.is_err() {
                        debug!("request body dropped while a frame was in flight");
                    }
                    if self.eof {
                        return;
                    }
                }
                Err(e) => {
                    error!(cause = %e, "failed to read request body");
                    self.poisoned = true;
                    if self.data_sender.send(Err(e)).await.is_err() {
                        debug!("request body dropped before its read error was delivered");
                    }
                    return;
                }
            }
        }
    }

    /// Writes the interim response, resuming after whatever part of it an
    /// earlier, cancelled call already put on the wire.
    async fn send_continue(&mut self) -> Result<(), ParseError> {
        let Some(writer) = self.continue_writer.as_mut() else {
            return Ok(());
        };

        while self.continue_written < CONTINUE.len() {
            let n = writer.write(&CONTINUE[self.continue_written..]).await.map_err(ParseError::io)?;
            if n == 0 {
                return Err(ParseError::io(io::Error::from(io::ErrorKind::WriteZero)));
            }
            self.continue_written += n;
        }
        writer.flush().await.map_err(ParseError::io)?;

        self.continue_writer = None;
        info!("sent 100 continue");
        Ok(())
    }

    /// Completes a `100 Continue` the handler interrupted by returning early.
    ///
    /// Must run before the final response so the two never interleave. A
    /// failure poisons the connection.
    pub(crate) async fn finish_continue(&mut self) {
        if self.continue_written == 0 {
            return;
        }
        if let Err(e) = self.send_continue().await {
            error!(cause = %e, "failed to finish 100 continue");
            self.poisoned = true;
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// The payload stream failed; the connection can't be reused.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The client is still waiting for `100 Continue`, so it never sent the body.
    pub(crate) fn is_continue_pending(&self) -> bool {
        self.continue_writer.is_some() && self.continue_written == 0
    }
}

async fn read_payload<S>(payload_stream: &mut S) -> Result<PayloadItem, ParseError>
where
    S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
{
    match payload_stream.next().await {
        Some(Ok(Message::Payload(payload_item))) => Ok(payload_item),
        Some(Ok(Message::Header(_))) => {
            error!("received header from receive body phase");
            Err(ParseError::invalid_body("received header from receive body phase"))
        }
        Some(Err(e)) => Err(e),
        None => Err(ParseError::unexpected_eof("connection closed while reading request body")),
    }
}

/// Reads and drops the rest of a request body, returning the number of bytes skipped.
pub(crate) async fn skip_body<S>(payload_stream: &mut S) -> Result<u64, ParseError>
where
    S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
{
    let mut size = 0u64;
    loop {
        match read_payload(payload_stream).await? {
            PayloadItem::Eof => {
                if size > 0 {
                    info!(size, "skipped unread request body");
                }
                return Ok(size);
            }
            PayloadItem::Chunk(bytes) => size += bytes.len() as u64,
            PayloadItem::Trailers(_) => {}
        }
    }
}

/// The request body handed to handlers.
///
/// Yields data frames, then at most one trailers frame for a chunked body that
/// carried a trailer block. A framing or trailer validation failure is yielded
/// as a [`ParseError`].
#[derive(Debug)]
pub struct ReqBody {
    signal_sender: mpsc::Sender<BodyRequestSignal>,
    data_receiver: mpsc::Receiver<Result<PayloadItem, ParseError>>,
    payload_size: PayloadSize,
    in_flight: bool,
    eof: bool,
}

impl ReqBody {
    fn new(
        signal_sender: mpsc::Sender<BodyRequestSignal>,
        data_receiver: mpsc::Receiver<Result<PayloadItem, ParseError>>,
        payload_size: PayloadSize,
    ) -> Self {
        Self { signal_sender, data_receiver, payload_size, in_flight: false, eof: false }
    }

    /// Reads the whole body and appends its trailer fields, if any, to `headers`.
    pub async fn collect_into(self, headers: &mut HeaderMap) -> Result<Bytes, ParseError> {
        let collected = self.collect().await?;
        if let Some(trailers) = collected.trailers() {
            for (name, value) in trailers {
                headers.append(name.clone(), value.clone());
            }
        }
        Ok(collected.to_bytes())
    }
}

#[cfg(test)]
pub(crate) fn empty_body() -> ReqBody {
    let (signal_sender, _) = mpsc::channel(1);
    let (_, data_receiver) = mpsc::channel(1);
    ReqBody::new(signal_sender, data_receiver, PayloadSize::Empty)
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.eof {
            return Poll::Ready(None);
        }

        if !this.in_flight {
            match Pin::new(&mut this.signal_sender).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Err(e) = Pin::new(&mut this.signal_sender).start_send(BodyRequestSignal::RequestData) {
                        error!("failed to request body data, {}", e);
                        return Poll::Ready(Some(Err(ParseError::invalid_body("request body is no longer readable"))));
                    }
                    this.in_flight = true;
                }
                Poll::Ready(Err(e)) => {
                    error!("failed to request body data, {}", e);
                    return Poll::Ready(Some(Err(ParseError::invalid_body("request body is no longer readable"))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        let item = match this.data_receiver.poll_next_unpin(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };
        this.in_flight = false;

        match item {
            Some(Ok(PayloadItem::Chunk(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Some(Ok(PayloadItem::Trailers(trailers))) => {
                trace!(count = trailers.len(), "yield request trailers");
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
            Some(Ok(PayloadItem::Eof)) => {
                this.eof = true;
                Poll::Ready(None)
            }
            Some(Err(e)) => {
                this.eof = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.eof = true;
                Poll::Ready(Some(Err(ParseError::invalid_body("request body is no longer readable"))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.eof || !self.payload_size.has_body()
    }

    fn size_hint(&self) -> SizeHint {
        self.payload_size.into()
    }
}

impl From<PayloadSize> for SizeHint {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => SizeHint::with_exact(length),
            PayloadSize::Chunked => SizeHint::new(),
            PayloadSize::Empty => SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::stream;
    use futures::task::noop_waker_ref;
    use http::HeaderValue;

    type Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>;

    fn chunk(data: &'static [u8]) -> Item {
        Ok(Message::Payload(PayloadItem::Chunk(Bytes::from_static(data))))
    }

    fn eof() -> Item {
        Ok(Message::Payload(PayloadItem::Eof))
    }

    #[tokio::test]
    async fn body_receiver_only_requests_once_until_response() {
        let (signal_sender, mut signal_receiver) = mpsc::channel(8);
        let (mut data_sender, data_receiver) = mpsc::channel(8);
        let mut body = ReqBody::new(signal_sender, data_receiver, PayloadSize::Chunked);

        let mut cx = Context::from_waker(noop_waker_ref());

        assert!(Pin::new(&mut body).poll_frame(&mut cx).is_pending());
        assert!(matches!(signal_receiver.next().await, Some(BodyRequestSignal::RequestData)));

        assert!(Pin::new(&mut body).poll_frame(&mut cx).is_pending());
        assert!(signal_receiver.next().now_or_never().is_none());

        data_sender.try_send(Ok(PayloadItem::Chunk(Bytes::from_static(b"hello")))).unwrap();

        match Pin::new(&mut body).poll_frame(&mut cx) {
            Poll::Ready(Some(Ok(frame))) => assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"hello")),
            other => panic!("unexpected poll result: {other:?}"),
        }

        assert!(Pin::new(&mut body).poll_frame(&mut cx).is_pending());
        assert!(matches!(signal_receiver.next().await, Some(BodyRequestSignal::RequestData)));

        data_sender.try_send(Ok(PayloadItem::Eof)).unwrap();

        assert!(matches!(Pin::new(&mut body).poll_frame(&mut cx), Poll::Ready(None)));
        // polling past the end doesn't ask for more data
        assert!(matches!(Pin::new(&mut body).poll_frame(&mut cx), Poll::Ready(None)));
        assert!(signal_receiver.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn continue_is_sent_on_first_read() {
        let mut payload = stream::iter(vec![chunk(b"ab"), chunk(b"c"), eof()]);
        let mut writer = Vec::new();

        let (body, mut sender) = body_channel(&mut payload, Some(&mut writer), PayloadSize::Length(3));
        let (_, collected) = tokio::join!(sender.start(), body.collect());

        assert_eq!(collected.unwrap().to_bytes(), Bytes::from_static(b"abc"));
        assert!(sender.is_eof());
        assert!(!sender.is_continue_pending());
        drop(sender);
        assert_eq!(writer, CONTINUE);
    }

    #[tokio::test]
    async fn continue_is_not_sent_when_body_is_never_read() {
        let mut payload = stream::iter(vec![chunk(b"abc"), eof()]);
        let mut writer = Vec::new();

        let (body, mut sender) = body_channel(&mut payload, Some(&mut writer), PayloadSize::Length(3));
        drop(body);
        sender.start().await;

        assert!(sender.is_continue_pending());
        assert!(!sender.is_eof());
        drop(sender);
        assert!(writer.is_empty());
    }

    /// Takes a few bytes per write and stalls every other call.
    #[derive(Default)]
    struct StallingWriter {
        written: Vec<u8>,
        stall: bool,
    }

    impl AsyncWrite for StallingWriter {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if this.stall {
                this.stall = false;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.stall = true;
            let n = buf.len().min(4);
            this.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn interrupted_continue_is_finished_before_the_response() {
        let mut payload = stream::iter(vec![chunk(b"abc"), eof()]);
        let mut writer = StallingWriter::default();

        let (mut body, mut sender) = body_channel(&mut payload, Some(&mut writer), PayloadSize::Length(3));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(Pin::new(&mut body).poll_frame(&mut cx).is_pending());

        // the handler returns while the interim response is half written
        assert!(sender.start().now_or_never().is_none());
        drop(body);
        assert!(!sender.is_continue_pending());

        sender.finish_continue().await;
        assert!(!sender.is_poisoned());
        assert!(!sender.is_continue_pending());
        drop(sender);
        assert_eq!(writer.written, CONTINUE);
    }

    #[tokio::test]
    async fn trailers_are_merged_into_headers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        let mut payload =
            stream::iter(vec![chunk(b"data"), Ok(Message::Payload(PayloadItem::Trailers(trailers))), eof()]);

        let (body, mut sender) = body_channel::<_, Vec<u8>>(&mut payload, None, PayloadSize::Chunked);
        let mut headers = HeaderMap::new();
        let (_, bytes) = tokio::join!(sender.start(), body.collect_into(&mut headers));

        assert_eq!(bytes.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(headers.get("x-checksum").unwrap(), "abc");
    }

    #[tokio::test]
    async fn read_error_poisons_the_body() {
        let mut payload = stream::iter(vec![chunk(b"ab"), Err(ParseError::invalid_trailer("declared trailer x is missing"))]);

        let (body, mut sender) = body_channel::<_, Vec<u8>>(&mut payload, None, PayloadSize::Chunked);
        let (_, collected) = tokio::join!(sender.start(), body.collect());

        assert!(matches!(collected, Err(ParseError::InvalidTrailer { .. })));
        assert!(sender.is_poisoned());
    }

    #[tokio::test]
    async fn unread_body_is_skipped() {
        let mut payload = stream::iter(vec![chunk(b"abc"), chunk(b"de"), eof(), chunk(b"next")]);
        assert_eq!(skip_body(&mut payload).await.unwrap(), 5);

        let mut truncated = stream::iter(vec![chunk(b"abc")]);
        assert!(skip_body(&mut truncated).await.is_err());
    }
}
