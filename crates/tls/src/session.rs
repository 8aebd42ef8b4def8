//! A TLS session whose handshake is driven lazily.
//!
//! [`TlsSession`] is handed out before the handshake has finished. The first
//! read, write, flush or shutdown drives the pending handshake to completion,
//! and [`TlsSession::handshake`] does the same explicitly. The handshake is a
//! rendezvous: both peers must be polled from independently scheduled tasks,
//! awaiting one side to completion before the other side starts never resolves.

use std::fmt;
use std::future::{Future, poll_fn};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{Accept, Connect, TlsStream};
use tracing::{debug, trace};

use crate::TlsError;

/// Handshake progress of a [`TlsSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    HandshakePending,
    Established { alpn: Option<Vec<u8>> },
    Failed,
}

/// What the completed handshake agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    /// the negotiated application protocol, if any
    pub alpn: Option<Vec<u8>>,
    /// the SNI name sent by the client (server side) or dialed (client side)
    pub server_name: Option<String>,
}

enum State<IO> {
    Accepting(Accept<IO>),
    Connecting(Connect<IO>),
    Streaming(TlsStream<IO>),
    Failed,
}

pub struct TlsSession<IO> {
    state: State<IO>,
    server_name: Option<String>,
}

impl<IO> fmt::Debug for TlsSession<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Accepting(_) => "accepting",
            State::Connecting(_) => "connecting",
            State::Streaming(_) => "streaming",
            State::Failed => "failed",
        };
        f.debug_struct("TlsSession").field("state", &state).field("server_name", &self.server_name).finish()
    }
}

impl<IO> TlsSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn accepting(accept: Accept<IO>, server_name: Option<String>) -> Self {
        Self { state: State::Accepting(accept), server_name }
    }

    pub(crate) fn connecting(connect: Connect<IO>, server_name: String) -> Self {
        Self { state: State::Connecting(connect), server_name: Some(server_name) }
    }

    pub fn status(&self) -> SessionStatus {
        match &self.state {
            State::Accepting(_) | State::Connecting(_) => SessionStatus::HandshakePending,
            State::Streaming(stream) => SessionStatus::Established { alpn: negotiated_alpn(stream) },
            State::Failed => SessionStatus::Failed,
        }
    }

    /// SNI server name, known from the ClientHello on the server side.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Drives the handshake to completion.
    ///
    /// Returns at once when the handshake already finished. A failed handshake
    /// leaves the session unusable.
    pub async fn handshake(&mut self) -> Result<Established, TlsError> {
        poll_fn(|cx| self.poll_handshake(cx)).await.map_err(TlsError::from_io)?;

        match &self.state {
            State::Streaming(stream) => {
                Ok(Established { alpn: negotiated_alpn(stream), server_name: self.server_name.clone() })
            }
            _ => Err(TlsError::handshake("session is not established")),
        }
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = match &mut self.state {
            State::Accepting(accept) => ready!(Pin::new(accept).poll(cx)).map(TlsStream::from),
            State::Connecting(connect) => ready!(Pin::new(connect).poll(cx)).map(TlsStream::from),
            State::Streaming(_) => return Poll::Ready(Ok(())),
            State::Failed => return Poll::Ready(Err(failed())),
        };

        match result {
            Ok(stream) => {
                debug!(alpn = ?negotiated_alpn(&stream), server_name = ?self.server_name, "tls handshake completed");
                self.state = State::Streaming(stream);
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                debug!(cause = %e, "tls handshake failed");
                self.state = State::Failed;
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Pin<&mut TlsStream<IO>>>> {
        ready!(self.poll_handshake(cx))?;
        match &mut self.state {
            State::Streaming(stream) => Poll::Ready(Ok(Pin::new(stream))),
            _ => Poll::Ready(Err(failed())),
        }
    }
}

fn negotiated_alpn<IO>(stream: &TlsStream<IO>) -> Option<Vec<u8>> {
    stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec)
}

fn failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tls handshake failed")
}

impl<IO> AsyncRead for TlsSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        stream.poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for TlsSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let stream = ready!(self.get_mut().poll_stream(cx))?;
        stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if matches!(this.state, State::Failed) {
            trace!("shutdown of a failed tls session");
            return Poll::Ready(Ok(()));
        }
        let stream = ready!(this.poll_stream(cx))?;
        stream.poll_shutdown(cx)
    }
}
