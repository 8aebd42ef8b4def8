use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portico_http::connection::HttpConnection;
use portico_http::handler::{BoxError, DefaultErrorHook, ErrorHook, Handler};
use portico_tls::{TlsAcceptor, TlsListener, bind_tcp};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ServerConfig, ServerError};

const DEFAULT_BACKLOG: u32 = 1024;

/// Pause after a failed accept; errors such as EMFILE persist until a connection closes.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Listener {
    Plain(TcpListener),
    Tls(TlsListener),
}

impl Listener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Plain(listener) => listener.local_addr(),
            Listener::Tls(listener) => listener.local_addr(),
        }
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        match self {
            Listener::Plain(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((stream, peer_addr))
            }
            Listener::Tls(listener) => Ok(listener.accept_transport().await?),
        }
    }

    fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        match self {
            Listener::Plain(_) => None,
            Listener::Tls(listener) => Some(listener.acceptor().clone()),
        }
    }
}

/// Accepts connections on every configured listener and serves them with one handler.
///
/// Each connection runs on its own task; TLS handshakes happen there too, so a
/// slow ClientHello or resolver never stalls the accept loop. Cancelling the
/// [`Server::shutdown_token`] stops accepting and drops every open connection.
pub struct Server<H> {
    listeners: Vec<Listener>,
    handler: Arc<H>,
    error_hook: Arc<dyn ErrorHook>,
    shutdown: CancellationToken,
}

impl<H> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("listeners", &self.local_addrs()).finish_non_exhaustive()
    }
}

impl<H> Server<H> {
    /// Bound addresses, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|listener| listener.local_addr().ok()).collect()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn with_error_hook(mut self, error_hook: Arc<dyn ErrorHook>) -> Self {
        self.error_hook = error_hook;
        self
    }
}

impl<H> Server<H>
where
    H: Handler + 'static,
    H::RespBody: 'static,
    <H::RespBody as http_body::Body>::Data: Send,
    <H::RespBody as http_body::Body>::Error: Into<BoxError> + Send,
{
    /// Binds every listener of `config`. Fails on the first listener that cannot be bound.
    pub async fn bind(config: &ServerConfig, handler: H) -> Result<Self, ServerError> {
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let listener = match listener_config.tls_listener_config()? {
                Some(tls_config) => Listener::Tls(TlsListener::bind(tls_config).await?),
                None => Listener::Plain(
                    bind_tcp(
                        &listener_config.hostname,
                        listener_config.port,
                        listener_config.reuse_port,
                        listener_config.backlog.unwrap_or(DEFAULT_BACKLOG),
                    )
                    .await?,
                ),
            };
            info!(address = %listener_config.address(), tls = listener_config.tls.is_some(), "listener bound");
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            handler: Arc::new(handler),
            error_hook: Arc::new(DefaultErrorHook),
            shutdown: CancellationToken::new(),
        })
    }

    /// Serves until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { listeners, handler, error_hook, shutdown } = self;

        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(accept_loop(listener, Arc::clone(&handler), Arc::clone(&error_hook), shutdown.clone()));
        }

        while let Some(result) = accept_loops.join_next().await {
            if let Err(e) = result {
                error!(cause = %e, "accept loop terminated abnormally");
            }
        }
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop<H>(listener: Listener, handler: Arc<H>, error_hook: Arc<dyn ErrorHook>, shutdown: CancellationToken)
where
    H: Handler + 'static,
    H::RespBody: 'static,
    <H::RespBody as http_body::Body>::Data: Send,
    <H::RespBody as http_body::Body>::Error: Into<BoxError> + Send,
{
    let tls_acceptor = listener.tls_acceptor();
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    if back_off(&shutdown).await {
                        continue;
                    }
                    break;
                }
            },
        };

        let tls_acceptor = tls_acceptor.clone();
        let handler = Arc::clone(&handler);
        let error_hook = Arc::clone(&error_hook);
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => debug!(%peer_addr, "connection dropped by shutdown"),
                () = serve_connection(stream, peer_addr, tls_acceptor, handler, error_hook) => {}
            }
        });
    }

    debug!(open = connections.len(), "accept loop stopped");
    connections.shutdown().await;
}

/// Waits out [`ACCEPT_BACKOFF`]; returns false when shutdown arrives first.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn serve_connection<H>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    handler: Arc<H>,
    error_hook: Arc<dyn ErrorHook>,
) where
    H: Handler,
    <H::RespBody as http_body::Body>::Error: Into<BoxError>,
{
    let result = match tls_acceptor {
        None => {
            let (reader, writer) = stream.into_split();
            HttpConnection::new(reader, writer).process_with_hook(handler, error_hook).await
        }
        Some(acceptor) => {
            let session = match acceptor.accept(stream).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%peer_addr, cause = %e, "tls accept failed");
                    return;
                }
            };
            let (reader, writer) = tokio::io::split(session);
            HttpConnection::new(reader, writer).process_with_hook(handler, error_hook).await
        }
    };

    match result {
        Ok(()) => debug!(%peer_addr, "connection closed"),
        Err(e) => info!(%peer_addr, cause = %e, "connection closed with error"),
    }
}
