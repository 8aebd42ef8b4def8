//! Two-phase server accept.
//!
//! Phase one reads only the ClientHello and exposes its SNI name and ALPN
//! offer. Certificate material is then chosen, by a [`CertificateResolver`] or
//! from the statically configured default, and phase two starts the
//! handshake with it.

use std::fmt;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{LazyConfigAcceptor, StartHandshake};
use tracing::{debug, warn};

use crate::{CertificateMaterial, CertificateResolver, TlsError, TlsSession};

/// Metadata of a received ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

/// Server side acceptor shared by every connection of a listener.
///
/// Cloning is cheap. The static default material is turned into a
/// `ServerConfig` once, at construction.
#[derive(Clone)]
pub struct TlsAcceptor {
    default_config: Option<Arc<ServerConfig>>,
    resolver: Option<Arc<dyn CertificateResolver>>,
    alpn_protocols: Arc<[Vec<u8>]>,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("has_default", &self.default_config.is_some())
            .field("has_resolver", &self.resolver.is_some())
            .field("alpn_protocols", &self.alpn_protocols)
            .finish()
    }
}

impl TlsAcceptor {
    pub fn new(
        default_material: Option<&CertificateMaterial>,
        resolver: Option<Arc<dyn CertificateResolver>>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsError> {
        let default_config = default_material.map(|material| material.server_config(&alpn_protocols)).transpose()?;
        Ok(Self { default_config, resolver, alpn_protocols: alpn_protocols.into() })
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    /// Phase one: reads the ClientHello and nothing more.
    pub async fn read_client_hello<IO>(&self, io: IO) -> Result<HelloReceived<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await.map_err(TlsError::from_io)?;

        let client_hello = start.client_hello();
        let info = ClientHelloInfo {
            server_name: client_hello.server_name().map(str::to_owned),
            alpn: client_hello.alpn().map(|protocols| protocols.map(<[u8]>::to_vec).collect()).unwrap_or_default(),
        };
        debug!(server_name = ?info.server_name, alpn_count = info.alpn.len(), "received client hello");

        Ok(HelloReceived { start, info })
    }

    /// Both phases, choosing material in between.
    ///
    /// The resolver is consulted only when the client sent a server name; the
    /// static default is the fallback. With neither available the handshake is
    /// abandoned and the transport dropped.
    pub async fn accept<IO>(&self, io: IO) -> Result<TlsSession<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = self.read_client_hello(io).await?;

        let resolved = match (hello.client_hello().server_name.as_deref(), &self.resolver) {
            (Some(server_name), Some(resolver)) => resolver.resolve(server_name).await,
            _ => None,
        };

        match (resolved, &self.default_config) {
            (Some(material), _) => hello.complete(&material, &self.alpn_protocols),
            (None, Some(config)) => Ok(hello.complete_with_config(Arc::clone(config))),
            (None, None) => {
                warn!(server_name = ?hello.client_hello().server_name, "no certificate available for client hello");
                Err(TlsError::certificate(format!(
                    "no certificate for server name {:?}",
                    hello.client_hello().server_name.as_deref().unwrap_or("<none>")
                )))
            }
        }
    }
}

/// A connection that finished phase one and waits for certificate material.
pub struct HelloReceived<IO> {
    start: StartHandshake<IO>,
    info: ClientHelloInfo,
}

impl<IO> fmt::Debug for HelloReceived<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloReceived").field("info", &self.info).finish_non_exhaustive()
    }
}

impl<IO> HelloReceived<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn client_hello(&self) -> &ClientHelloInfo {
        &self.info
    }

    /// Phase two: starts the handshake with `material` and the given ALPN list.
    ///
    /// The returned session is still pending; see [`TlsSession`].
    pub fn complete(self, material: &CertificateMaterial, alpn_protocols: &[Vec<u8>]) -> Result<TlsSession<IO>, TlsError> {
        let config = material.server_config(alpn_protocols)?;
        Ok(self.complete_with_config(config))
    }

    pub fn complete_with_config(self, config: Arc<ServerConfig>) -> TlsSession<IO> {
        let Self { start, info } = self;
        TlsSession::accepting(start.into_stream(config), info.server_name)
    }
}
