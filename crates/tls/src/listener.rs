use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tracing::{info, trace};

use crate::{CertificateMaterial, CertificateResolver, TlsAcceptor, TlsError, TlsSession};

const DEFAULT_BACKLOG: u32 = 1024;

/// Bind address, ALPN list and certificate sources of one listener.
#[derive(Clone)]
pub struct TlsListenerConfig {
    hostname: String,
    port: u16,
    reuse_port: bool,
    backlog: u32,
    alpn_protocols: Vec<Vec<u8>>,
    certificate: Option<CertificateMaterial>,
    resolver: Option<Arc<dyn CertificateResolver>>,
}

impl fmt::Debug for TlsListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsListenerConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("reuse_port", &self.reuse_port)
            .field("backlog", &self.backlog)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("has_certificate", &self.certificate.is_some())
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

impl TlsListenerConfig {
    pub fn builder() -> TlsListenerConfigBuilder {
        TlsListenerConfigBuilder::default()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        TlsAcceptor::new(self.certificate.as_ref(), self.resolver.clone(), self.alpn_protocols.clone())
    }
}

#[derive(Default)]
pub struct TlsListenerConfigBuilder {
    hostname: Option<String>,
    port: u16,
    reuse_port: bool,
    backlog: Option<u32>,
    alpn_protocols: Vec<Vec<u8>>,
    certificate: Option<CertificateMaterial>,
    resolver: Option<Arc<dyn CertificateResolver>>,
}

impl fmt::Debug for TlsListenerConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsListenerConfigBuilder").field("hostname", &self.hostname).field("port", &self.port).finish_non_exhaustive()
    }
}

impl TlsListenerConfigBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn alpn_protocol(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.alpn_protocols.push(protocol.into());
        self
    }

    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn certificate(mut self, material: CertificateMaterial) -> Self {
        self.certificate = Some(material);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn CertificateResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fails unless a hostname and at least one certificate source are set.
    pub fn build(self) -> Result<TlsListenerConfig, TlsError> {
        let hostname = self.hostname.filter(|hostname| !hostname.is_empty()).ok_or_else(|| TlsError::config("missing hostname"))?;
        if self.certificate.is_none() && self.resolver.is_none() {
            return Err(TlsError::config(format!("listener {hostname}:{} has neither a certificate nor a resolver", self.port)));
        }

        Ok(TlsListenerConfig {
            hostname,
            port: self.port,
            reuse_port: self.reuse_port,
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
            alpn_protocols: self.alpn_protocols,
            certificate: self.certificate,
            resolver: self.resolver,
        })
    }
}

/// A bound TCP listener that terminates TLS.
#[derive(Debug)]
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub async fn bind(config: TlsListenerConfig) -> Result<Self, TlsError> {
        let acceptor = config.acceptor()?;
        let listener = bind_tcp(&config.hostname, config.port, config.reuse_port, config.backlog).await?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Accepts the next TCP connection without touching TLS.
    ///
    /// Pair with [`TlsListener::acceptor`] to run the handshake phases on the
    /// connection's own task.
    pub async fn accept_transport(&self) -> Result<(TcpStream, SocketAddr), TlsError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        trace!(%peer_addr, "accepted tcp connection");
        Ok((stream, peer_addr))
    }

    /// Accepts the next connection and runs both handshake phases.
    ///
    /// The returned session may still have the final handshake flight pending.
    pub async fn accept(&self) -> Result<(TlsSession<TcpStream>, SocketAddr), TlsError> {
        let (stream, peer_addr) = self.accept_transport().await?;
        let session = self.acceptor.accept(stream).await?;
        Ok((session, peer_addr))
    }
}

/// Resolves `hostname:port` and binds the first address that works.
///
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT` only when `reuse_port` is
/// requested and the platform supports it.
pub async fn bind_tcp(hostname: &str, port: u16, reuse_port: bool, backlog: u32) -> Result<TcpListener, TlsError> {
    let address = format!("{hostname}:{port}");
    let addrs = lookup_host(address.as_str()).await.map_err(|e| TlsError::bind(&address, e))?;

    let mut last_error = None;
    for addr in addrs {
        match bind_addr(addr, reuse_port, backlog) {
            Ok(listener) => {
                info!(%addr, reuse_port, "listening");
                return Ok(listener);
            }
            Err(e) => last_error = Some(e),
        }
    }

    let source = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "hostname resolved to no address"));
    Err(TlsError::bind(address, source))
}

fn bind_addr(addr: SocketAddr, reuse_port: bool, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(reuse_port)?;
    #[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
    if reuse_port {
        tracing::warn!(%addr, "reuse_port is not supported on this platform, binding without it");
    }
    socket.bind(addr)?;
    socket.listen(backlog)
}
