use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{CertificateMaterial, TlsError, TlsSession, load_certificates};

/// Where and how to dial a TLS server.
///
/// Without explicit CA certificates the `webpki-roots` set is trusted.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    hostname: String,
    port: u16,
    ca_certificates: Vec<CertificateDer<'static>>,
    client_certificate: Option<CertificateMaterial>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl ClientTlsConfig {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ca_certificates: Vec::new(),
            client_certificate: None,
            alpn_protocols: Vec::new(),
        }
    }

    /// Trusts the certificates of a PEM bundle instead of the web PKI roots.
    pub fn with_ca_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        let certificates = load_certificates(pem)?;
        if certificates.is_empty() {
            return Err(TlsError::certificate("no CA certificate in PEM input"));
        }
        self.ca_certificates.extend(certificates);
        Ok(self)
    }

    pub fn with_client_certificate(mut self, material: CertificateMaterial) -> Self {
        self.client_certificate = Some(material);
        self
    }

    pub fn with_alpn_protocols(mut self, alpn_protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = alpn_protocols;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        if self.ca_certificates.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for certificate in &self.ca_certificates {
                roots.add(certificate.clone()).map_err(TlsError::certificate)?;
            }
        }
        Ok(roots)
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let builder = ClientConfig::builder_with_provider(crate::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::config)?
            .with_root_certificates(self.root_store()?);

        let mut config = match &self.client_certificate {
            Some(material) => builder
                .with_client_auth_cert(material.certificate_chain().to_vec(), material.private_key().clone_key())
                .map_err(TlsError::certificate)?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols.clone_from(&self.alpn_protocols);
        Ok(Arc::new(config))
    }

    /// Starts a client session over an already connected transport.
    ///
    /// The session is returned with the handshake pending.
    pub fn connect<IO>(&self, io: IO) -> Result<TlsSession<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(self.hostname.clone())
            .map_err(|e| TlsError::config(format!("invalid server name {:?}: {e}", self.hostname)))?;
        let connector = TlsConnector::from(self.client_config()?);
        Ok(TlsSession::connecting(connector.connect(server_name, io), self.hostname.clone()))
    }
}

/// Dials `hostname:port` and starts a client session over it.
pub async fn connect_tls(config: &ClientTlsConfig) -> Result<TlsSession<TcpStream>, TlsError> {
    let stream = TcpStream::connect((config.hostname(), config.port())).await?;
    stream.set_nodelay(true)?;
    debug!(hostname = config.hostname(), port = config.port(), "connected, tls handshake pending");
    config.connect(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_web_pki_roots() {
        let config = ClientTlsConfig::new("example.com", 443);
        assert!(!config.root_store().unwrap().is_empty());
    }

    #[test]
    fn explicit_ca_replaces_default_roots() {
        let config = ClientTlsConfig::new("host.example", 443).with_ca_pem(include_bytes!("../tests/fixtures/ca.pem")).unwrap();
        assert_eq!(config.root_store().unwrap().len(), 1);
    }

    #[test]
    fn ca_pem_without_certificates_is_rejected() {
        let error = ClientTlsConfig::new("host.example", 443).with_ca_pem(b"not a pem").unwrap_err();
        assert!(matches!(error, TlsError::Certificate { .. }));
    }

    #[test]
    fn invalid_server_name_is_a_config_error() {
        let (io, _peer) = tokio::io::duplex(64);
        let error = ClientTlsConfig::new("not a hostname", 443).connect(io).unwrap_err();
        assert!(matches!(error, TlsError::Config { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let error = connect_tls(&ClientTlsConfig::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(error, TlsError::Connection { .. }));
    }
}
