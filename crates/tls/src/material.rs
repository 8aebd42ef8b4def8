use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;

use crate::TlsError;

/// A certificate chain plus its private key.
///
/// Built once from PEM input and never mutated afterwards.
#[derive(Debug)]
pub struct CertificateMaterial {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl Clone for CertificateMaterial {
    fn clone(&self) -> Self {
        Self { certificate_chain: self.certificate_chain.clone(), private_key: self.private_key.clone_key() }
    }
}

impl CertificateMaterial {
    pub fn new(certificate_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Result<Self, TlsError> {
        if certificate_chain.is_empty() {
            return Err(TlsError::certificate("empty certificate chain"));
        }
        Ok(Self { certificate_chain, private_key })
    }

    /// Parses a PEM certificate chain and a PEM private key.
    ///
    /// PKCS#1, PKCS#8 and SEC1 keys are accepted; the first key block wins.
    pub fn from_pem(certificate_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certificate_chain = load_certificates(certificate_pem)?;
        let private_key = load_private_key(key_pem)?;
        Self::new(certificate_chain, private_key)
    }

    pub fn from_pem_files(certificate_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let certificate_pem = read_file(certificate_path.as_ref())?;
        let key_pem = read_file(key_path.as_ref())?;
        Self::from_pem(&certificate_pem, &key_pem)
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Builds a server config presenting this material and offering `alpn_protocols`.
    pub fn server_config(&self, alpn_protocols: &[Vec<u8>]) -> Result<Arc<ServerConfig>, TlsError> {
        let mut config = ServerConfig::builder_with_provider(crate::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::config)?
            .with_no_client_auth()
            .with_single_cert(self.certificate_chain.clone(), self.private_key.clone_key())
            .map_err(TlsError::certificate)?;
        config.alpn_protocols = alpn_protocols.to_vec();
        Ok(Arc::new(config))
    }
}

/// Reads every certificate block of a PEM bundle, in order.
pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::certificate(format!("failed to parse certificates: {e}")))
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(pem);
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| TlsError::certificate(format!("failed to parse private key: {e}")))?;
        let key = match item {
            Item::Pkcs1Key(key) => PrivateKeyDer::Pkcs1(key),
            Item::Pkcs8Key(key) => PrivateKeyDer::Pkcs8(key),
            Item::Sec1Key(key) => PrivateKeyDer::Sec1(key),
            _ => continue,
        };
        return Ok(key);
    }
    Err(TlsError::certificate("no private key found"))
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| TlsError::certificate(format!("failed to read {}: {e}", path.display())))
}
