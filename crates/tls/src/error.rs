use std::io;
use thiserror::Error;

/// Failures of the TLS front end.
///
/// Handshake I/O errors coming out of `tokio-rustls` are classified by
/// [`TlsError::from_io`]: certificate verification problems become
/// [`TlsError::Certificate`], other protocol failures [`TlsError::Handshake`]
/// and plain transport failures [`TlsError::Connection`].
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connection error: {source}")]
    Connection {
        #[from]
        source: io::Error,
    },

    #[error("certificate error: {reason}")]
    Certificate { reason: String },

    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("invalid tls config: {reason}")]
    Config { reason: String },
}

impl TlsError {
    pub fn bind<S: ToString>(address: S, source: io::Error) -> Self {
        Self::Bind { address: address.to_string(), source }
    }

    pub fn certificate<S: ToString>(str: S) -> Self {
        Self::Certificate { reason: str.to_string() }
    }

    pub fn handshake<S: ToString>(str: S) -> Self {
        Self::Handshake { reason: str.to_string() }
    }

    pub fn config<S: ToString>(str: S) -> Self {
        Self::Config { reason: str.to_string() }
    }

    /// Classifies an I/O error raised while a handshake was in flight.
    pub fn from_io(e: io::Error) -> Self {
        let Some(tls_error) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) else {
            return Self::Connection { source: e };
        };

        match tls_error {
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => Self::certificate(tls_error),
            rustls::Error::AlertReceived(alert) if is_certificate_alert(*alert) => Self::certificate(tls_error),
            _ => Self::handshake(tls_error),
        }
    }

    /// Returns true for a failed bind whose cause is an address already taken.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

fn is_certificate_alert(alert: rustls::AlertDescription) -> bool {
    use rustls::AlertDescription as A;
    matches!(
        alert,
        A::BadCertificate
            | A::UnsupportedCertificate
            | A::CertificateRevoked
            | A::CertificateExpired
            | A::CertificateUnknown
            | A::UnknownCA
            | A::CertificateRequired
    )
}
