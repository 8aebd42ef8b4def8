//! TLS termination for the portico front end.
//!
//! The server side accepts in two phases so that certificate material can be
//! chosen per connection from the ClientHello:
//!
//! 1. [`TlsAcceptor::read_client_hello`] reads only the ClientHello and
//!    returns a [`HelloReceived`] exposing its [`ClientHelloInfo`]
//! 2. [`HelloReceived::complete`] starts the handshake with the chosen
//!    [`CertificateMaterial`]
//!
//! [`TlsAcceptor::accept`] runs both phases, asking a [`CertificateResolver`]
//! (such as [`SniMap`]) when the client sent a server name and falling back to
//! the listener's static material.
//!
//! Sessions come back with the handshake still pending. A [`TlsSession`] is a
//! regular `AsyncRead + AsyncWrite` stream that finishes the handshake on first
//! use. The client side ([`connect_tls`]) works the same way.
//!
//! # Example
//!
//! ```no_run
//! use portico_tls::{CertificateMaterial, TlsListener, TlsListenerConfig};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run() -> Result<(), portico_tls::TlsError> {
//! let material = CertificateMaterial::from_pem_files("cert.pem", "key.pem")?;
//! let config = TlsListenerConfig::builder()
//!     .hostname("127.0.0.1")
//!     .port(8443)
//!     .alpn_protocol("http/1.1")
//!     .certificate(material)
//!     .build()?;
//!
//! let listener = TlsListener::bind(config).await?;
//! loop {
//!     let (mut session, _peer_addr) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = session.write_all(b"hello").await;
//!     });
//! }
//! # }
//! ```

mod acceptor;
mod client;
mod error;
mod listener;
mod material;
mod resolver;
mod session;

pub use acceptor::{ClientHelloInfo, HelloReceived, TlsAcceptor};
pub use client::{ClientTlsConfig, connect_tls};
pub use error::TlsError;
pub use listener::{TlsListener, TlsListenerConfig, TlsListenerConfigBuilder, bind_tcp};
pub use material::{CertificateMaterial, load_certificates};
pub use resolver::{CertificateResolver, SniMap};
pub use session::{Established, SessionStatus, TlsSession};

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
