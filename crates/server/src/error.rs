use std::io;

use portico_tls::TlsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid config: {reason}")]
    Config { reason: String },

    #[error("tls error: {source}")]
    Tls {
        #[from]
        source: TlsError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ServerError {
    pub fn config<S: ToString>(str: S) -> Self {
        Self::Config { reason: str.to_string() }
    }
}
