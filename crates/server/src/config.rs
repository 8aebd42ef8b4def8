//! The `portico` configuration file.
//!
//! ```toml
//! log_level = "info"
//!
//! [[listeners]]
//! hostname = "127.0.0.1"
//! port = 8443
//! reuse_port = false
//! alpn_protocols = ["http/1.1"]
//!
//! [listeners.tls]
//! certificate_file = "cert.pem"
//! key_file = "key.pem"
//!
//! [listeners.tls.sni."host.example"]
//! certificate_file = "host.pem"
//! key_file = "host.key"
//! ```
//!
//! A listener without a `tls` table serves plain TCP. Relative file paths are
//! resolved against the directory of the configuration file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portico_tls::{CertificateMaterial, SniMap, TlsListenerConfig};
use serde::Deserialize;
use tracing::Level;

use crate::ServerError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub hostname: String,
    pub port: u16,

    #[serde(default)]
    pub reuse_port: bool,

    pub backlog: Option<u32>,

    #[serde(default = "default_alpn_protocols")]
    pub alpn_protocols: Vec<String>,

    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    /// per server name material, looked up before the default
    #[serde(default)]
    pub sni: BTreeMap<String, CertificateFiles>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateFiles {
    pub certificate_file: PathBuf,
    pub key_file: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_alpn_protocols() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

impl ServerConfig {
    /// Parses and validates a configuration. Relative paths stay as written.
    pub fn from_toml(content: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = toml::from_str(content).map_err(ServerError::config)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration file, resolving relative paths against its directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::config(format!("failed to read {}: {e}", path.display())))?;

        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn log_level(&self) -> Result<Level, ServerError> {
        self.log_level.parse().map_err(|e| ServerError::config(format!("invalid log_level {:?}: {e}", self.log_level)))
    }

    fn validate(&self) -> Result<(), ServerError> {
        self.log_level()?;
        if self.listeners.is_empty() {
            return Err(ServerError::config("at least one listener is required"));
        }
        for listener in &self.listeners {
            listener.validate()?;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        for tls in self.listeners.iter_mut().filter_map(|listener| listener.tls.as_mut()) {
            tls.certificate_file.iter_mut().for_each(resolve);
            tls.key_file.iter_mut().for_each(resolve);
            for files in tls.sni.values_mut() {
                resolve(&mut files.certificate_file);
                resolve(&mut files.key_file);
            }
        }
    }
}

impl ListenerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.hostname.is_empty() {
            return Err(ServerError::config("listener hostname must not be empty"));
        }
        if self.alpn_protocols.iter().any(String::is_empty) {
            return Err(ServerError::config(format!("listener {} has an empty alpn protocol", self.address())));
        }

        let Some(tls) = &self.tls else {
            return Ok(());
        };
        match (&tls.certificate_file, &tls.key_file) {
            (Some(_), Some(_)) => Ok(()),
            (None, None) if !tls.sni.is_empty() => Ok(()),
            (None, None) => Err(ServerError::config(format!("tls listener {} has no certificate", self.address()))),
            _ => Err(ServerError::config(format!(
                "tls listener {} needs both certificate_file and key_file",
                self.address()
            ))),
        }
    }

    /// Loads the certificate material; `None` for a plain TCP listener.
    pub fn tls_listener_config(&self) -> Result<Option<TlsListenerConfig>, ServerError> {
        let Some(tls) = &self.tls else {
            return Ok(None);
        };

        let mut builder = TlsListenerConfig::builder()
            .hostname(self.hostname.as_str())
            .port(self.port)
            .reuse_port(self.reuse_port)
            .alpn_protocols(self.alpn_protocols.iter().map(|protocol| protocol.as_bytes().to_vec()).collect());

        if let Some(backlog) = self.backlog {
            builder = builder.backlog(backlog);
        }

        if let (Some(certificate_file), Some(key_file)) = (&tls.certificate_file, &tls.key_file) {
            builder = builder.certificate(CertificateMaterial::from_pem_files(certificate_file, key_file)?);
        }

        if !tls.sni.is_empty() {
            let mut sni = SniMap::new();
            for (server_name, files) in &tls.sni {
                sni.insert(server_name, CertificateMaterial::from_pem_files(&files.certificate_file, &files.key_file)?);
            }
            builder = builder.resolver(Arc::new(sni));
        }

        Ok(Some(builder.build()?))
    }
}
