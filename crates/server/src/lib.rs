//! The `portico` server: configuration, listeners and the accept loop that
//! hands each connection to the TLS front end and the HTTP/1.1 engine.

pub mod config;
mod error;
mod server;
mod welcome;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;
pub use welcome::welcome;
