//! Error types shared across the server core.

use crate::config::ConfigError;
use crate::protocol::CodecError;
use thiserror::Error;

/// Boxed error returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for fallible server operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for the server core.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or poller failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or marshalling failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Business-logic failure reported by a route handler.
    #[error("handler error: {0}")]
    Handler(BoxError),

    /// Schema names a protocol this build cannot accept.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Schema string could not be parsed.
    #[error("invalid schema '{0}': expected protocol://address")]
    InvalidSchema(String),

    /// `Server::run` was called without any listener.
    #[error("no listener configured, listen on one schema at least")]
    NoListener,
}
