//! Common error types for sitesync.

use std::io::ErrorKind;
use thiserror::Error;

/// Top-level error type for sitesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket-level failure on the transport connection.
    #[error("Network error ({kind:?}): {message}")]
    Network { kind: ErrorKind, message: String },

    /// The server answered a command with a failure reply code.
    #[error("Server replied {code}: {message}")]
    Reply { code: u16, message: String },

    /// No live transport connection.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Remote resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote operation refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A queued local file disappeared before it could be transferred.
    #[error("Local file vanished: {0}")]
    Vanished(String),

    /// An exclusive operation is already running.
    #[error("Busy: {0}")]
    Busy(String),

    /// Requested feature is not available in this build.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The service loop is no longer running.
    #[error("Service stopped: {0}")]
    Stopped(String),
}

impl Error {
    /// Wrap a socket error raised by a transport.
    ///
    /// Local filesystem errors should use [`Error::Io`] instead so that they
    /// are never mistaken for a dropped connection.
    pub fn network(err: std::io::Error) -> Self {
        Self::Network {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Check whether this error reports a missing remote resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
