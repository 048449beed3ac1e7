//! Common error types for castlink.

use thiserror::Error;

/// Result type alias using castlink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for castlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, pipe, subprocess)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport-session library rejected an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// The other end of a channel or connection is gone
    #[error("closed: {0}")]
    Closed(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a closed error from any displayable type.
    pub fn closed(msg: impl std::fmt::Display) -> Self {
        Self::Closed(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
