//! Error types for observa
//!
//! Provides a unified error type used across all observa crates.

use std::path::PathBuf;

use observa_protocol::{CodecError, ParamError};

/// Main error type for observa operations
#[derive(Debug, thiserror::Error)]
pub enum ObservaError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timeout after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid parameters for {command}: {message}")]
    InvalidParams { command: String, message: String },

    #[error("Authorization failed for {0}")]
    AuthFailed(String),

    #[error("Parameter error: {0}")]
    Params(#[from] ParamError),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ObservaError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid-parameters error for a protocol command
    pub fn invalid_params(command: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::InvalidParams {
            command: command.into(),
            message: msg.to_string(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::Connection(_)
                | Self::ConnectionClosed
                | Self::Resolve { .. }
        )
    }

    /// Errors which end the peer session they occurred on
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Codec(_)
                | Self::ConnectionClosed
                | Self::ConnectionTimeout { .. }
                | Self::AuthFailed(_)
        )
    }
}

/// Result type alias using ObservaError
pub type Result<T> = std::result::Result<T, ObservaError>;
