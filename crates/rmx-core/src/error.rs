//! Core error types for remux

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ConnectionId, ConnectionState};

/// Top-level error type
#[derive(Error, Debug)]
pub enum RmxError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
///
/// Network and timeout failures are retried by the reconnection policy;
/// everything else needs an explicit retry from the caller.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    /// Connection config failed validation
    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    /// Handshake did not complete in time
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Server rejected every supplied credential
    #[error("Authentication failed for user '{username}'")]
    AuthenticationFailed { username: String },

    /// Private key could not be decoded
    #[error("Invalid private key: {0}")]
    Key(String),

    /// Host unreachable, refused, or transport dropped
    #[error("Network error: {0}")]
    Network(String),

    /// Operation requires a connected session
    #[error("Connection is {state}, not connected")]
    NotConnected { state: ConnectionState },

    /// `connect` called while an attempt is already running
    #[error("Connection attempt already in progress ({state})")]
    InProgress { state: ConnectionState },

    /// Unknown connection id
    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    /// Channel open/exec/request failed on a live session
    #[error("Channel error: {0}")]
    Channel(String),

    /// Remote command did not finish in time
    #[error("Remote command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Operation was cancelled by disconnect
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Whether the reconnection policy should retry after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Timeout(_)
                | ConnectError::Network(_)
                | ConnectError::Channel(_)
                | ConnectError::CommandTimeout(_)
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
