//! Error types for the control plane

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use rmx_core::{ConnectError, ConnectionState};

/// Tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Tunnels can only be opened on a connected session
    #[error("Cannot open tunnel: connection is {0}")]
    NotConnected(ConnectionState),

    /// Local listener could not be bound
    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Forwarded stream could not be opened through the session
    #[error("Failed to open forwarded stream to {host}:{port}: {message}")]
    Forward {
        host: String,
        port: u16,
        message: String,
    },

    #[error(transparent)]
    Connection(#[from] ConnectError),
}

/// Step of the agent deployment sequence, used to identify failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    HealthCheck,
    RuntimeCheck,
    InstalledCheck,
    PrepareBundle,
    CreateDirectory,
    Upload,
    InstallDependencies,
    MarkExecutable,
    WriteStamp,
    Start,
}

impl DeployStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStep::HealthCheck => "health-check",
            DeployStep::RuntimeCheck => "runtime-check",
            DeployStep::InstalledCheck => "installed-check",
            DeployStep::PrepareBundle => "prepare-bundle",
            DeployStep::CreateDirectory => "create-directory",
            DeployStep::Upload => "upload",
            DeployStep::InstallDependencies => "install-dependencies",
            DeployStep::MarkExecutable => "mark-executable",
            DeployStep::WriteStamp => "write-stamp",
            DeployStep::Start => "start",
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent deployment errors
///
/// Cloneable so that every caller awaiting a shared in-flight deployment
/// receives the same failure.
#[derive(Error, Debug, Clone)]
pub enum DeployError {
    /// Remote runtime missing or too old; not retried automatically
    #[error("Remote runtime check failed: {0}")]
    Runtime(String),

    /// An install step failed; a new deployment call may retry it
    #[error("Install step '{step}' failed: {message}")]
    Install { step: DeployStep, message: String },

    /// Agent started but never reported healthy
    #[error("Agent not healthy after {attempts} checks; log tail: {log_tail}")]
    Unhealthy { attempts: u32, log_tail: String },

    #[error(transparent)]
    Connection(#[from] ConnectError),

    /// The owning connection was closed mid-deployment
    #[error("Deployment cancelled")]
    Cancelled,
}

impl DeployError {
    pub(crate) fn install(step: DeployStep, message: impl Into<String>) -> Self {
        DeployError::Install {
            step,
            message: message.into(),
        }
    }
}

/// Transport proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Unknown proxy connection: {0}")]
    UnknownConnection(String),

    #[error("Proxy connection {0} is closed")]
    Closed(String),
}

/// Client terminal errors
#[derive(Error, Debug)]
pub enum TerminalError {
    #[error(transparent)]
    Connection(#[from] ConnectError),

    #[error("Agent request failed: {0}")]
    Agent(String),

    #[error("Failed to start local terminal: {0}")]
    Local(String),

    #[error("Terminal is closed")]
    Closed,

    #[error("Terminal already marked ready")]
    AlreadyReady,

    #[error("Stream handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for TerminalError {
    fn from(e: reqwest::Error) -> Self {
        TerminalError::Agent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_error_names_step() {
        let err = DeployError::install(DeployStep::Upload, "permission denied");
        assert_eq!(
            err.to_string(),
            "Install step 'upload' failed: permission denied"
        );
    }

    #[test]
    fn test_tunnel_not_connected_message() {
        let err = TunnelError::NotConnected(ConnectionState::Reconnecting);
        assert!(err.to_string().contains("reconnecting"));
    }
}
