//! Connection configuration

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default connection-establishment timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Opaque authentication material supplied by the caller
///
/// When both a private key and a password are present the key is tried
/// first.
#[derive(Clone, Default)]
pub struct Credentials {
    /// PEM/OpenSSH encoded private key
    pub private_key: Option<String>,
    /// Passphrase for `private_key`
    pub passphrase: Option<String>,
    /// Account password
    pub password: Option<String>,
}

impl Credentials {
    /// Key-only credentials
    pub fn private_key(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            private_key: Some(pem.into()),
            passphrase,
            password: None,
        }
    }

    /// Password-only credentials
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Whether any usable credential is present
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything needed to open one SSH session to one host
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Caller-assigned id; generated when absent
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    /// Bound on TCP connect + handshake + authentication
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a config with default port and timeout
    pub fn new(host: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            id: None,
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set an explicit connection id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` for socket connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the fields required before registration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingField("username".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}
