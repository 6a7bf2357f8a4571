//! russh client plumbing: handshake, authentication and remote commands

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;

use rmx_core::config::ConnectionConfig;
use rmx_core::ConnectError;

/// Authenticated SSH session handle
pub type SshSession = Handle<ClientHandler>;

/// Bytes kept from each output stream for logging
const TAIL_LINES: usize = 20;
const TAIL_BYTES: usize = 2048;

/// SSH client handler
///
/// Host keys are accepted and their fingerprint logged; there is no
/// known_hosts store.
pub struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.host,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// Open a TCP connection, complete the handshake and authenticate.
///
/// The whole sequence is bounded by the config's connect timeout, which is
/// reported as [`ConnectError::Timeout`] rather than an auth failure. With
/// both a key and a password configured the key is tried first.
pub async fn establish(config: &ConnectionConfig) -> Result<Arc<SshSession>, ConnectError> {
    let timeout = config.connect_timeout;
    match tokio::time::timeout(timeout, handshake(config)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

async fn handshake(config: &ConnectionConfig) -> Result<Arc<SshSession>, ConnectError> {
    let key = match &config.credentials.private_key {
        Some(pem) => Some(Arc::new(
            russh_keys::decode_secret_key(pem, config.credentials.passphrase.as_deref())
                .map_err(|e| ConnectError::Key(e.to_string()))?,
        )),
        None => None,
    };
    if key.is_none() && config.credentials.password.is_none() {
        return Err(ConnectError::InvalidConfig(
            "no private key or password supplied".to_string(),
        ));
    }

    let ssh_config = Arc::new(Config {
        inactivity_timeout: None,
        ..Config::default()
    });
    let handler = ClientHandler {
        host: config.host.clone(),
    };

    tracing::debug!("Connecting to {}", config.address());
    let mut session = client::connect(ssh_config, config.address(), handler)
        .await
        .map_err(|e| ConnectError::Network(format!("{}: {}", config.address(), e)))?;

    let mut authenticated = false;
    if let Some(key) = key {
        tracing::debug!("Trying public key authentication as '{}'", config.username);
        authenticated = session
            .authenticate_publickey(&config.username, key)
            .await
            .map_err(|e| ConnectError::Network(format!("authentication error: {}", e)))?;
    }
    if !authenticated {
        if let Some(password) = &config.credentials.password {
            tracing::debug!("Trying password authentication as '{}'", config.username);
            authenticated = session
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| ConnectError::Network(format!("authentication error: {}", e)))?;
        }
    }

    if !authenticated {
        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        return Err(ConnectError::AuthenticationFailed {
            username: config.username.clone(),
        });
    }

    Ok(Arc::new(session))
}

/// Result of a remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit status; `None` if the channel closed without reporting one
    pub exit_code: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last lines of stdout, for logs
    pub fn stdout_tail(&self) -> String {
        tail(&self.stdout)
    }

    /// Last lines of stderr, for logs
    pub fn stderr_tail(&self) -> String {
        tail(&self.stderr)
    }
}

/// Keep the last [`TAIL_LINES`] lines, at most [`TAIL_BYTES`] bytes
pub fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let joined = lines[start..].join("\n");
    if joined.len() <= TAIL_BYTES {
        return joined;
    }
    let mut cut = joined.len() - TAIL_BYTES;
    while !joined.is_char_boundary(cut) {
        cut += 1;
    }
    joined[cut..].to_string()
}

/// Run a command on its own session channel and collect its output.
///
/// Without a timeout the command runs until it exits or the caller drops
/// the future.
pub async fn exec(
    session: &SshSession,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ConnectError> {
    let Some(timeout) = timeout else {
        return exec_inner(session, command).await;
    };
    match tokio::time::timeout(timeout, exec_inner(session, command)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::CommandTimeout(timeout)),
    }
}

async fn exec_inner(session: &SshSession, command: &str) -> Result<CommandOutput, ConnectError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ConnectError::Channel(format!("open session: {}", e)))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ConnectError::Channel(format!("exec: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_core::config::Credentials;

    #[test]
    fn test_tail_keeps_last_lines() {
        let text: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        let tailed = tail(&text);
        assert!(tailed.starts_with("line 30"));
        assert!(tailed.ends_with("line 49"));
    }

    #[test]
    fn test_tail_caps_bytes() {
        let text = "x".repeat(10_000);
        assert_eq!(tail(&text).len(), TAIL_BYTES);
    }

    #[tokio::test]
    async fn test_invalid_key_is_key_error() {
        let config = ConnectionConfig::new(
            "127.0.0.1",
            "dev",
            Credentials::private_key("not a key", None),
        );
        assert!(matches!(establish(&config).await, Err(ConnectError::Key(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_host_times_out() {
        // Accepts TCP but never speaks SSH
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"))
            .with_port(port)
            .with_connect_timeout(Duration::from_millis(300));
        assert!(matches!(
            establish(&config).await,
            Err(ConnectError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"))
            .with_port(port);
        let err = establish(&config).await.err().unwrap();
        assert!(matches!(err, ConnectError::Network(_)));
        assert!(err.is_retryable());
    }
}
