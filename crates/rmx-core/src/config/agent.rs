//! Remote agent configuration

use std::time::Duration;

/// Runtime settings of the remote agent, resolved from flags and environment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interface to bind; loopback so only tunnels reach it
    pub bind_address: String,

    /// Listening port
    pub port: u16,

    /// Shut down after this long without any request or stream traffic
    pub idle_timeout: Duration,

    /// Whether idle shutdown is enabled at all
    pub idle_shutdown: bool,

    /// Shell used when a terminal request names none
    pub default_shell: Option<String>,

    /// Extra environment applied to every spawned shell
    pub session_env: Vec<(String, String)>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7777,
            idle_timeout: Duration::from_secs(30 * 60),
            idle_shutdown: true,
            default_shell: None,
            session_env: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// `bind_address:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Idle window, or `None` when idle shutdown is disabled
    pub fn effective_idle_timeout(&self) -> Option<Duration> {
        if self.idle_shutdown && !self.idle_timeout.is_zero() {
            Some(self.idle_timeout)
        } else {
            None
        }
    }
}
