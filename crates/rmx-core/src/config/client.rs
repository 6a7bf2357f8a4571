//! Local control-plane configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the local control plane (connections, tunnels, deployer)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reconnection backoff
    pub backoff: BackoffConfig,

    /// Interval between health probes on a connected session
    #[serde(with = "duration_secs")]
    pub health_probe_interval: Duration,

    /// How long a probe may take before the connection is considered lost
    #[serde(with = "duration_secs")]
    pub health_probe_timeout: Duration,

    /// Give up and enter the error state after this many failed retries
    pub max_reconnect_attempts: Option<u32>,

    /// Remote agent deployment settings
    pub deploy: DeployConfig,

    /// Named host profiles (no secrets; keys are read from `identity_file`)
    pub hosts: HashMap<String, HostProfile>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            health_probe_interval: Duration::from_secs(15),
            health_probe_timeout: Duration::from_secs(5),
            max_reconnect_attempts: None,
            deploy: DeployConfig::default(),
            hosts: HashMap::new(),
        }
    }
}

/// Exponential backoff configuration
///
/// Delay for attempt `n` (0-indexed) is `min(initial * multiplier^n, max)`,
/// optionally stretched by up to `jitter * delay` and then clamped to `max` again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Upper bound on any delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0); 0 keeps delays deterministic
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Minimum runtime the remote host must provide for the agent binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeRequirement {
    /// Human-readable name used in logs and errors
    pub name: String,
    /// Shell command whose output contains the version number
    pub command: String,
    /// Minimum acceptable dotted version
    pub min_version: String,
}

impl Default for RuntimeRequirement {
    fn default() -> Self {
        Self {
            name: "glibc".to_string(),
            command: "ldd --version 2>&1 | head -n 1".to_string(),
            min_version: "2.17".to_string(),
        }
    }
}

/// Remote agent deployment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Local directory holding the agent files to upload
    pub bundle_dir: PathBuf,

    /// Remote install directory, relative to the login user's home
    pub remote_dir: String,

    /// Executable inside `remote_dir` that starts the agent
    pub entry_point: String,

    /// Port the agent listens on (loopback of the remote host)
    pub agent_port: u16,

    /// Directory names skipped during upload (dependency caches)
    pub exclude: Vec<String>,

    /// Optional remote command run inside `remote_dir` after upload
    pub install_command: Option<String>,

    /// Runtime version check performed before any install
    pub runtime: RuntimeRequirement,

    /// Health checks attempted after starting the agent
    pub health_retries: u32,

    /// Delay between post-start health checks
    #[serde(with = "duration_millis")]
    pub health_retry_delay: Duration,

    /// Timeout for short remote commands (checks, chmod, start)
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Idle shutdown passed to the agent on start, in minutes (0 disables)
    pub agent_idle_timeout_minutes: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            bundle_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("remux")
                .join("agent-bundle"),
            remote_dir: ".remux/agent".to_string(),
            entry_point: "rmx-agent".to_string(),
            agent_port: 7777,
            exclude: vec!["target".to_string(), ".cache".to_string()],
            install_command: None,
            runtime: RuntimeRequirement::default(),
            health_retries: 10,
            health_retry_delay: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
            agent_idle_timeout_minutes: 30,
        }
    }
}

/// A saved host entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Private key file to authenticate with
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    super::DEFAULT_SSH_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_defaults_match_policy() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(30));
        assert_eq!(backoff.jitter, 0.0);
    }

    #[test]
    fn test_host_profile_default_port() {
        let profile: HostProfile = toml::from_str("host = \"build.example.com\"").unwrap();
        assert_eq!(profile.port, 22);
        assert!(profile.identity_file.is_none());
    }

    #[test]
    fn test_deploy_excludes_caches() {
        let deploy = DeployConfig::default();
        assert!(deploy.exclude.iter().any(|e| e == "target"));
        assert_eq!(deploy.agent_port, 7777);
    }
}
