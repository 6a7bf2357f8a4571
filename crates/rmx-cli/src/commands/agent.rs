//! Run the session agent in the foreground

use std::time::Duration;

use anyhow::Result;

use rmx_core::config::AgentConfig;

/// Flags for `remux agent`; the same environment the deployer sets
#[derive(Debug, Clone, clap::Args)]
pub struct AgentArgs {
    /// Port to listen on
    #[arg(long, env = "RMX_AGENT_PORT", default_value_t = 7777)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "RMX_AGENT_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Minutes without activity before the agent exits
    #[arg(long, env = "RMX_AGENT_IDLE_TIMEOUT_MINUTES", default_value_t = 30)]
    pub idle_timeout_minutes: u64,

    /// Exit after the idle timeout
    #[arg(
        long,
        env = "RMX_AGENT_IDLE_SHUTDOWN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub idle_shutdown: bool,

    /// Shell for terminals that do not request one
    #[arg(long, env = "RMX_AGENT_SHELL")]
    pub shell: Option<String>,
}

impl From<AgentArgs> for AgentConfig {
    fn from(args: AgentArgs) -> Self {
        AgentConfig {
            bind_address: args.bind,
            port: args.port,
            idle_timeout: Duration::from_secs(args.idle_timeout_minutes * 60),
            idle_shutdown: args.idle_shutdown,
            default_shell: args.shell,
            ..AgentConfig::default()
        }
    }
}

pub async fn agent_command(args: AgentArgs) -> Result<()> {
    let config = AgentConfig::from(args);
    tracing::info!(
        address = %config.listen_address(),
        idle_timeout = ?config.effective_idle_timeout(),
        "Starting agent"
    );
    rmx_agent::run(config).await
}
