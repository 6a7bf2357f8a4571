//! remux remote agent
//!
//! Hosts PTY sessions on the remote machine and serves them over a
//! loopback HTTP/WebSocket surface. Started detached by the deployer.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rmx_core::config::AgentConfig;

#[derive(Parser)]
#[command(name = "rmx-agent")]
#[command(about = "remux agent - hosts terminal sessions for remote clients")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "RMX_AGENT_PORT", default_value_t = 7777)]
    port: u16,

    /// Address to bind (keep loopback; clients arrive through SSH tunnels)
    #[arg(long, env = "RMX_AGENT_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Minutes without activity before the agent exits
    #[arg(long, env = "RMX_AGENT_IDLE_TIMEOUT_MINUTES", default_value_t = 30)]
    idle_timeout_minutes: u64,

    /// Exit after the idle timeout
    #[arg(
        long,
        env = "RMX_AGENT_IDLE_SHUTDOWN",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    idle_shutdown: bool,

    /// Shell for terminals that do not request one
    #[arg(long, env = "RMX_AGENT_SHELL")]
    shell: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig {
        bind_address: args.bind,
        port: args.port,
        idle_timeout: Duration::from_secs(args.idle_timeout_minutes * 60),
        idle_shutdown: args.idle_shutdown,
        default_shell: args.shell,
        ..AgentConfig::default()
    };

    tracing::info!("remux agent {} starting", env!("CARGO_PKG_VERSION"));
    rmx_agent::run(config).await
}
