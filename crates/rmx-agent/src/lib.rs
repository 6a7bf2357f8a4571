//! rmx-agent: Remote session host for remux
//!
//! The agent runs on the remote machine, bound to loopback, and is reached
//! through an SSH tunnel. It owns PTY-backed terminal sessions that outlive
//! any single viewer, fans each session's output to every attached viewer,
//! and shuts itself down after a configurable idle window.

pub mod activity;
pub mod error;
pub mod pty;
pub mod server;
pub mod session;
pub mod state;
pub mod workspace;

use anyhow::Result;
use rmx_core::config::AgentConfig;

pub use error::AgentError;
pub use server::AgentServer;
pub use state::AgentState;

/// Run an agent until it is signalled or goes idle
pub async fn run(config: AgentConfig) -> Result<()> {
    let server = server::AgentServer::bind(config).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
