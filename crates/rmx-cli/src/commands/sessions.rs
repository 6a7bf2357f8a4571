//! List or kill the terminals hosted by a remote agent

use anyhow::{Context, Result};

use rmx_client::ConnectionManager;
use rmx_core::config::ClientConfig;

use crate::output::{format_terminals, print_success};
use crate::target::AuthArgs;

pub async fn sessions_command(
    settings: ClientConfig,
    target: &str,
    auth: &AuthArgs,
    kill: &[String],
    json: bool,
) -> Result<()> {
    let manager = ConnectionManager::new(settings);
    let id = super::open_connection(&manager, target, auth).await?;

    let result = async {
        manager.ensure_agent(&id).await?;
        let client = manager
            .agent_endpoint(&id)
            .await
            .context("Agent is not reachable")?;

        for terminal in kill {
            client
                .delete_terminal(terminal)
                .await
                .with_context(|| format!("Failed to kill terminal {}", terminal))?;
            print_success(&format!("Killed terminal {}", terminal));
        }
        if !kill.is_empty() {
            return Ok(());
        }

        let terminals = client.list_terminals().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&terminals)?);
        } else {
            println!("{}", format_terminals(&terminals));
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    manager.disconnect_all().await;
    result
}
