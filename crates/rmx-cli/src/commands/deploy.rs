//! Deploy command implementation

use anyhow::Result;

use rmx_client::ConnectionManager;
use rmx_core::config::ClientConfig;

use crate::output::{format_deploy, print_info, print_success};
use crate::target::AuthArgs;

/// Make sure the agent is installed and running on `target`.
///
/// The agent outlives this command; only the SSH session is closed.
pub async fn deploy_command(settings: ClientConfig, target: &str, auth: &AuthArgs) -> Result<()> {
    let manager = ConnectionManager::new(settings);
    let id = super::open_connection(&manager, target, auth).await?;

    print_info("Checking remote agent...");
    let result = manager.ensure_agent(&id).await;
    manager.disconnect_all().await;

    let report = result?;
    print_success(&format_deploy(&report));
    Ok(())
}
