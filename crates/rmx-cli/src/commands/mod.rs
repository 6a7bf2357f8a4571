//! CLI command implementations

mod agent;
mod deploy;
mod forward;
mod proxy;
mod sessions;
mod shell;

pub use agent::{agent_command, AgentArgs};
pub use deploy::deploy_command;
pub use forward::{forward_command, parse_forward};
pub use proxy::proxy_command;
pub use sessions::sessions_command;
pub use shell::{key_to_text, shell_command, ShellOutcome};

use std::path::Path;

use anyhow::{Context, Result};

use rmx_client::ConnectionManager;
use rmx_core::config::{self, ClientConfig};
use rmx_core::{ConfigError, ConnectionId};

use crate::output::{format_event, print_info};
use crate::target::{connection_config, AuthArgs};

/// Load the client configuration.
///
/// An explicitly named file must exist; a missing default file means defaults.
pub fn load_settings(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => match config::load_config(&config::default_config_path()) {
            Ok(settings) => Ok(settings),
            Err(ConfigError::NotFound(_)) => Ok(ClientConfig::default()),
            Err(e) => Err(e).context("Failed to load default config"),
        },
    }
}

/// Register `target` with `manager` and connect it, echoing reconnect
/// progress to stderr for as long as the manager lives
pub(crate) async fn open_connection(
    manager: &ConnectionManager,
    target: &str,
    auth: &AuthArgs,
) -> Result<ConnectionId> {
    let config = connection_config(target, auth, manager.settings())?;
    let endpoint = format!("{}@{}:{}", config.username, config.host, config.port);
    let id = manager.create(config)?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!("{}", format_event(&event));
            if matches!(event, rmx_client::ConnectionEvent::Retrying { .. }) {
                print_info(&format_event(&event));
            }
        }
    });

    print_info(&format!("Connecting to {}...", endpoint));
    manager
        .connect(&id)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    Ok(id)
}
