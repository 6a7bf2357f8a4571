//! Port forwarding command implementation

use anyhow::{bail, Context, Result};

use rmx_client::{ConnectionManager, TunnelSpec};
use rmx_core::config::ClientConfig;

use crate::output::{print_info, print_success};
use crate::target::AuthArgs;

/// Parse `LOCAL:HOST:REMOTE` or `LOCAL:REMOTE` (host defaults to localhost)
pub fn parse_forward(text: &str) -> Result<TunnelSpec> {
    let parts: Vec<&str> = text.split(':').collect();
    let (local, host, remote) = match parts.as_slice() {
        [local, remote] => (*local, "localhost", *remote),
        [local, host, remote] if !host.is_empty() => (*local, *host, *remote),
        _ => bail!("invalid forward '{}', expected LOCAL:HOST:REMOTE", text),
    };
    let local = local
        .parse()
        .with_context(|| format!("invalid local port in '{}'", text))?;
    let remote: u16 = remote
        .parse()
        .with_context(|| format!("invalid remote port in '{}'", text))?;
    if remote == 0 {
        bail!("remote port must not be 0 in '{}'", text);
    }
    Ok(TunnelSpec::new(local, host, remote))
}

/// Open every forward, then hold them until Ctrl+C.
///
/// Listeners stay bound while the connection reconnects.
pub async fn forward_command(
    settings: ClientConfig,
    target: &str,
    auth: &AuthArgs,
    forwards: &[String],
) -> Result<()> {
    let specs = forwards
        .iter()
        .map(|f| parse_forward(f))
        .collect::<Result<Vec<_>>>()?;

    let manager = ConnectionManager::new(settings);
    let id = super::open_connection(&manager, target, auth).await?;

    for spec in &specs {
        let tunnel = manager
            .open_tunnel(&id, spec.local_port, &spec.remote_host, spec.remote_port)
            .await
            .with_context(|| {
                format!(
                    "Failed to forward {} to {}:{}",
                    spec.local_port, spec.remote_host, spec.remote_port
                )
            })?;
        print_success(&format!(
            "Forwarding {} -> {}:{}",
            tunnel.local_addr(),
            spec.remote_host,
            spec.remote_port
        ));
    }

    print_info("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    manager.disconnect_all().await;
    Ok(())
}
