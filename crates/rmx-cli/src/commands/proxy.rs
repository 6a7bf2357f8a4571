//! Transport proxy command implementation

use anyhow::Result;

use rmx_client::ProxyIpcServer;

use crate::output::print_success;

/// Serve the JSON-lines proxy on loopback until Ctrl+C
pub async fn proxy_command(port: u16) -> Result<()> {
    let server = ProxyIpcServer::bind(port).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping proxy");
            shutdown.cancel();
        }
    });

    print_success(&format!("Proxy listening on {}", addr));
    server.run().await
}
