use std::time::Duration;

use async_trait::async_trait;

use rmx_core::{ConnectError, ConnectionId};
use rmx_protocol::HealthResponse;

use super::RemoteHost;
use crate::agent_client::AgentClient;
use crate::connection::{CommandOutput, Connection, RemoteAgentRecord, UploadFile};

#[async_trait]
impl RemoteHost for Connection {
    fn id(&self) -> &ConnectionId {
        Connection::id(self)
    }

    async fn agent_health(&self, port: u16, timeout: Duration) -> Option<HealthResponse> {
        let tunnel = match self.agent_tunnel(port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::debug!(connection_id = %self.id(), "Agent tunnel unavailable: {}", e);
                return None;
            }
        };
        match AgentClient::for_local_port(tunnel.local_port())
            .health(timeout)
            .await
        {
            Ok(health) => Some(health),
            Err(e) => {
                tracing::debug!(connection_id = %self.id(), "Agent health check failed: {}", e);
                None
            }
        }
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectError> {
        Connection::exec(self, command, timeout).await
    }

    async fn upload(&self, files: &[UploadFile]) -> Result<u64, ConnectError> {
        self.upload_files(files).await
    }

    fn record(&self, record: RemoteAgentRecord) {
        self.set_agent_record(record);
    }
}
