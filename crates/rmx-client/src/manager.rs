//! Connection registry
//!
//! The manager is the only process-wide mutable state of the control
//! plane. Connections are registered lazily and driven by id; lifecycle
//! events from every connection go out on one broadcast channel.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use rmx_core::config::{ClientConfig, ConnectionConfig};
use rmx_core::{ConnectError, ConnectionId, ConnectionState};

use crate::agent_client::AgentClient;
use crate::connection::{Connection, ConnectionEvent, RemoteAgentRecord, EVENT_CHANNEL_CAPACITY};
use crate::deploy::{DeployReport, Deployer};
use crate::error::{DeployError, TunnelError};
use crate::tunnel::Tunnel;

/// Snapshot of one connection for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
    pub tunnels: Vec<u16>,
    pub agent: Option<RemoteAgentRecord>,
}

impl ConnectionSummary {
    fn of(connection: &Connection) -> Self {
        let config = connection.config();
        Self {
            id: connection.id().clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            state: connection.state(),
            last_error: connection.last_error().map(|e| e.to_string()),
            reconnect_attempt: connection.reconnect_attempt(),
            tunnels: connection.tunnels().iter().map(|t| t.local_port()).collect(),
            agent: connection.agent_record(),
        }
    }
}

/// Registry of connections keyed by id
pub struct ConnectionManager {
    settings: Arc<ClientConfig>,
    connections: DashMap<ConnectionId, Connection>,
    events: broadcast::Sender<ConnectionEvent>,
    deployer: Deployer,
}

impl ConnectionManager {
    pub fn new(settings: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let deployer = Deployer::new(settings.deploy.clone());
        Self {
            settings: Arc::new(settings),
            connections: DashMap::new(),
            events,
            deployer,
        }
    }

    pub fn settings(&self) -> &ClientConfig {
        &self.settings
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    /// Register a connection without connecting it
    pub fn create(&self, config: ConnectionConfig) -> Result<ConnectionId, ConnectError> {
        let connection =
            Connection::with_events(config, Arc::clone(&self.settings), self.events.clone())?;
        let id = connection.id().clone();

        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => Err(ConnectError::InvalidConfig(format!(
                "connection id '{}' already registered",
                id
            ))),
            Entry::Vacant(slot) => {
                tracing::info!(
                    connection_id = %id,
                    "Registered {}@{}",
                    connection.config().username,
                    connection.config().address()
                );
                slot.insert(connection);
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    fn require(&self, id: &ConnectionId) -> Result<Connection, ConnectError> {
        self.get(id).ok_or_else(|| ConnectError::NotFound(id.clone()))
    }

    pub fn list(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<_> = self
            .connections
            .iter()
            .map(|entry| ConnectionSummary::of(entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        summaries
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Lifecycle events of every registered connection
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self, id: &ConnectionId) -> Result<(), ConnectError> {
        self.require(id)?.connect().await
    }

    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), ConnectError> {
        self.require(id)?.disconnect().await;
        Ok(())
    }

    /// Disconnect and forget a connection
    pub async fn remove(&self, id: &ConnectionId) -> Result<(), ConnectError> {
        let (_, connection) = self
            .connections
            .remove(id)
            .ok_or_else(|| ConnectError::NotFound(id.clone()))?;
        connection.disconnect().await;
        let _ = self.events.send(ConnectionEvent::Removed { id: id.clone() });
        tracing::info!(connection_id = %id, "Removed connection");
        Ok(())
    }

    /// Disconnect everything, e.g. on shutdown
    pub async fn disconnect_all(&self) {
        let connections: Vec<Connection> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        for connection in connections {
            connection.disconnect().await;
        }
    }

    pub async fn open_tunnel(
        &self,
        id: &ConnectionId,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        self.require(id)?
            .open_tunnel(local_port, remote_host, remote_port)
            .await
    }

    /// Make sure the agent is running behind `id`. Cancelled if the
    /// connection is closed meanwhile.
    pub async fn ensure_agent(&self, id: &ConnectionId) -> Result<DeployReport, DeployError> {
        let connection = self.require(id)?;
        let state = connection.state();
        if state != ConnectionState::Connected {
            return Err(ConnectError::NotConnected { state }.into());
        }
        let cancel = connection.lifetime_token();
        self.deployer
            .ensure_agent_running(Arc::new(connection), cancel)
            .await
    }

    /// Client for the agent behind `id`, if the deployer last found it healthy
    pub async fn agent_endpoint(&self, id: &ConnectionId) -> Option<AgentClient> {
        let connection = self.get(id)?;
        if connection.state() != ConnectionState::Connected {
            return None;
        }
        if !connection.agent_record().map(|r| r.healthy).unwrap_or(false) {
            return None;
        }
        match connection.agent_tunnel(self.settings.deploy.agent_port).await {
            Ok(tunnel) => Some(AgentClient::for_local_port(tunnel.local_port())),
            Err(e) => {
                tracing::warn!(connection_id = %id, "Agent tunnel unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_core::config::Credentials;

    fn config(id: &str) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("secret"))
            .with_id(id)
            .with_port(1)
    }

    #[test]
    fn test_create_is_lazy_and_unique() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let id = manager.create(config("alpha")).unwrap();
        assert_eq!(id.as_str(), "alpha");
        assert_eq!(
            manager.get(&id).unwrap().state(),
            ConnectionState::Disconnected
        );

        let err = manager.create(config("alpha")).unwrap_err();
        assert!(matches!(err, ConnectError::InvalidConfig(_)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let bad = ConnectionConfig::new("", "dev", Credentials::password("x"));
        assert!(matches!(
            manager.create(bad),
            Err(ConnectError::InvalidConfig(_))
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_list_sorted_summaries() {
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.create(config("beta")).unwrap();
        manager.create(config("alpha")).unwrap();

        let list = manager.list();
        let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "beta"]);
        assert!(list.iter().all(|s| s.agent.is_none() && s.tunnels.is_empty()));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let missing = ConnectionId::new("missing");
        assert!(matches!(
            manager.connect(&missing).await,
            Err(ConnectError::NotFound(_))
        ));
        assert!(manager.agent_endpoint(&missing).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_emits_event() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let id = manager.create(config("gamma")).unwrap();
        let mut events = manager.subscribe();

        manager.remove(&id).await.unwrap();
        assert!(manager.get(&id).is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event, ConnectionEvent::Removed { id: id.clone() });
        assert!(manager.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_deploy_requires_connected() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let id = manager.create(config("delta")).unwrap();
        let err = manager.ensure_agent(&id).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Connection(ConnectError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }
}
