//! SSH connections
//!
//! A [`Connection`] is registered lazily in `Disconnected` and only opens a
//! socket on [`Connection::connect`]. While connected a supervisor task
//! probes the session and, when a probe fails, reconnects with exponential
//! backoff. Tunnels keep their listeners across reconnects because they
//! resolve the live session per forwarded stream.

mod sftp;
mod shell;
mod ssh;
mod supervisor;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use rmx_core::config::{ClientConfig, ConnectionConfig};
use rmx_core::{ConnectError, ConnectionId, ConnectionState};

use crate::backoff::Backoff;
use crate::error::TunnelError;
use crate::tunnel::{BoxedStream, ForwardOpener, Tunnel, TunnelSpec};

pub use sftp::UploadFile;
pub use shell::{ShellChannel, ShellEvent, ShellWriter};
pub use ssh::{establish, tail, CommandOutput, SshSession};

/// Lifecycle events buffered per subscriber
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle events, for UIs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A state-machine edge was taken
    StateChanged {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
        attempt: u32,
        error: Option<String>,
    },
    /// A reconnect attempt failed; another is scheduled after `delay_ms`
    Retrying {
        id: ConnectionId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The connection was removed from its manager
    Removed { id: ConnectionId },
}

/// What the deployer last learned about the remote agent.
///
/// Cleared whenever the connection leaves `Connected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteAgentRecord {
    pub installed: bool,
    pub runtime_version: Option<String>,
    pub agent_version: Option<String>,
    pub last_health_check: Option<u64>,
    pub healthy: bool,
}

struct Status {
    state: ConnectionState,
    last_error: Option<ConnectError>,
    attempt: u32,
}

/// Slot holding the live session; swapped on reconnect
#[derive(Clone, Default)]
struct SessionSlot(Arc<RwLock<Option<Arc<SshSession>>>>);

impl SessionSlot {
    fn get(&self) -> Option<Arc<SshSession>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, session: Option<Arc<SshSession>>) -> Option<Arc<SshSession>> {
        std::mem::replace(
            &mut *self.0.write().unwrap_or_else(PoisonError::into_inner),
            session,
        )
    }
}

#[async_trait]
impl ForwardOpener for SessionSlot {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError> {
        let session = self.get().ok_or_else(|| TunnelError::Forward {
            host: host.to_string(),
            port,
            message: "no active session".to_string(),
        })?;
        let stream = open_direct(&session, host, port, originator)
            .await
            .map_err(|e| TunnelError::Forward {
                host: host.to_string(),
                port,
                message: e.to_string(),
            })?;
        Ok(stream)
    }
}

async fn open_direct(
    session: &SshSession,
    host: &str,
    port: u16,
    originator: SocketAddr,
) -> Result<BoxedStream, ConnectError> {
    let channel = session
        .channel_open_direct_tcpip(
            host,
            port as u32,
            originator.ip().to_string(),
            originator.port() as u32,
        )
        .await
        .map_err(|e| ConnectError::Channel(format!("direct-tcpip {}:{}: {}", host, port, e)))?;
    Ok(Box::new(channel.into_stream()))
}

struct Inner {
    id: ConnectionId,
    config: ConnectionConfig,
    settings: Arc<ClientConfig>,
    backoff: Backoff,
    status: Mutex<Status>,
    session: SessionSlot,
    events: broadcast::Sender<ConnectionEvent>,
    /// Cancelled by `disconnect`; replaced on the next `connect`
    lifetime: Mutex<CancellationToken>,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    agent_tunnel: tokio::sync::Mutex<Option<Arc<Tunnel>>>,
    agent: Mutex<Option<RemoteAgentRecord>>,
}

/// One SSH connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Validate and register a connection without opening a socket
    pub fn new(config: ConnectionConfig, settings: Arc<ClientConfig>) -> Result<Self, ConnectError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(config, settings, events)
    }

    /// Like [`Connection::new`], publishing events on a shared channel
    pub fn with_events(
        config: ConnectionConfig,
        settings: Arc<ClientConfig>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Result<Self, ConnectError> {
        config
            .validate()
            .map_err(|e| ConnectError::InvalidConfig(e.to_string()))?;
        let id = config
            .id
            .clone()
            .map(ConnectionId::new)
            .unwrap_or_else(ConnectionId::generate);

        let lifetime = CancellationToken::new();
        lifetime.cancel();

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                backoff: Backoff::from_config(&settings.backoff),
                config,
                settings,
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    attempt: 0,
                }),
                session: SessionSlot::default(),
                events,
                lifetime: Mutex::new(lifetime),
                tunnels: Mutex::new(Vec::new()),
                agent_tunnel: tokio::sync::Mutex::new(None),
                agent: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &Arc<ClientConfig> {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.status).state
    }

    /// Why the last connect or reconnect attempt failed
    pub fn last_error(&self) -> Option<ConnectError> {
        lock(&self.inner.status).last_error.clone()
    }

    /// Failed reconnect attempts since the last success
    pub fn reconnect_attempt(&self) -> u32 {
        lock(&self.inner.status).attempt
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Token cancelled when this connection is closed
    pub fn lifetime_token(&self) -> CancellationToken {
        lock(&self.inner.lifetime).clone()
    }

    /// Take a state-machine edge, emitting an event. Illegal edges are refused.
    fn transition(
        &self,
        status: &mut Status,
        to: ConnectionState,
        error: Option<&ConnectError>,
    ) -> bool {
        let from = status.state;
        if !from.can_transition_to(to) {
            tracing::debug!(connection_id = %self.inner.id, "Ignoring transition {} -> {}", from, to);
            return false;
        }
        status.state = to;
        if from == ConnectionState::Connected {
            *lock(&self.inner.agent) = None;
        }

        match error {
            Some(e) => tracing::warn!(connection_id = %self.inner.id, "{} -> {}: {}", from, to, e),
            None => tracing::info!(connection_id = %self.inner.id, "{} -> {}", from, to),
        }
        let _ = self.inner.events.send(ConnectionEvent::StateChanged {
            id: self.inner.id.clone(),
            from,
            to,
            attempt: status.attempt,
            error: error.map(|e| e.to_string()),
        });
        true
    }

    /// Connect and authenticate.
    ///
    /// Allowed from `Disconnected` or `Error`; a no-op when already
    /// connected. On success the health probe starts.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let token = {
            let mut status = lock(&self.inner.status);
            match status.state {
                ConnectionState::Connected => return Ok(()),
                state if !state.can_connect() => return Err(ConnectError::InProgress { state }),
                _ => {}
            }
            status.attempt = 0;
            self.transition(&mut status, ConnectionState::Connecting, None);

            let mut lifetime = lock(&self.inner.lifetime);
            if lifetime.is_cancelled() {
                *lifetime = CancellationToken::new();
            }
            lifetime.clone()
        };

        let result = tokio::select! {
            _ = token.cancelled() => Err(ConnectError::Cancelled),
            result = establish(&self.inner.config) => result,
        };

        let mut status = lock(&self.inner.status);
        match result {
            Ok(session) => {
                if token.is_cancelled() || status.state != ConnectionState::Connecting {
                    drop(status);
                    close_session(session);
                    return Err(ConnectError::Cancelled);
                }
                self.inner.session.replace(Some(session));
                status.last_error = None;
                status.attempt = 0;
                self.transition(&mut status, ConnectionState::Connected, None);
                drop(status);

                tokio::spawn(supervisor::run(
                    Arc::downgrade(&self.inner),
                    token,
                    self.inner.settings.health_probe_interval,
                ));
                Ok(())
            }
            Err(e) => {
                if status.state == ConnectionState::Connecting && !token.is_cancelled() {
                    status.last_error = Some(e.clone());
                    self.transition(&mut status, ConnectionState::Error, Some(&e));
                }
                Err(e)
            }
        }
    }

    /// Stop timers, close every tunnel and the session. Always ends in
    /// `Disconnected`; calling it again is harmless.
    pub async fn disconnect(&self) {
        self.lifetime_token().cancel();

        let tunnels: Vec<_> = lock(&self.inner.tunnels).drain(..).collect();
        let agent_tunnel = self.inner.agent_tunnel.lock().await.take();
        for tunnel in tunnels.iter().chain(agent_tunnel.iter()) {
            tunnel.close().await;
        }

        if let Some(session) = self.inner.session.replace(None) {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }

        let mut status = lock(&self.inner.status);
        status.attempt = 0;
        if status.state != ConnectionState::Disconnected {
            self.transition(&mut status, ConnectionState::Disconnected, None);
        }
        *lock(&self.inner.agent) = None;
    }

    /// The live session, if connected
    fn session(&self) -> Result<Arc<SshSession>, ConnectError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectError::NotConnected { state });
        }
        self.inner
            .session
            .get()
            .ok_or(ConnectError::NotConnected { state })
    }

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port` on the remote side
    pub async fn open_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TunnelError::NotConnected(state));
        }
        let tunnel = Tunnel::bind(
            Arc::new(self.inner.session.clone()),
            TunnelSpec::new(local_port, remote_host, remote_port),
            self.lifetime_token().child_token(),
        )
        .await?;
        lock(&self.inner.tunnels).push(Arc::clone(&tunnel));
        Ok(tunnel)
    }

    /// Close the tunnel bound to `local_port`
    pub async fn close_tunnel(&self, local_port: u16) -> bool {
        let tunnel = {
            let mut tunnels = lock(&self.inner.tunnels);
            let position = tunnels.iter().position(|t| t.local_port() == local_port);
            position.map(|i| tunnels.remove(i))
        };
        match tunnel {
            Some(tunnel) => {
                tunnel.close().await;
                true
            }
            None => false,
        }
    }

    /// Tunnels opened with [`Connection::open_tunnel`]
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        lock(&self.inner.tunnels).clone()
    }

    /// Local tunnel to the agent port on the remote loopback, created on first use
    pub async fn agent_tunnel(&self, agent_port: u16) -> Result<Arc<Tunnel>, TunnelError> {
        let mut slot = self.inner.agent_tunnel.lock().await;
        if let Some(tunnel) = slot.as_ref() {
            if !tunnel.is_closed() && tunnel.spec().remote_port == agent_port {
                return Ok(Arc::clone(tunnel));
            }
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TunnelError::NotConnected(state));
        }
        let tunnel = Tunnel::bind(
            Arc::new(self.inner.session.clone()),
            TunnelSpec::new(0, "127.0.0.1", agent_port),
            self.lifetime_token().child_token(),
        )
        .await?;
        if let Some(old) = slot.replace(Arc::clone(&tunnel)) {
            old.close().await;
        }
        Ok(tunnel)
    }

    /// Run a command and collect its output
    pub async fn exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectError> {
        let session = self.session()?;
        ssh::exec(&session, command, timeout).await
    }

    /// Start an interactive PTY shell on the session itself
    pub async fn open_shell(&self, size: rmx_protocol::TerminalSize) -> Result<ShellChannel, ConnectError> {
        let session = self.session()?;
        ShellChannel::open(&session, size).await
    }

    /// Open one forwarded stream to `host:port` as seen from the remote host
    pub async fn open_direct_stream(&self, host: &str, port: u16) -> Result<BoxedStream, ConnectError> {
        let session = self.session()?;
        open_direct(&session, host, port, SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Copy files to the remote host over SFTP
    pub async fn upload_files(&self, files: &[UploadFile]) -> Result<u64, ConnectError> {
        let session = self.session()?;
        sftp::upload(&session, files).await
    }

    /// Cached agent facts, `None` until the deployer has run since connecting
    pub fn agent_record(&self) -> Option<RemoteAgentRecord> {
        lock(&self.inner.agent).clone()
    }

    /// Store agent facts; ignored unless connected
    pub(crate) fn set_agent_record(&self, record: RemoteAgentRecord) {
        let status = lock(&self.inner.status);
        if status.state == ConnectionState::Connected {
            *lock(&self.inner.agent) = Some(record);
        }
    }
}

fn close_session(session: Arc<SshSession>) {
    tokio::spawn(async move {
        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_core::config::Credentials;

    fn settings() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::default())
    }

    fn refused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_new_is_lazy_and_validated() {
        let config = ConnectionConfig::new("example.com", "dev", Credentials::password("pw"))
            .with_id("box");
        let conn = Connection::new(config, settings()).unwrap();
        assert_eq!(conn.id().as_str(), "box");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.last_error().is_none());

        let bad = ConnectionConfig::new("", "dev", Credentials::password("pw"));
        assert!(matches!(
            Connection::new(bad, settings()),
            Err(ConnectError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_goes_through_connecting_to_error() {
        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"))
            .with_port(refused_port());
        let conn = Connection::new(config, settings()).unwrap();
        let mut events = conn.subscribe();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Network(_)));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.last_error().is_some());

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(
            first,
            ConnectionEvent::StateChanged {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connecting,
                ..
            }
        ));
        assert!(matches!(
            second,
            ConnectionEvent::StateChanged {
                from: ConnectionState::Connecting,
                to: ConnectionState::Error,
                error: Some(_),
                ..
            }
        ));

        // Explicit retry re-enters Connecting
        let _ = conn.connect().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::StateChanged {
                from: ConnectionState::Error,
                to: ConnectionState::Connecting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"))
            .with_port(refused_port());
        let conn = Connection::new(config, settings()).unwrap();
        let _ = conn.connect().await;

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_require_connected() {
        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"));
        let conn = Connection::new(config, settings()).unwrap();

        assert!(matches!(
            conn.open_tunnel(0, "127.0.0.1", 80).await,
            Err(TunnelError::NotConnected(ConnectionState::Disconnected))
        ));
        assert!(matches!(
            conn.exec("true", Some(Duration::from_secs(1))).await,
            Err(ConnectError::NotConnected { .. })
        ));
        assert!(conn.agent_record().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        // Accepts TCP but never completes a handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ConnectionConfig::new("127.0.0.1", "dev", Credentials::password("pw"))
            .with_port(port);
        let conn = Connection::new(config, settings()).unwrap();

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(matches!(
            conn.connect().await,
            Err(ConnectError::InProgress { .. })
        ));

        conn.disconnect().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Cancelled)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
