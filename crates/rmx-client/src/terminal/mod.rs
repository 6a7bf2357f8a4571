//! Client session adapter
//!
//! Every terminal request is routed once, at creation, and keeps that route
//! for its whole life:
//!
//! - `agent` when the connection has a healthy agent behind it
//! - `direct-shell` when the connection is up but has no agent
//! - `local` when the request names no connection
//!
//! Output produced before the renderer calls [`TerminalHandle::mark_ready`]
//! is queued and flushed in order.

mod backend;
mod buffer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use rmx_agent::session::{SessionManager, SessionSpec};
use rmx_core::{ConnectError, ConnectionId, ConnectionState};
use rmx_protocol::{CreateTerminalRequest, TerminalSize};

use crate::agent_client::AgentClient;
use crate::connection::Connection;
use crate::error::TerminalError;
use crate::manager::ConnectionManager;
use backend::Backend;

pub use buffer::EventSink;

/// How a terminal reaches its shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    Agent,
    DirectShell,
    Local,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RoutingMode::Agent => "agent",
            RoutingMode::DirectShell => "direct-shell",
            RoutingMode::Local => "local",
        })
    }
}

/// Delivered to the renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(String),
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    /// Transport trouble; the terminal may be unusable afterwards
    Error(String),
}

/// What the UI asks for
#[derive(Debug, Clone, Default)]
pub struct TerminalRequest {
    /// SSH-backed workspace; `None` for a local terminal
    pub connection: Option<ConnectionId>,
    /// Working directory on the target machine
    pub cwd: Option<String>,
    pub shell: Option<String>,
    pub size: TerminalSize,
}

enum Route {
    Agent(AgentClient),
    DirectShell(Connection),
    Local,
}

impl Route {
    fn mode(&self) -> RoutingMode {
        match self {
            Route::Agent(_) => RoutingMode::Agent,
            Route::DirectShell(_) => RoutingMode::DirectShell,
            Route::Local => RoutingMode::Local,
        }
    }
}

/// Opens terminals on behalf of the UI
pub struct SessionAdapter {
    manager: Arc<ConnectionManager>,
    local: Arc<SessionManager>,
}

impl SessionAdapter {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            local: Arc::new(SessionManager::default()),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Mode a request would be given right now
    pub async fn routing_mode(&self, request: &TerminalRequest) -> Result<RoutingMode, TerminalError> {
        Ok(self.route(request).await?.mode())
    }

    async fn route(&self, request: &TerminalRequest) -> Result<Route, TerminalError> {
        let Some(id) = &request.connection else {
            return Ok(Route::Local);
        };
        if let Some(client) = self.manager.agent_endpoint(id).await {
            return Ok(Route::Agent(client));
        }
        let connection = self
            .manager
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(id.clone()))?;
        match connection.state() {
            ConnectionState::Connected => Ok(Route::DirectShell(connection)),
            state => Err(ConnectError::NotConnected { state }.into()),
        }
    }

    /// Create a terminal. The route is decided here and never revisited.
    pub async fn open_terminal(
        &self,
        request: TerminalRequest,
    ) -> Result<TerminalHandle, TerminalError> {
        let route = self.route(&request).await?;
        let mode = route.mode();
        let size = request.size.sanitized();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (session_id, backend) = match route {
            Route::Agent(client) => {
                let path = request.cwd.as_deref().unwrap_or("~");
                let workspace = client.ensure_workspace(path).await?;
                let created = client
                    .create_terminal(
                        &workspace.id,
                        &CreateTerminalRequest {
                            shell: request.shell.clone(),
                            cols: Some(size.cols),
                            rows: Some(size.rows),
                        },
                    )
                    .await?;
                let backend = backend::connect_agent(&client, &created.id, events_tx).await?;
                (Some(created.id), backend)
            }
            Route::DirectShell(connection) => {
                let shell = connection.open_shell(size).await?;
                let (writer, shell_events) = shell.split();
                if let Some(cwd) = &request.cwd {
                    writer.write(format!("cd {}\n", quote(cwd)).into_bytes())?;
                }
                (None, backend::direct_shell(writer, shell_events, events_tx))
            }
            Route::Local => {
                let session = self
                    .local
                    .create(SessionSpec {
                        workspace_id: None,
                        cwd: local_cwd(request.cwd.as_deref()),
                        shell: request.shell.clone(),
                        size,
                    })
                    .map_err(|e| TerminalError::Local(e.to_string()))?;
                let viewer = session.attach();
                let id = session.id().to_string();
                let backend = backend::local(Arc::clone(&self.local), session, viewer, events_tx);
                (Some(id), backend)
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(buffer::pump(events_rx, ready_rx));

        let handle = TerminalHandle {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            session_id,
            backend,
            ready: Mutex::new(Some(ready_tx)),
            closed: AtomicBool::new(false),
        };
        tracing::info!(
            terminal_id = %handle.id,
            mode = %mode,
            session_id = ?handle.session_id,
            "Opened terminal"
        );
        Ok(handle)
    }

    /// Kill every local terminal, e.g. on shutdown
    pub async fn shutdown(&self) {
        self.local.shutdown_all().await;
    }
}

fn local_cwd(cwd: Option<&str>) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match cwd {
        Some("~") => home.unwrap_or_else(|| PathBuf::from(".")),
        Some(path) => match (path.strip_prefix("~/"), home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path),
        },
        None => home
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One UI terminal. Dropping it closes it.
pub struct TerminalHandle {
    id: String,
    mode: RoutingMode,
    session_id: Option<String>,
    backend: Backend,
    ready: Mutex<Option<oneshot::Sender<EventSink>>>,
    closed: AtomicBool,
}

impl TerminalHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Agent terminal id or local session id; `None` for direct shells
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send keystrokes
    pub fn write(&self, data: &str) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }
        self.backend.write(data)
    }

    pub fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }
        self.backend.resize(size)
    }

    /// The renderer is attached: flush queued output to `sink`, then stream
    pub fn mark_ready(&self, sink: EventSink) -> Result<(), TerminalError> {
        let ready = self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TerminalError::AlreadyReady)?;
        let _ = ready.send(sink);
        Ok(())
    }

    /// Close the terminal. Agent sessions are only detached and keep running.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(terminal_id = %self.id, mode = %self.mode, "Closing terminal");
        self.backend.close();
    }
}

impl Drop for TerminalHandle {
    fn drop(&mut self) {
        self.close();
    }
}
