//! Session registry
//!
//! Each session owns a PTY process, its viewer set, and a pump task that
//! decodes process output and broadcasts it. A session lives until its
//! process exits or it is deleted; it does not depend on any viewer.

use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use portable_pty::Child;
use tokio::sync::{mpsc, oneshot};

use rmx_core::time::current_time_millis;
use rmx_protocol::{TerminalInfo, TerminalSize, Utf8Decoder};

use super::multiplexer::{ExitInfo, ViewerHandle, ViewerId, ViewerSet};
use crate::error::AgentError;
use crate::pty::{self, PtyProcess, PtySpawnRequest, SpawnedPty};

/// Raw output chunks queued between the reader thread and the pump
const OUTPUT_QUEUE: usize = 64;

/// How long to keep draining output once the process has exited
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// How long a killed process gets to exit before viewers are closed anyway
const KILL_GRACE: Duration = Duration::from_secs(2);

/// What to spawn for a new session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub workspace_id: Option<String>,
    pub cwd: PathBuf,
    pub shell: Option<String>,
    pub size: TerminalSize,
}

/// One PTY-backed shell and its attached viewers
pub struct Session {
    id: String,
    workspace_id: Option<String>,
    cwd: PathBuf,
    shell: String,
    pid: u32,
    created_at: u64,
    last_activity: AtomicU64,
    size: Mutex<TerminalSize>,
    viewers: ViewerSet,
    process: PtyProcess,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> Option<&str> {
        self.workspace_id.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn size(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .store(current_time_millis(), Ordering::Relaxed);
    }

    /// Attach a viewer; the process is left untouched
    pub fn attach(&self) -> ViewerHandle {
        self.viewers.attach()
    }

    /// Detach one viewer; the session keeps running even with none left
    pub fn detach(&self, viewer: ViewerId) -> bool {
        self.viewers.detach(viewer)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.viewers.is_closed()
    }

    /// Write input verbatim, ordered with other writes and resizes
    pub fn write(&self, data: &str) -> Result<(), AgentError> {
        self.process
            .write(data.as_bytes())
            .map_err(|_| AgentError::TerminalClosed(self.id.clone()))?;
        self.touch();
        Ok(())
    }

    /// Change the terminal geometry
    pub fn resize(&self, size: TerminalSize) -> Result<(), AgentError> {
        let size = size.sanitized();
        self.process
            .resize(size)
            .map_err(|_| AgentError::TerminalClosed(self.id.clone()))?;
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
        self.touch();
        Ok(())
    }

    /// Snapshot for the control surface
    pub fn info(&self) -> TerminalInfo {
        let size = self.size();
        TerminalInfo {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            pid: self.pid,
            cwd: self.cwd.display().to_string(),
            shell: self.shell.clone(),
            cols: size.cols,
            rows: size.rows,
            created_at: self.created_at,
            last_activity: self.last_activity(),
            viewers: self.viewer_count(),
        }
    }

    fn emit(&self, decoder: &mut Utf8Decoder, chunk: &[u8]) {
        let text = decoder.push(chunk);
        if !text.is_empty() {
            self.touch();
            self.viewers.broadcast_output(&text);
        }
    }

    fn kill(self: &Arc<Self>) {
        self.process.kill();

        let session = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(KILL_GRACE).await;
                    if !session.is_closed() {
                        tracing::warn!(terminal_id = %session.id, "Process did not exit after kill");
                        session.viewers.broadcast_exit(ExitInfo::default());
                    }
                });
            }
            Err(_) => session.viewers.broadcast_exit(ExitInfo::default()),
        }
    }
}

/// Registry of live sessions
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    default_shell: Option<String>,
    env: Vec<(String, String)>,
}

impl SessionManager {
    pub fn new(default_shell: Option<String>, env: Vec<(String, String)>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_shell,
            env,
        }
    }

    /// Spawn a login shell and register it. Must run inside a tokio runtime.
    pub fn create(&self, spec: SessionSpec) -> Result<Arc<Session>, AgentError> {
        if !spec.cwd.is_dir() {
            return Err(AgentError::InvalidRequest(format!(
                "Working directory does not exist: {}",
                spec.cwd.display()
            )));
        }

        let shell = pty::resolve_shell(spec.shell.as_deref(), self.default_shell.as_deref());
        let shell = pty::validate_shell_path(&shell)
            .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
        let size = spec.size.sanitized();

        let SpawnedPty {
            process,
            reader,
            child,
        } = pty::spawn(PtySpawnRequest {
            shell: shell.clone(),
            cwd: spec.cwd.clone(),
            size,
            env: self.env.clone(),
            login: true,
        })
        .map_err(|e| AgentError::Spawn(format!("{:#}", e)))?;

        let now = current_time_millis();
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: spec.workspace_id,
            cwd: spec.cwd,
            shell,
            pid: process.pid(),
            created_at: now,
            last_activity: AtomicU64::new(now),
            size: Mutex::new(size),
            viewers: ViewerSet::new(),
            process,
        });

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (exit_tx, exit_rx) = oneshot::channel();
        spawn_reader(session.id.clone(), reader, output_tx)?;
        spawn_waiter(session.id.clone(), child, exit_tx)?;

        self.sessions
            .insert(session.id.clone(), Arc::clone(&session));
        tokio::spawn(pump(
            Arc::clone(&self.sessions),
            Arc::clone(&session),
            output_rx,
            exit_rx,
        ));

        tracing::info!(
            terminal_id = %session.id,
            pid = session.pid,
            "Terminal created"
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|r| Arc::clone(&r))
    }

    /// All sessions, oldest first
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Sessions belonging to one workspace, oldest first
    pub fn list_for_workspace(&self, workspace_id: &str) -> Vec<Arc<Session>> {
        self.list()
            .into_iter()
            .filter(|s| s.workspace_id() == Some(workspace_id))
            .collect()
    }

    /// Kill a session's process and close every viewer
    pub fn delete(&self, id: &str) -> Result<(), AgentError> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| AgentError::TerminalNotFound(id.to_string()))?;
        tracing::info!(terminal_id = %id, pid = session.pid, "Terminal deleted");
        session.kill();
        Ok(())
    }

    /// Delete every session of a workspace, returning how many were removed
    pub fn delete_workspace_sessions(&self, workspace_id: &str) -> usize {
        self.list_for_workspace(workspace_id)
            .iter()
            .filter(|s| self.delete(s.id()).is_ok())
            .count()
    }

    /// Kill everything and wait briefly for exits to reach viewers
    pub async fn shutdown_all(&self) {
        let sessions = self.list();
        if sessions.is_empty() {
            return;
        }
        tracing::info!("Terminating {} terminal(s)", sessions.len());
        for session in &sessions {
            self.sessions.remove(session.id());
            session.process.kill();
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while sessions.iter().any(|s| !s.is_closed()) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for session in sessions {
            session.viewers.broadcast_exit(ExitInfo::default());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(None, Vec::new())
    }
}

// Reader and waiter use plain threads: a read can block forever while a
// background job holds the PTY, and that must not stall runtime shutdown.
fn spawn_reader(
    id: String,
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<Vec<u8>>,
) -> Result<(), AgentError> {
    std::thread::Builder::new()
        .name(format!("pty-read-{}", &id[..8.min(id.len())]))
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(terminal_id = %id, "PTY read ended: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_waiter(
    id: String,
    mut child: Box<dyn Child + Send + Sync>,
    exit: oneshot::Sender<ExitInfo>,
) -> Result<(), AgentError> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", &id[..8.min(id.len())]))
        .spawn(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo {
                    exit_code: Some(status.exit_code() as i32),
                    signal: None,
                },
                Err(e) => {
                    tracing::warn!(terminal_id = %id, "Failed to wait for process: {}", e);
                    ExitInfo::default()
                }
            };
            let _ = exit.send(info);
        })?;
    Ok(())
}

async fn pump(
    sessions: Arc<DashMap<String, Arc<Session>>>,
    session: Arc<Session>,
    mut output: mpsc::Receiver<Vec<u8>>,
    mut exit: oneshot::Receiver<ExitInfo>,
) {
    let mut decoder = Utf8Decoder::new();

    let info = loop {
        tokio::select! {
            biased;
            chunk = output.recv() => match chunk {
                Some(chunk) => session.emit(&mut decoder, &chunk),
                None => break (&mut exit).await.unwrap_or_default(),
            },
            status = &mut exit => {
                // Output written just before exit may still be queued
                while let Ok(Some(chunk)) = tokio::time::timeout(EXIT_DRAIN, output.recv()).await {
                    session.emit(&mut decoder, &chunk);
                }
                break status.unwrap_or_default();
            }
        }
    };

    let tail = decoder.finish();
    if !tail.is_empty() {
        session.viewers.broadcast_output(&tail);
    }

    sessions.remove(&session.id);
    tracing::info!(
        terminal_id = %session.id,
        exit_code = ?info.exit_code,
        "Terminal exited"
    );
    session.viewers.broadcast_exit(info);
}
