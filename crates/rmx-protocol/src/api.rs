//! HTTP control-surface payloads
//!
//! JSON bodies for the agent's request/response endpoints. All field names
//! are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::message::TerminalSize;

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"` once the agent is accepting requests
    pub status: String,
    /// Agent build version
    #[serde(default)]
    pub version: Option<String>,
    /// Number of live terminals
    #[serde(default)]
    pub sessions: usize,
    /// Stream protocol version the agent speaks; absent from older agents
    #[serde(default)]
    pub protocol: Option<String>,
}

impl HealthResponse {
    /// Whether the agent reported itself ready
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Body of `POST /workspaces`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub path: String,
}

/// A named working directory on the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub path: String,
    /// Creation time, milliseconds since the UNIX epoch
    pub created_at: u64,
}

/// Body of `POST /workspaces/:id/terminals`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTerminalRequest {
    /// Shell to run as a login shell (agent default when absent)
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

impl CreateTerminalRequest {
    /// Requested geometry, falling back to 80x24 for missing dimensions
    pub fn size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize::new(
            self.cols.unwrap_or(default.cols),
            self.rows.unwrap_or(default.rows),
        )
        .sanitized()
    }
}

/// Response of `POST /workspaces/:id/terminals`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCreated {
    pub id: String,
    pub pid: u32,
}

/// Body of `POST /terminals/:id/resize`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Entry returned by `GET /terminals`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub workspace_id: Option<String>,
    pub pid: u32,
    pub cwd: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    pub last_activity: u64,
    /// Number of currently attached viewers
    pub viewers: usize,
}
