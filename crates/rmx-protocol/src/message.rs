//! Terminal stream messages
//!
//! Every frame on `/terminals/:id/stream` is a JSON object tagged by a
//! `type` field. The agent sends `connected` once after the viewer is
//! attached, `data` for every chunk of process output, and a final `exit`
//! before closing the stream. Viewers send `input` and `resize`.
//!
//! Field names are camelCase on the wire (`terminalId`, `exitCode`).

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version string, reported by `GET /health`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Clamp zero dimensions to 1 so a PTY can always be allocated
    pub fn sanitized(self) -> Self {
        Self {
            cols: self.cols.max(1),
            rows: self.rows.max(1),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Messages sent from the agent to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Viewer attached to a running terminal
    #[serde(rename_all = "camelCase")]
    Connected { terminal_id: String, pid: u32 },

    /// Process output, decoded as text
    Data { data: String },

    /// Process exited; the sender closes the stream afterwards
    #[serde(rename_all = "camelCase")]
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },

    /// Request could not be handled (unknown terminal, malformed frame)
    Error { message: String },
}

/// Messages sent from a viewer to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Keystrokes to write to the process verbatim
    #[serde(alias = "data")]
    Input { data: String },

    /// New terminal geometry
    Resize { cols: u16, rows: u16 },
}

impl ServerMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ClientMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode from a binary frame carrying UTF-8 JSON
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotText)?;
        Self::from_json(text)
    }
}
