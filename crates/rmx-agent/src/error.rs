//! Agent error type and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by the agent's control surface
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to spawn terminal: {0}")]
    Spawn(String),

    #[error("Terminal {0} is closed")]
    TerminalClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::WorkspaceNotFound(_) | Self::TerminalNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::TerminalClosed(_) => StatusCode::GONE,
            Self::Spawn(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::debug!("{}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AgentError::WorkspaceNotFound("w".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AgentError::InvalidRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AgentError::Spawn("no pty".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
