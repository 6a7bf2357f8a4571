//! Request/response handlers

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use rmx_protocol::{
    CreateTerminalRequest, CreateWorkspaceRequest, HealthResponse, ResizeRequest, TerminalCreated,
    TerminalInfo, TerminalSize, Workspace, PROTOCOL_VERSION,
};

use crate::error::AgentError;
use crate::session::SessionSpec;
use crate::state::AgentState;

type Shared = State<Arc<AgentState>>;

pub async fn health(State(state): Shared) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        sessions: state.sessions.len(),
        protocol: Some(PROTOCOL_VERSION.to_string()),
    })
}

pub async fn list_workspaces(State(state): Shared) -> Json<Vec<Workspace>> {
    Json(state.workspaces.list())
}

pub async fn create_workspace(
    State(state): Shared,
    Json(request): Json<CreateWorkspaceRequest>,
) -> Result<(StatusCode, Json<Workspace>), AgentError> {
    let workspace = state.workspaces.create(request)?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

pub async fn get_workspace(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<Json<Workspace>, AgentError> {
    Ok(Json(state.workspaces.get(&id)?))
}

/// Removing a workspace terminates the terminals opened in it
pub async fn delete_workspace(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<StatusCode, AgentError> {
    state.workspaces.remove(&id)?;
    let killed = state.sessions.delete_workspace_sessions(&id);
    tracing::info!(workspace_id = %id, terminals = killed, "Workspace deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_workspace_terminals(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<Json<Vec<TerminalInfo>>, AgentError> {
    state.workspaces.get(&id)?;
    Ok(Json(
        state
            .sessions
            .list_for_workspace(&id)
            .iter()
            .map(|s| s.info())
            .collect(),
    ))
}

/// Spawn a terminal in the workspace directory. The body is optional.
pub async fn create_terminal(
    State(state): Shared,
    Path(id): Path<String>,
    body: Option<Json<CreateTerminalRequest>>,
) -> Result<(StatusCode, Json<TerminalCreated>), AgentError> {
    let workspace = state.workspaces.get(&id)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let session = state.sessions.create(SessionSpec {
        workspace_id: Some(workspace.id),
        cwd: PathBuf::from(workspace.path),
        shell: request.shell.clone().filter(|s| !s.is_empty()),
        size: request.size(),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(TerminalCreated {
            id: session.id().to_string(),
            pid: session.pid(),
        }),
    ))
}

pub async fn list_terminals(State(state): Shared) -> Json<Vec<TerminalInfo>> {
    Json(state.sessions.list().iter().map(|s| s.info()).collect())
}

pub async fn get_terminal(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<Json<TerminalInfo>, AgentError> {
    state
        .sessions
        .get(&id)
        .map(|s| Json(s.info()))
        .ok_or(AgentError::TerminalNotFound(id))
}

pub async fn delete_terminal(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<StatusCode, AgentError> {
    state.sessions.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resize_terminal(
    State(state): Shared,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> Result<Json<TerminalInfo>, AgentError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| AgentError::TerminalNotFound(id.clone()))?;
    session.resize(TerminalSize::new(request.cols, request.rows))?;
    Ok(Json(session.info()))
}
