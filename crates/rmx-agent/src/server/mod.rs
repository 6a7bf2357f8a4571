//! HTTP and WebSocket control surface
//!
//! Binds to loopback only; remote clients reach it through an SSH tunnel.

mod routes;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rmx_core::config::AgentConfig;

use crate::activity::run_idle_monitor;
use crate::state::AgentState;

/// Build the router for the agent surface
pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/workspaces",
            get(routes::list_workspaces).post(routes::create_workspace),
        )
        .route(
            "/workspaces/:id",
            get(routes::get_workspace).delete(routes::delete_workspace),
        )
        .route(
            "/workspaces/:id/terminals",
            get(routes::list_workspace_terminals).post(routes::create_terminal),
        )
        .route("/terminals", get(routes::list_terminals))
        .route(
            "/terminals/:id",
            get(routes::get_terminal).delete(routes::delete_terminal),
        )
        .route("/terminals/:id/resize", post(routes::resize_terminal))
        .route("/terminals/:id/stream", get(stream::terminal_stream))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_activity,
        ))
        .with_state(state)
}

async fn track_activity(
    State(state): State<Arc<AgentState>>,
    request: Request,
    next: Next,
) -> Response {
    state.activity.touch();
    tracing::debug!(method = %request.method(), path = %request.uri().path(), "Request");
    next.run(request).await
}

/// A bound agent server, ready to run
pub struct AgentServer {
    state: Arc<AgentState>,
    listener: TcpListener,
}

impl AgentServer {
    /// Bind the configured address
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        let address = config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        Ok(Self::from_listener(listener, config))
    }

    /// Use an already-bound listener
    pub fn from_listener(listener: TcpListener, config: AgentConfig) -> Self {
        Self {
            state: Arc::new(AgentState::new(config)),
            listener,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn state(&self) -> Arc<AgentState> {
        Arc::clone(&self.state)
    }

    /// Cancelling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until shutdown is requested or the idle window passes.
    ///
    /// On shutdown every terminal is killed and its viewers receive `exit`
    /// before the listener closes.
    pub async fn run(self) -> Result<()> {
        let state = self.state;
        let shutdown = state.shutdown.clone();
        let address = self.listener.local_addr().ok();

        tracing::info!(
            "Agent listening on {}",
            address.map(|a| a.to_string()).unwrap_or_default()
        );

        let idle_monitor = match state.config.effective_idle_timeout() {
            Some(timeout) => {
                tracing::info!("Idle shutdown after {}s", timeout.as_secs());
                Some(tokio::spawn(run_idle_monitor(
                    Arc::clone(&state.activity),
                    timeout,
                    shutdown.clone(),
                )))
            }
            None => {
                tracing::info!("Idle shutdown disabled");
                None
            }
        };

        let reaper = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state.shutdown.cancelled().await;
                state.sessions.shutdown_all().await;
            })
        };

        let result = axum::serve(self.listener, router(Arc::clone(&state)))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .context("Agent server failed");

        // Server errors also end the agent
        shutdown.cancel();
        let _ = reaper.await;
        if let Some(monitor) = idle_monitor {
            let _ = monitor.await;
        }

        tracing::info!("Agent stopped");
        result
    }
}
