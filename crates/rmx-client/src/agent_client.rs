//! HTTP client for the agent control surface
//!
//! The agent listens on the remote loopback, so the base URL is normally a
//! local tunnel port.

use std::time::Duration;

use rmx_protocol::{
    CreateTerminalRequest, CreateWorkspaceRequest, HealthResponse, ResizeRequest, TerminalCreated,
    TerminalInfo, Workspace,
};

/// Timeout for control requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one agent
#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    /// `base_url` like `http://127.0.0.1:40123`
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base_url, http }
    }

    /// Agent reachable through a local tunnel port
    pub fn for_local_port(port: u16) -> Self {
        Self::new(format!("http://127.0.0.1:{}", port))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of a terminal's stream endpoint
    pub fn stream_url(&self, terminal_id: &str) -> String {
        let ws_base = match self.base_url.strip_prefix("https://") {
            Some(rest) => format!("wss://{}", rest),
            None => format!(
                "ws://{}",
                self.base_url
                    .strip_prefix("http://")
                    .unwrap_or(&self.base_url)
            ),
        };
        format!("{}/terminals/{}/stream", ws_base, terminal_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /health` with a custom timeout
    pub async fn health(&self, timeout: Duration) -> reqwest::Result<HealthResponse> {
        self.http
            .get(self.url("/health"))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn list_workspaces(&self) -> reqwest::Result<Vec<Workspace>> {
        self.http
            .get(self.url("/workspaces"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn create_workspace(&self, name: &str, path: &str) -> reqwest::Result<Workspace> {
        self.http
            .post(self.url("/workspaces"))
            .json(&CreateWorkspaceRequest {
                name: name.to_string(),
                path: path.to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Reuse the workspace registered for `path`, or create one
    pub async fn ensure_workspace(&self, path: &str) -> reqwest::Result<Workspace> {
        if let Some(existing) = self
            .list_workspaces()
            .await?
            .into_iter()
            .find(|w| w.path == path)
        {
            return Ok(existing);
        }
        self.create_workspace("", path).await
    }

    pub async fn delete_workspace(&self, id: &str) -> reqwest::Result<()> {
        self.http
            .delete(self.url(&format!("/workspaces/{}", id)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_terminal(
        &self,
        workspace_id: &str,
        request: &CreateTerminalRequest,
    ) -> reqwest::Result<TerminalCreated> {
        self.http
            .post(self.url(&format!("/workspaces/{}/terminals", workspace_id)))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn list_terminals(&self) -> reqwest::Result<Vec<TerminalInfo>> {
        self.http
            .get(self.url("/terminals"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn delete_terminal(&self, id: &str) -> reqwest::Result<()> {
        self.http
            .delete(self.url(&format!("/terminals/{}", id)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn resize_terminal(&self, id: &str, cols: u16, rows: u16) -> reqwest::Result<TerminalInfo> {
        self.http
            .post(self.url(&format!("/terminals/{}/resize", id)))
            .json(&ResizeRequest { cols, rows })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}
