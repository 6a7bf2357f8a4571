//! Shared agent state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use rmx_core::config::AgentConfig;

use crate::activity::ActivityTracker;
use crate::session::SessionManager;
use crate::workspace::WorkspaceRegistry;

/// State shared by every request handler and stream
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Live terminal sessions
    pub sessions: SessionManager,
    /// Registered workspaces
    pub workspaces: WorkspaceRegistry,
    /// Last activity, for idle shutdown
    pub activity: Arc<ActivityTracker>,
    /// Cancelled to stop the agent
    pub shutdown: CancellationToken,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Self {
        let sessions = SessionManager::new(config.default_shell.clone(), config.session_env.clone());
        Self {
            config,
            sessions,
            workspaces: WorkspaceRegistry::new(),
            activity: Arc::new(ActivityTracker::new()),
            shutdown: CancellationToken::new(),
        }
    }
}
