//! Workspace registry
//!
//! A workspace names a directory on the remote host; terminals created in
//! it start there.

use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use rmx_core::time::current_time_millis;
use rmx_protocol::{CreateWorkspaceRequest, Workspace};

use crate::error::AgentError;

/// In-memory workspace store
#[derive(Default)]
pub struct WorkspaceRegistry {
    workspaces: DashMap<String, Workspace>,
    /// Expanded path -> workspace id
    by_path: DashMap<String, String>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workspace; the path must be an existing directory.
    /// Registering a known path again returns the existing workspace.
    pub fn create(&self, request: CreateWorkspaceRequest) -> Result<Workspace, AgentError> {
        if request.path.trim().is_empty() {
            return Err(AgentError::InvalidRequest("Workspace path is required".into()));
        }
        let path = expand_home(&request.path);
        if !path.is_dir() {
            return Err(AgentError::InvalidRequest(format!(
                "Workspace path is not a directory: {}",
                path.display()
            )));
        }

        let path_text = path.display().to_string();
        // The path entry stays locked until the workspace is stored
        let mut entry = match self.by_path.entry(path_text.clone()) {
            Entry::Occupied(entry) => {
                if let Some(existing) = self.workspaces.get(entry.get()) {
                    return Ok(existing.clone());
                }
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(String::new()),
        };

        let name = if request.name.trim().is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        } else {
            request.name
        };

        let workspace = Workspace {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            path: path_text,
            created_at: current_time_millis(),
        };
        self.workspaces
            .insert(workspace.id.clone(), workspace.clone());
        *entry = workspace.id.clone();
        drop(entry);
        tracing::info!(workspace_id = %workspace.id, path = %workspace.path, "Workspace created");
        Ok(workspace)
    }

    pub fn get(&self, id: &str) -> Result<Workspace, AgentError> {
        self.workspaces
            .get(id)
            .map(|w| w.clone())
            .ok_or_else(|| AgentError::WorkspaceNotFound(id.to_string()))
    }

    /// All workspaces, oldest first
    pub fn list(&self) -> Vec<Workspace> {
        let mut list: Vec<_> = self.workspaces.iter().map(|w| w.clone()).collect();
        list.sort_by_key(|w| w.created_at);
        list
    }

    pub fn remove(&self, id: &str) -> Result<Workspace, AgentError> {
        let (_, workspace) = self
            .workspaces
            .remove(id)
            .ok_or_else(|| AgentError::WorkspaceNotFound(id.to_string()))?;
        self.by_path.remove_if(&workspace.path, |_, owner| owner == id);
        Ok(workspace)
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match path.strip_prefix("~/") {
        Some(rest) => home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => Path::new(path).to_path_buf(),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();

        let ws = registry
            .create(CreateWorkspaceRequest {
                name: "proj".into(),
                path: dir.path().display().to_string(),
            })
            .unwrap();
        assert_eq!(registry.get(&ws.id).unwrap().name, "proj");
        assert_eq!(registry.list().len(), 1);

        registry.remove(&ws.id).unwrap();
        assert!(matches!(
            registry.get(&ws.id),
            Err(AgentError::WorkspaceNotFound(_))
        ));
    }

    #[test]
    fn test_same_path_reuses_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();
        let request = CreateWorkspaceRequest {
            name: String::new(),
            path: dir.path().display().to_string(),
        };
        let first = registry.create(request.clone()).unwrap();
        let second = registry.create(request).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_path_is_free_after_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();
        let request = CreateWorkspaceRequest {
            name: String::new(),
            path: dir.path().display().to_string(),
        };
        let first = registry.create(request.clone()).unwrap();
        registry.remove(&first.id).unwrap();

        let second = registry.create(request).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_concurrent_create_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(WorkspaceRegistry::new());
        let path = dir.path().display().to_string();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = std::sync::Arc::clone(&registry);
                let barrier = std::sync::Arc::clone(&barrier);
                let path = path.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry
                        .create(CreateWorkspaceRequest {
                            name: String::new(),
                            path,
                        })
                        .unwrap()
                        .id
                })
            })
            .collect();

        let ids: std::collections::HashSet<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_rejects_missing_directory() {
        let registry = WorkspaceRegistry::new();
        let result = registry.create(CreateWorkspaceRequest {
            name: "x".into(),
            path: "/no/such/dir/anywhere".into(),
        });
        assert!(matches!(result, Err(AgentError::InvalidRequest(_))));
    }

    #[test]
    fn test_name_defaults_to_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();
        let ws = registry
            .create(CreateWorkspaceRequest {
                name: String::new(),
                path: dir.path().display().to_string(),
            })
            .unwrap();
        let expected = dir.path().file_name().unwrap().to_string_lossy();
        assert_eq!(ws.name, expected);
    }
}
