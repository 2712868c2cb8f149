use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use workbench_common::WorkbenchError;

/// Resolves where the project files of a workspace live on the daemon host.
#[async_trait]
pub trait WorkspaceFolderPathProvider: Send + Sync {
    async fn host_path(&self, workspace_id: &str) -> Result<PathBuf, WorkbenchError>;
}

/// Keeps every workspace in its own directory below a shared root.
#[derive(Debug, Clone)]
pub struct LocalWorkspaceFolders {
    root: PathBuf,
}

impl LocalWorkspaceFolders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkspaceFolderPathProvider for LocalWorkspaceFolders {
    async fn host_path(&self, workspace_id: &str) -> Result<PathBuf, WorkbenchError> {
        let invalid = workspace_id.is_empty()
            || workspace_id == "."
            || workspace_id == ".."
            || workspace_id.contains(['/', '\\']);
        if invalid {
            return Err(WorkbenchError::PathResolution {
                workspace_id: workspace_id.to_string(),
                message: "workspace id is not a valid folder name".to_string(),
            });
        }

        let path = self.root.join(workspace_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| WorkbenchError::PathResolution {
                workspace_id: workspace_id.to_string(),
                message: format!("can't create {}: {e}", path.display()),
            })?;
        debug!(workspace_id, path = %path.display(), "Resolved workspace folder");
        Ok(path)
    }
}
