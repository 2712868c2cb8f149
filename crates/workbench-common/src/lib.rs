// Re-export dependencies used in public interfaces of common types

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

pub mod environment;
pub mod image;
pub mod machine;

pub use environment::{ContainerEnvironment, EnvironmentConfig, ServiceSpec, VolumeSpec};
pub use image::{ImageReference, InstanceKey};
pub use machine::{normalize_port, MachineConfig, MachineSource, Server, ServerConfig};

#[derive(Error, Debug)]
pub enum WorkbenchError {
    #[error("Unsupported machine source kind: {0}")]
    UnsupportedSourceKind(String),

    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("Container runtime unavailable during {operation} of {target}: {message}")]
    RuntimeUnavailable {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Conflict during {operation} of {target}: {message}")]
    Conflict {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Dev machine not found in environment: {0}")]
    DevMachineNotFound(String),

    #[error("Failed to resolve host path of workspace {workspace_id}: {message}")]
    PathResolution {
        workspace_id: String,
        message: String,
    },

    #[error("Snapshot {image} can't be removed: {message}")]
    SnapshotNotRemovable { image: String, message: String },

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Image build of {image} failed: {message}\n{tail}")]
    BuildFailed {
        image: String,
        message: String,
        tail: String,
    },

    #[error("Commit of container {container} failed: {message}")]
    CommitFailed { container: String, message: String },

    #[error("Image {image} was committed but pushing it failed: {message}")]
    PushFailed { image: String, message: String },

    #[error(
        "Container {0} exited right after start. This may be caused by a container in interactive \
         mode or a container that requires additional arguments to start. Please check the recipe."
    )]
    ContainerExited(String),

    #[error("No address source available for container {0}")]
    AddressUnresolved(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("{operation} of {target} failed: {message}")]
    Remote {
        operation: String,
        target: String,
        message: String,
    },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkbenchError {
    /// Caller or configuration bugs detected before any remote call.
    /// These must never be retried automatically.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            WorkbenchError::UnsupportedSourceKind(_)
                | WorkbenchError::InvalidRecipe(_)
                | WorkbenchError::DevMachineNotFound(_)
                | WorkbenchError::Config(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkbenchError::NotFound(_))
    }
}

// Define the primary Result type for workbench operations
pub type Result<T> = std::result::Result<T, WorkbenchError>;
