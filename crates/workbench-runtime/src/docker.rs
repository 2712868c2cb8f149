//! The container daemon as seen by the lifecycle core.
//!
//! Everything talks to the daemon through [`ContainerApi`]. The production
//! implementation lives in [`crate::daemon`]; tests plug in an in-memory one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use thiserror::Error;
use workbench_common::{ImageReference, WorkbenchError};

use crate::auth::Credentials;
use crate::logs::LogSink;

// --- Transport Error Type ---
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No such object: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Container daemon unavailable: {0}")]
    Unavailable(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Daemon error {status}: {message}")]
    Daemon { status: u16, message: String },
    #[error("{0}")]
    Stream(String),
}

impl From<BollardError> for ApiError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => ApiError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => ApiError::Conflict(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => ApiError::Daemon {
                status: status_code,
                message,
            },
            BollardError::DockerStreamError { error } => ApiError::Stream(error),
            BollardError::RequestTimeoutError => {
                ApiError::Timeout("request to the container daemon".to_string())
            }
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Wraps the error with the operation and target it happened on.
    pub fn into_workbench(self, operation: &str, target: &str) -> WorkbenchError {
        let operation = operation.to_string();
        let target = target.to_string();
        match self {
            ApiError::NotFound(message) => WorkbenchError::NotFound(format!("{target}: {message}")),
            ApiError::Conflict(message) => WorkbenchError::Conflict {
                operation,
                target,
                message,
            },
            ApiError::Unavailable(message) | ApiError::Timeout(message) => {
                WorkbenchError::RuntimeUnavailable {
                    operation,
                    target,
                    message,
                }
            }
            ApiError::Daemon { status, message } => WorkbenchError::Remote {
                operation,
                target,
                message: format!("daemon returned {status}: {message}"),
            },
            ApiError::Stream(message) => WorkbenchError::Remote {
                operation,
                target,
                message,
            },
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A published host port for one exposed container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: String,
}

/// Network part of a container inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Address on the default bridge network, empty on user defined networks.
    pub ip_address: Option<String>,
    /// Address per attached network.
    pub networks: BTreeMap<String, String>,
    /// Exposed `port/transport` to published bindings. Unpublished ports map to an empty list.
    pub ports: BTreeMap<String, Vec<PortBinding>>,
}

impl NetworkSettings {
    /// Container address, preferring the default bridge and falling back to named networks.
    pub fn container_ip(&self) -> Option<&str> {
        self.ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                self.networks
                    .values()
                    .map(String::as_str)
                    .find(|ip| !ip.is_empty())
            })
    }
}

/// Read only view of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: Option<String>,
    pub running: bool,
    pub env: Vec<String>,
    /// Absent until the container has been started.
    pub network: Option<NetworkSettings>,
}

impl ContainerInfo {
    pub fn has_exited(&self) -> bool {
        matches!(self.status.as_deref(), Some("exited") | Some("dead"))
    }
}

/// Entrypoint and command baked into an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub exposed_ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Bind mounts, `host:container[:options]`.
    pub binds: Vec<String>,
    /// Anonymous volumes, container paths only.
    pub volumes: Vec<String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub network_mode: Option<String>,
    pub publish_all_ports: bool,
    pub privileged: bool,
    pub pids_limit: Option<i64>,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub cpuset_cpus: Option<String>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cgroup_parent: Option<String>,
}

/// Image build parameters. Exactly one of `dockerfile_content` and `remote` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRequest {
    /// Name the built image is tagged with.
    pub repository: String,
    pub dockerfile_content: Option<String>,
    pub remote: Option<String>,
    pub dockerfile_path: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub memory_limit: Option<i64>,
    pub force_pull: bool,
    pub cpuset_cpus: Option<String>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitRequest {
    pub container: String,
    pub repository: String,
    pub tag: String,
    pub comment: String,
    pub author: String,
}

/// Operations of the container daemon used by the lifecycle core.
///
/// Implementations bound every call with a timeout and never buffer whole
/// build/pull/push outputs: progress goes to the sink as it arrives.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn inspect_container(&self, container: &str) -> ApiResult<ContainerInfo>;

    async fn create_container(&self, spec: &ContainerSpec) -> ApiResult<String>;

    async fn start_container(&self, container: &str) -> ApiResult<()>;

    async fn stop_container(&self, container: &str, grace: Duration) -> ApiResult<()>;

    async fn kill_container(&self, container: &str) -> ApiResult<()>;

    async fn remove_container(
        &self,
        container: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ApiResult<()>;

    async fn inspect_image(&self, image: &str) -> ApiResult<ImageConfig>;

    /// Builds an image and returns its id.
    async fn build_image(&self, request: &BuildRequest, logs: &dyn LogSink) -> ApiResult<String>;

    async fn pull_image(
        &self,
        image: &ImageReference,
        credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<()>;

    async fn tag_image(&self, image: &str, repository: &str, tag: &str) -> ApiResult<()>;

    /// Pushes `repository:tag` and returns the digest reported by the registry.
    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        credentials: Option<&Credentials>,
        logs: &dyn LogSink,
    ) -> ApiResult<String>;

    /// Commits a container without pausing it and returns the new image id.
    async fn commit_container(&self, request: &CommitRequest) -> ApiResult<String>;

    async fn remove_image(&self, image: &str, force: bool) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bollard_error_mapping() {
        let err: ApiError = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        }
        .into();
        assert!(err.is_not_found());

        let err: ApiError = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err: ApiError = BollardError::RequestTimeoutError.into();
        assert!(matches!(
            err.into_workbench("start", "abc"),
            WorkbenchError::RuntimeUnavailable { .. }
        ));
    }

    #[test]
    fn test_wrapped_errors_keep_context() {
        let err = ApiError::Daemon {
            status: 500,
            message: "driver failed".into(),
        }
        .into_workbench("create container", "ws_dev");
        let text = err.to_string();
        assert!(text.contains("create container"));
        assert!(text.contains("ws_dev"));
        assert!(text.contains("driver failed"));
    }

    #[test]
    fn test_container_ip_falls_back_to_named_networks() {
        let mut network = NetworkSettings {
            ip_address: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(network.container_ip(), None);
        network
            .networks
            .insert("workspace-net".into(), "10.0.3.4".into());
        assert_eq!(network.container_ip(), Some("10.0.3.4"));
        network.ip_address = Some("172.17.0.5".into());
        assert_eq!(network.container_ip(), Some("172.17.0.5"));
    }
}
