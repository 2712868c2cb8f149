//! Container-backed workspace runtime.
//!
//! Turns machine definitions into running containers, resolves the addresses their servers
//! are reachable on, and snapshots them to images.

pub use bollard;
pub use workbench_common as common;

pub mod address;
pub mod agents;
pub mod auth;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod folders;
pub mod infra;
pub mod logs;
pub mod path_escape;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod servers;
pub mod snapshot;

pub use address::{AddressConfig, AddressStrategy, HostHints};
pub use agents::{AgentCatalog, AgentSpec};
pub use auth::{Credentials, RegistryAuthResolver};
pub use config::{RuntimeConfig, TimeoutConfig};
pub use daemon::DockerDaemon;
pub use docker::{ApiError, ContainerApi, ContainerInfo};
pub use folders::{LocalWorkspaceFolders, WorkspaceFolderPathProvider};
pub use infra::{InfraConfig, InfrastructureProvisioner};
pub use logs::{ChannelLogSink, DiscardLogSink, LogSink, TracingLogSink};
pub use provisioner::{ContainerDefaults, Instance, InstanceState};
pub use runtime::WorkspaceRuntime;
pub use servers::{RuntimeInfo, ServerCatalog, ServersAssembler};
pub use snapshot::{SnapshotConfig, SnapshotManager};
