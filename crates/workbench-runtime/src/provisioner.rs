//! Creation and teardown of container-backed instances.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use workbench_common::image::LATEST_TAG;
use workbench_common::{
    ImageReference, MachineConfig, MachineSource, ServiceSpec, WorkbenchError,
};

use crate::auth::RegistryAuthResolver;
use crate::config::TimeoutConfig;
use crate::docker::{ApiError, BuildRequest, ContainerApi, ContainerInfo, ContainerSpec};
use crate::infra::InfrastructureProvisioner;
use crate::logs::{LogSink, TailingSink};
use crate::servers::ServerCatalog;

pub const WORKSPACE_ID_ENV: &str = "WORKBENCH_WORKSPACE_ID";
pub const MACHINE_NAME_ENV: &str = "WORKBENCH_MACHINE_NAME";

pub const WORKSPACE_LABEL: &str = "org.workbench.workspace";
pub const MACHINE_LABEL: &str = "org.workbench.machine";
pub const INSTANCE_LABEL: &str = "org.workbench.instance";

/// Lines of build output kept for the error of a failed build.
const BUILD_LOG_TAIL: usize = 50;

/// Commands that exit immediately when the container has no terminal attached.
const SHELL_COMMANDS: &[&[&str]] = &[
    &["sh"],
    &["bash"],
    &["/bin/sh"],
    &["/bin/bash"],
    &["/bin/sh", "-c", "sh"],
    &["/bin/sh", "-c", "bash"],
    &["/bin/sh", "-c", "/bin/sh"],
    &["/bin/sh", "-c", "/bin/bash"],
];

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Running, Destroying)
                | (Stopping, Destroying)
                | (Stopped, Destroying)
                | (Failed, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Creating => "CREATING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Destroying => "DESTROYING",
            InstanceState::Destroyed => "DESTROYED",
            InstanceState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A machine realized as a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub workspace_id: String,
    pub machine: MachineConfig,
    pub container_id: String,
    pub container_name: String,
    /// Private image the container was created from, removed on destroy.
    pub image: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

/// Identity of an instance that is about to be created.
#[derive(Debug, Clone)]
pub struct InstanceTarget {
    pub instance_id: String,
    pub workspace_id: String,
    pub machine: MachineConfig,
}

/// Container settings applied on top of every service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefaults {
    /// Used when neither the service nor the machine sets a limit.
    pub default_memory_bytes: i64,
    /// Swap is `memory * (1 + multiplier)`; `-1` leaves swap unlimited.
    pub memory_swap_multiplier: f64,
    pub pids_limit: Option<i64>,
    pub privileged: bool,
    pub publish_all_ports: bool,
    pub network: Option<String>,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub cpuset_cpus: Option<String>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cgroup_parent: Option<String>,
    /// Merged under the build args of every recipe.
    pub build_args: BTreeMap<String, String>,
    pub force_pull: bool,
    pub system_volumes: Vec<String>,
    pub dev_system_volumes: Vec<String>,
    pub system_env: BTreeMap<String, String>,
    pub dev_system_env: BTreeMap<String, String>,
    /// Repository prefix of prepared machine images.
    pub image_namespace: String,
}

impl Default for ContainerDefaults {
    fn default() -> Self {
        Self {
            default_memory_bytes: 2 * 1024 * 1024 * 1024,
            memory_swap_multiplier: 0.0,
            pids_limit: None,
            privileged: false,
            publish_all_ports: true,
            network: None,
            extra_hosts: Vec::new(),
            dns: Vec::new(),
            cpuset_cpus: None,
            cpu_period: None,
            cpu_quota: None,
            cgroup_parent: None,
            build_args: BTreeMap::new(),
            force_pull: false,
            system_volumes: Vec::new(),
            dev_system_volumes: Vec::new(),
            system_env: BTreeMap::new(),
            dev_system_env: BTreeMap::new(),
            image_namespace: "workbench".to_string(),
        }
    }
}

pub(crate) fn memory_swap(memory: i64, multiplier: f64) -> i64 {
    if multiplier == -1.0 {
        return -1;
    }
    (memory as f64 * (1.0 + multiplier)) as i64
}

/// Whether the effective command would exit right away and needs a keep-alive instead.
pub(crate) fn needs_keep_alive(entrypoint: Option<&[String]>, cmd: Option<&[String]>) -> bool {
    let effective: Vec<&str> = entrypoint
        .into_iter()
        .flatten()
        .chain(cmd.into_iter().flatten())
        .map(String::as_str)
        .collect();
    effective.is_empty() || SHELL_COMMANDS.iter().any(|shell| *shell == effective.as_slice())
}

fn container_name(target: &InstanceTarget) -> String {
    let suffix: String = target
        .instance_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    let raw = format!(
        "workbench_{}_{}_{}",
        target.workspace_id, target.machine.name, suffix
    );
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

async fn cancellable<T, F>(cancel: &CancellationToken, operation: &str, fut: F) -> Result<T, WorkbenchError>
where
    F: Future<Output = Result<T, WorkbenchError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkbenchError::Cancelled(operation.to_string())),
        result = fut => result,
    }
}

/// Containers created so far by one create call, removed again if it fails.
#[derive(Default)]
struct Leftovers {
    container: Option<String>,
    image: Option<String>,
}

pub struct InstanceProvisioner {
    api: Arc<dyn ContainerApi>,
    infra: Arc<InfrastructureProvisioner>,
    auth: Arc<RegistryAuthResolver>,
    catalog: ServerCatalog,
    defaults: ContainerDefaults,
    timeouts: TimeoutConfig,
    registry_snapshots: bool,
}

impl InstanceProvisioner {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        infra: Arc<InfrastructureProvisioner>,
        auth: Arc<RegistryAuthResolver>,
        catalog: ServerCatalog,
        defaults: ContainerDefaults,
        timeouts: TimeoutConfig,
        registry_snapshots: bool,
    ) -> Self {
        Self {
            api,
            infra,
            auth,
            catalog,
            defaults,
            timeouts,
            registry_snapshots,
        }
    }

    /// Creates and starts an instance of `target.machine` from `source`.
    pub async fn create_instance(
        &self,
        target: &InstanceTarget,
        source: &MachineSource,
        logs: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<Instance, WorkbenchError> {
        source.validate()?;
        let mut service = ServiceSpec::from_machine(&target.machine, source.clone());
        self.infra
            .provision_service(&target.workspace_id, &mut service, target.machine.is_dev)
            .await?;
        self.create_from_service(target, service, logs, cancel).await
    }

    /// Creates and starts an instance from an already provisioned service.
    ///
    /// Whatever was created is removed again when a step fails or `cancel` fires.
    #[instrument(
        skip(self, target, service, logs, cancel),
        fields(workspace_id = %target.workspace_id, machine = %target.machine.name, instance_id = %target.instance_id)
    )]
    pub async fn create_from_service(
        &self,
        target: &InstanceTarget,
        service: ServiceSpec,
        logs: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<Instance, WorkbenchError> {
        service.source.validate()?;
        let name = service
            .container_name
            .clone()
            .unwrap_or_else(|| container_name(target));
        let image = format!("{}/{}", self.defaults.image_namespace, name).to_ascii_lowercase();

        let mut leftovers = Leftovers::default();
        match self
            .create_steps(target, &service, &name, &image, logs, cancel, &mut leftovers)
            .await
        {
            Ok(instance) => {
                info!(container_id = %instance.container_id, "Instance running");
                Ok(instance)
            }
            Err(e) => {
                warn!(error = %e, "Instance creation failed, cleaning up");
                self.cleanup(leftovers).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_steps(
        &self,
        target: &InstanceTarget,
        service: &ServiceSpec,
        name: &str,
        image: &str,
        logs: &dyn LogSink,
        cancel: &CancellationToken,
        leftovers: &mut Leftovers,
    ) -> Result<Instance, WorkbenchError> {
        leftovers.image = Some(image.to_string());
        self.prepare_image(service, image, logs, cancel).await?;

        let image_config = cancellable(cancel, "inspect image", async {
            self.api
                .inspect_image(image)
                .await
                .map_err(|e| e.into_workbench("inspect image", image))
        })
        .await?;
        let entrypoint = service.entrypoint.as_ref().or(image_config.entrypoint.as_ref());
        let cmd = service.command.as_ref().or(image_config.cmd.as_ref());
        let (entrypoint, cmd) = if needs_keep_alive(
            entrypoint.map(Vec::as_slice),
            cmd.map(Vec::as_slice),
        ) {
            debug!("Image command exits without a terminal, using keep-alive command");
            (
                Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                Some(vec!["tail -f /dev/null".to_string()]),
            )
        } else {
            (service.entrypoint.clone(), service.command.clone())
        };

        let spec = self.container_spec(target, service, name, image, entrypoint, cmd);

        leftovers.container = Some(name.to_string());
        let container_id = cancellable(cancel, "create container", async {
            self.api
                .create_container(&spec)
                .await
                .map_err(|e| e.into_workbench("create container", name))
        })
        .await?;
        leftovers.container = Some(container_id.clone());

        cancellable(cancel, "start container", async {
            self.api
                .start_container(&container_id)
                .await
                .map_err(|e| e.into_workbench("start container", &container_id))
        })
        .await?;

        self.wait_running(&container_id, cancel).await?;

        Ok(Instance {
            id: target.instance_id.clone(),
            workspace_id: target.workspace_id.clone(),
            machine: target.machine.clone(),
            container_id,
            container_name: name.to_string(),
            image: image.to_string(),
            state: InstanceState::Running,
            created_at: Utc::now(),
        })
    }

    /// Makes `image` available locally, by building the recipe or by tagging an existing image.
    async fn prepare_image(
        &self,
        service: &ServiceSpec,
        image: &str,
        logs: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), WorkbenchError> {
        match &service.source {
            MachineSource::Recipe {
                content,
                location,
                dockerfile,
                args,
            } => {
                let mut build_args = self.defaults.build_args.clone();
                build_args.extend(args.clone());
                let content = content.clone().filter(|c| !c.trim().is_empty());
                let remote = if content.is_none() { location.clone() } else { None };
                let request = BuildRequest {
                    repository: image.to_string(),
                    dockerfile_content: content,
                    remote,
                    dockerfile_path: dockerfile.clone(),
                    build_args,
                    memory_limit: service.memory_limit,
                    force_pull: self.defaults.force_pull,
                    cpuset_cpus: self.defaults.cpuset_cpus.clone(),
                    cpu_period: self.defaults.cpu_period,
                    cpu_quota: self.defaults.cpu_quota,
                };
                let tail = TailingSink::new(logs, BUILD_LOG_TAIL);
                cancellable(cancel, "image build", async {
                    match self.api.build_image(&request, &tail).await {
                        Ok(id) => {
                            debug!(image, image_id = %id, "Image built");
                            Ok(())
                        }
                        Err(ApiError::Stream(message)) => Err(WorkbenchError::BuildFailed {
                            image: image.to_string(),
                            message,
                            tail: tail.tail(),
                        }),
                        Err(ApiError::Daemon { status, message }) => {
                            Err(WorkbenchError::BuildFailed {
                                image: image.to_string(),
                                message: format!("daemon returned {status}: {message}"),
                                tail: tail.tail(),
                            })
                        }
                        Err(e) => Err(e.into_workbench("image build", image)),
                    }
                })
                .await
            }
            MachineSource::Image { location } => {
                let reference = ImageReference::parse(location).ok_or_else(|| {
                    WorkbenchError::InvalidRecipe(format!("'{location}' is not an image reference"))
                })?;
                let reference = ImageReference {
                    digest: None,
                    ..reference
                };
                let source = reference.location_without_digest();

                let local = match self.api.inspect_image(&source).await {
                    Ok(_) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e.into_workbench("inspect image", &source)),
                };
                let snapshot = reference.is_snapshot();
                let pull = if snapshot {
                    self.registry_snapshots
                } else {
                    self.defaults.force_pull || !local
                };

                if pull {
                    let credentials = self.auth.resolve_basic_auth(reference.registry.as_deref());
                    cancellable(cancel, "image pull", async {
                        self.api
                            .pull_image(&reference, credentials, logs)
                            .await
                            .map_err(|e| e.into_workbench("image pull", &source))
                    })
                    .await?;
                }

                self.api
                    .tag_image(&source, image, LATEST_TAG)
                    .await
                    .map_err(|e| e.into_workbench("tag image", &source))?;

                if pull && snapshot {
                    if let Err(e) = self.api.remove_image(&source, false).await {
                        warn!(image = %source, error = %e, "Failed to remove pulled snapshot tag");
                    }
                }
                Ok(())
            }
        }
    }

    fn container_spec(
        &self,
        target: &InstanceTarget,
        service: &ServiceSpec,
        name: &str,
        image: &str,
        entrypoint: Option<Vec<String>>,
        cmd: Option<Vec<String>>,
    ) -> ContainerSpec {
        let machine = &target.machine;
        let defaults = &self.defaults;

        let mut env = service.environment.clone();
        let mut system_env: Vec<(&String, &String)> = defaults.system_env.iter().collect();
        let mut system_volumes: Vec<&String> = defaults.system_volumes.iter().collect();
        if machine.is_dev {
            system_env.extend(defaults.dev_system_env.iter());
            system_volumes.extend(defaults.dev_system_volumes.iter());
            env.entry(WORKSPACE_ID_ENV.to_string())
                .or_insert_with(|| target.workspace_id.clone());
        }
        for (key, value) in system_env {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env.entry(MACHINE_NAME_ENV.to_string())
            .or_insert_with(|| machine.name.clone());

        let mut volumes = service.volumes.clone();
        for volume in system_volumes {
            if !volumes.contains(volume) {
                volumes.push(volume.clone());
            }
        }
        let (binds, volumes): (Vec<String>, Vec<String>) =
            volumes.into_iter().partition(|v| v.contains(':'));

        let mut exposed_ports = service.expose.clone();
        for port in self.catalog.effective_servers(machine).into_keys() {
            if !exposed_ports.contains(&port) {
                exposed_ports.push(port);
            }
        }

        let memory = service
            .memory_limit
            .or(machine.memory_limit_bytes)
            .unwrap_or(defaults.default_memory_bytes);

        let mut labels = service.labels.clone();
        labels.insert(WORKSPACE_LABEL.to_string(), target.workspace_id.clone());
        labels.insert(MACHINE_LABEL.to_string(), machine.name.clone());
        labels.insert(INSTANCE_LABEL.to_string(), target.instance_id.clone());

        ContainerSpec {
            name: Some(name.to_string()),
            image: image.to_string(),
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            cmd,
            entrypoint,
            exposed_ports,
            labels,
            binds,
            volumes,
            memory: Some(memory),
            memory_swap: Some(memory_swap(memory, defaults.memory_swap_multiplier)),
            network_mode: service.networks.first().cloned().or_else(|| defaults.network.clone()),
            publish_all_ports: defaults.publish_all_ports,
            privileged: defaults.privileged,
            pids_limit: defaults.pids_limit,
            extra_hosts: defaults.extra_hosts.clone(),
            dns: defaults.dns.clone(),
            cpuset_cpus: defaults.cpuset_cpus.clone(),
            cpu_period: defaults.cpu_period,
            cpu_quota: defaults.cpu_quota,
            cgroup_parent: defaults.cgroup_parent.clone(),
        }
    }

    /// Polls until the container runs. A container that exits right away is an error.
    async fn wait_running(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo, WorkbenchError> {
        let deadline = Instant::now() + self.timeouts.start_deadline();
        loop {
            let info = self
                .api
                .inspect_container(container_id)
                .await
                .map_err(|e| e.into_workbench("inspect container", container_id))?;
            if info.has_exited() {
                return Err(WorkbenchError::ContainerExited(container_id.to_string()));
            }
            if info.running {
                return Ok(info);
            }
            if Instant::now() >= deadline {
                return Err(WorkbenchError::RuntimeUnavailable {
                    operation: "start container".to_string(),
                    target: container_id.to_string(),
                    message: format!(
                        "not running after {:?}",
                        self.timeouts.start_deadline()
                    ),
                });
            }
            let interval = self.timeouts.start_poll_interval();
            cancellable(cancel, "start container", async {
                tokio::time::sleep(interval).await;
                Ok(())
            })
            .await?;
        }
    }

    async fn cleanup(&self, leftovers: Leftovers) {
        if let Some(container) = leftovers.container {
            match self.api.remove_container(&container, true, true).await {
                Ok(()) => debug!(container_id = %container, "Removed partially created container"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(container_id = %container, error = %e, "Failed to remove container after failed start")
                }
            }
        }
        if let Some(image) = leftovers.image {
            match self.api.remove_image(&image, false).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(image = %image, error = %e, "Failed to remove image after failed start"),
            }
        }
    }

    /// Stops the container: graceful stop within the grace period, then kill.
    pub async fn stop(&self, instance: &Instance) -> Result<(), WorkbenchError> {
        let container = instance.container_id.as_str();
        match self
            .api
            .stop_container(container, self.timeouts.stop_grace())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            // Already stopped.
            Err(ApiError::Daemon { status: 304, .. }) => return Ok(()),
            Err(e) => {
                warn!(container_id = %container, error = %e, "Graceful stop failed, killing container");
            }
        }
        match self.api.kill_container(container).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into_workbench("kill container", container)),
        }
    }

    /// Stops and removes the container, then drops its private image on a best-effort basis.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, container_id = %instance.container_id))]
    pub async fn destroy(&self, instance: &Instance) -> Result<(), WorkbenchError> {
        if let Err(e) = self.stop(instance).await {
            warn!(error = %e, "Stop before removal failed, forcing removal");
        }

        match self
            .api
            .remove_container(&instance.container_id, true, true)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Container already removed"),
            Err(e) => return Err(e.into_workbench("remove container", &instance.container_id)),
        }

        match self.api.remove_image(&instance.image, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(image = %instance.image, error = %e, "Failed to remove instance image"),
        }
        Ok(())
    }
}
