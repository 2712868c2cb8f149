//! The lifecycle façade: creates, stops, destroys and snapshots instances.
//!
//! Mutating operations on one instance are serialized by a per-instance lock and run on a
//! bounded pool of permits. Reads take no lock and may observe an instance mid-change.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use workbench_common::{
    ContainerEnvironment, EnvironmentConfig, InstanceKey, MachineConfig, MachineSource, Server,
    ServiceSpec, WorkbenchError,
};

use crate::address::HostHints;
use crate::agents::AgentCatalog;
use crate::config::RuntimeConfig;
use crate::daemon::DockerDaemon;
use crate::docker::ContainerApi;
use crate::folders::{LocalWorkspaceFolders, WorkspaceFolderPathProvider};
use crate::infra::InfrastructureProvisioner;
use crate::logs::LogSink;
use crate::provisioner::{Instance, InstanceProvisioner, InstanceState, InstanceTarget};
use crate::servers::{RuntimeInfo, ServersAssembler};
use crate::snapshot::SnapshotManager;

enum Provision {
    FromSource(MachineSource),
    FromService(ServiceSpec),
}

struct Inner {
    api: Arc<dyn ContainerApi>,
    infra: Arc<InfrastructureProvisioner>,
    provisioner: InstanceProvisioner,
    assembler: ServersAssembler,
    snapshots: SnapshotManager,
    agents: AgentCatalog,
    hints: HostHints,
    instances: DashMap<String, Instance>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct WorkspaceRuntime {
    inner: Arc<Inner>,
}

async fn join<T>(handle: JoinHandle<Result<T, WorkbenchError>>) -> Result<T, WorkbenchError> {
    handle.await.map_err(|e| WorkbenchError::Remote {
        operation: "lifecycle task".to_string(),
        target: String::new(),
        message: e.to_string(),
    })?
}

fn instance_not_found(instance_id: &str) -> WorkbenchError {
    WorkbenchError::NotFound(format!("instance {instance_id}"))
}

fn wrong_state(operation: &str, instance: &Instance) -> WorkbenchError {
    WorkbenchError::Conflict {
        operation: operation.to_string(),
        target: instance.id.clone(),
        message: format!("instance is {}", instance.state),
    }
}

impl WorkspaceRuntime {
    pub fn new(
        config: RuntimeConfig,
        api: Arc<dyn ContainerApi>,
        folders: Arc<dyn WorkspaceFolderPathProvider>,
    ) -> Result<Self, WorkbenchError> {
        config.validate()?;
        let auth = Arc::new(config.auth_resolver());
        let infra = Arc::new(InfrastructureProvisioner::new(config.infra.clone(), folders));
        let provisioner = InstanceProvisioner::new(
            api.clone(),
            infra.clone(),
            auth.clone(),
            config.servers.clone(),
            config.container.clone(),
            config.timeouts.clone(),
            config.snapshot.use_registry,
        );
        let snapshots =
            SnapshotManager::new(api.clone(), auth, config.snapshot.clone(), &config.timeouts)?;
        let hints = config.address.hints();
        let assembler = ServersAssembler::new(config.address, config.servers);

        Ok(Self {
            inner: Arc::new(Inner {
                api,
                infra,
                provisioner,
                assembler,
                snapshots,
                agents: config.agents,
                hints,
                instances: DashMap::new(),
                locks: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_operations)),
            }),
        })
    }

    /// Runtime backed by the Docker daemon and local workspace folders.
    pub fn connect(config: RuntimeConfig) -> Result<Self, WorkbenchError> {
        let daemon = DockerDaemon::connect(config.timeouts.clone())
            .map_err(|e| e.into_workbench("connect", "container daemon"))?;
        let folders = LocalWorkspaceFolders::new(config.workspaces_root.clone());
        Self::new(config, Arc::new(daemon), Arc::new(folders))
    }

    async fn lock(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .locks
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit, WorkbenchError> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkbenchError::RuntimeUnavailable {
                operation: "acquire worker".to_string(),
                target: "lifecycle pool".to_string(),
                message: "worker pool is closed".to_string(),
            })
    }

    fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(mut instance) = self.inner.instances.get_mut(instance_id) {
            if !instance.state.can_transition_to(state) {
                debug!(instance_id, from = %instance.state, to = %state, "Forcing state change");
            }
            instance.state = state;
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.inner
            .instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Creates and starts an instance. Cancelling `cancel` removes whatever was created so far.
    #[instrument(skip(self, machine, source, logs, cancel), fields(machine = %machine.name))]
    pub async fn create_instance(
        &self,
        workspace_id: &str,
        machine: MachineConfig,
        source: MachineSource,
        logs: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<Instance, WorkbenchError> {
        source.validate()?;
        let machine = self.inner.agents.apply(machine)?;
        self.spawn_create(workspace_id, machine, Provision::FromSource(source), logs, cancel)
            .await
    }

    async fn spawn_create(
        &self,
        workspace_id: &str,
        machine: MachineConfig,
        provision: Provision,
        logs: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<Instance, WorkbenchError> {
        let target = InstanceTarget {
            instance_id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            machine,
        };
        self.inner.instances.insert(
            target.instance_id.clone(),
            Instance {
                id: target.instance_id.clone(),
                workspace_id: target.workspace_id.clone(),
                machine: target.machine.clone(),
                container_id: String::new(),
                container_name: String::new(),
                image: String::new(),
                state: InstanceState::Creating,
                created_at: chrono::Utc::now(),
            },
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = this.lock(&target.instance_id).await;
            let result = match this.permit().await {
                Ok(_permit) => {
                    let provisioner = &this.inner.provisioner;
                    match provision {
                        Provision::FromSource(source) => {
                            provisioner
                                .create_instance(&target, &source, logs.as_ref(), &cancel)
                                .await
                        }
                        Provision::FromService(service) => {
                            provisioner
                                .create_from_service(&target, service, logs.as_ref(), &cancel)
                                .await
                        }
                    }
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(instance) => {
                    this.inner
                        .instances
                        .insert(instance.id.clone(), instance.clone());
                    Ok(instance)
                }
                Err(e) => {
                    this.set_state(&target.instance_id, InstanceState::Failed);
                    Err(e)
                }
            }
        });
        join(handle).await
    }

    /// Stops and removes an instance.
    ///
    /// Destroying an already destroyed instance succeeds without touching the daemon.
    /// Once started, the teardown runs to completion even if the caller goes away.
    pub async fn destroy(&self, instance_id: &str) -> Result<(), WorkbenchError> {
        let this = self.clone();
        let instance_id = instance_id.to_string();
        let handle = tokio::spawn(async move { this.destroy_locked(&instance_id).await });
        join(handle).await
    }

    #[instrument(skip(self))]
    async fn destroy_locked(&self, instance_id: &str) -> Result<(), WorkbenchError> {
        let _guard = self.lock(instance_id).await;
        let instance = self
            .instance(instance_id)
            .ok_or_else(|| instance_not_found(instance_id))?;
        match instance.state {
            InstanceState::Destroyed => {
                debug!("Instance already destroyed");
                self.inner.locks.remove(instance_id);
                return Ok(());
            }
            InstanceState::Running
            | InstanceState::Stopping
            | InstanceState::Stopped
            | InstanceState::Failed => {}
            _ => return Err(wrong_state("destroy", &instance)),
        }
        if instance.container_id.is_empty() {
            // Failed before a container existed; creation already cleaned up.
            self.set_state(instance_id, InstanceState::Destroyed);
            self.inner.locks.remove(instance_id);
            return Ok(());
        }

        let _permit = self.permit().await?;
        self.set_state(instance_id, InstanceState::Destroying);
        match self.inner.provisioner.destroy(&instance).await {
            Ok(()) => {
                self.set_state(instance_id, InstanceState::Destroyed);
                self.inner.locks.remove(instance_id);
                info!(container_id = %instance.container_id, "Instance destroyed");
                Ok(())
            }
            Err(e) => {
                self.set_state(instance_id, instance.state);
                Err(e)
            }
        }
    }

    /// Stops an instance without removing its container.
    ///
    /// Like `destroy`, the stop keeps running if the caller goes away.
    pub async fn stop(&self, instance_id: &str) -> Result<(), WorkbenchError> {
        let this = self.clone();
        let instance_id = instance_id.to_string();
        let handle = tokio::spawn(async move { this.stop_locked(&instance_id).await });
        join(handle).await
    }

    #[instrument(skip(self))]
    async fn stop_locked(&self, instance_id: &str) -> Result<(), WorkbenchError> {
        let _guard = self.lock(instance_id).await;
        let instance = self
            .instance(instance_id)
            .ok_or_else(|| instance_not_found(instance_id))?;
        match instance.state {
            InstanceState::Stopped => return Ok(()),
            InstanceState::Running => {}
            _ => return Err(wrong_state("stop", &instance)),
        }

        let _permit = self.permit().await?;
        self.set_state(instance_id, InstanceState::Stopping);
        match self.inner.provisioner.stop(&instance).await {
            Ok(()) => {
                self.set_state(instance_id, InstanceState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.set_state(instance_id, InstanceState::Failed);
                Err(e)
            }
        }
    }

    /// Inspects the container and resolves its servers. Never cached.
    pub async fn runtime_info(&self, instance_id: &str) -> Result<RuntimeInfo, WorkbenchError> {
        let instance = self
            .instance(instance_id)
            .filter(|i| i.state != InstanceState::Destroyed && !i.container_id.is_empty())
            .ok_or_else(|| instance_not_found(instance_id))?;
        let container = self
            .inner
            .api
            .inspect_container(&instance.container_id)
            .await
            .map_err(|e| e.into_workbench("inspect container", &instance.container_id))?;
        self.inner
            .assembler
            .runtime_info(container, &instance.machine, &self.inner.hints)
    }

    pub async fn servers(
        &self,
        instance_id: &str,
    ) -> Result<BTreeMap<String, Server>, WorkbenchError> {
        Ok(self.runtime_info(instance_id).await?.servers)
    }

    /// Commits a running instance.
    pub async fn save(
        &self,
        instance_id: &str,
        logs: Arc<dyn LogSink>,
    ) -> Result<InstanceKey, WorkbenchError> {
        let _guard = self.lock(instance_id).await;
        let instance = self
            .instance(instance_id)
            .filter(|i| i.state != InstanceState::Destroyed)
            .ok_or_else(|| instance_not_found(instance_id))?;
        if instance.state != InstanceState::Running {
            return Err(wrong_state("snapshot", &instance));
        }
        let _permit = self.permit().await?;
        self.inner.snapshots.save(&instance, logs.as_ref()).await
    }

    /// Creates a new instance of `machine` from a snapshot.
    pub async fn restore(
        &self,
        workspace_id: &str,
        machine: MachineConfig,
        key: &InstanceKey,
        logs: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<Instance, WorkbenchError> {
        let source = MachineSource::image(key.location());
        self.create_instance(workspace_id, machine, source, logs, cancel)
            .await
    }

    pub async fn remove_snapshot(&self, key: &InstanceKey) -> Result<(), WorkbenchError> {
        let _permit = self.permit().await?;
        self.inner.snapshots.remove_snapshot(key).await
    }

    /// Starts every machine of an environment, dev machine first.
    ///
    /// Infrastructure is provisioned once for the whole environment. If any machine fails
    /// to start, the machines started before it are destroyed again.
    #[instrument(skip_all, fields(workspace_id = %workspace_id, environment = %environment.name))]
    pub async fn start_environment(
        &self,
        workspace_id: &str,
        mut environment: EnvironmentConfig,
        mut internal: ContainerEnvironment,
        logs: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<Vec<Instance>, WorkbenchError> {
        environment.machines = environment
            .machines
            .into_iter()
            .map(|machine| self.inner.agents.apply(machine))
            .collect::<Result<_, _>>()?;

        let env_network = internal.network.clone();
        for machine in &environment.machines {
            let service = internal.service_mut(&machine.name).ok_or_else(|| {
                WorkbenchError::Config(format!(
                    "environment {} has no service for machine {}",
                    environment.name, machine.name
                ))
            })?;
            service.source.validate()?;
            for server in &machine.servers {
                service.add_expose(&server.port);
            }
            for (key, value) in &machine.env {
                service.add_env_if_absent(key, value);
            }
            if let Some(network) = &env_network {
                if service.networks.is_empty() {
                    service.networks.push(network.clone());
                }
            }
        }

        self.inner
            .infra
            .provision(workspace_id, &environment, &mut internal)
            .await?;

        let mut machines = environment.machines.clone();
        machines.sort_by_key(|m| !m.is_dev);

        let mut started: Vec<Instance> = Vec::new();
        for machine in machines {
            let result = match internal.service(&machine.name).cloned() {
                Some(service) => {
                    self.spawn_create(
                        workspace_id,
                        machine,
                        Provision::FromService(service),
                        logs.clone(),
                        cancel.clone(),
                    )
                    .await
                }
                None => Err(WorkbenchError::Config(format!(
                    "service of machine {} disappeared during provisioning",
                    machine.name
                ))),
            };
            match result {
                Ok(instance) => started.push(instance),
                Err(e) => {
                    warn!(error = %e, started = started.len(), "Environment start failed, destroying started machines");
                    for instance in started.iter().rev() {
                        if let Err(destroy_err) = self.destroy(&instance.id).await {
                            error!(instance_id = %instance.id, error = %destroy_err, "Failed to destroy machine after failed start");
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(machines = started.len(), "Environment started");
        Ok(started)
    }

    /// Stops the given instances, optionally snapshotting each one first.
    ///
    /// Returns the snapshots taken, keyed by machine name. Failures are logged per machine
    /// and never stop the remaining ones from being torn down.
    pub async fn stop_environment(
        &self,
        instance_ids: &[String],
        create_snapshot: bool,
        logs: Arc<dyn LogSink>,
    ) -> BTreeMap<String, InstanceKey> {
        let mut snapshots = BTreeMap::new();
        for instance_id in instance_ids {
            if create_snapshot {
                match self.save(instance_id, logs.clone()).await {
                    Ok(key) => {
                        let machine = self
                            .instance(instance_id)
                            .map(|i| i.machine.name)
                            .unwrap_or_else(|| instance_id.clone());
                        snapshots.insert(machine, key);
                    }
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = %e, "Failed to snapshot machine")
                    }
                }
            }
            if let Err(e) = self.destroy(instance_id).await {
                error!(instance_id = %instance_id, error = %e, "Failed to destroy machine");
            }
        }
        snapshots
    }
}
