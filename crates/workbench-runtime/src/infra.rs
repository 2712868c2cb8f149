//! Mounts and env every workspace container gets regardless of its recipe.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use workbench_common::{
    ContainerEnvironment, EnvironmentConfig, ServiceSpec, VolumeSpec, WorkbenchError,
};

use crate::folders::WorkspaceFolderPathProvider;
use crate::path_escape::PathConvention;

/// Env var pointing agents at the machine local configuration directory.
pub const LOCAL_CONF_DIR_ENV: &str = "WORKBENCH_LOCAL_CONF_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    /// Terminal helper volume, added to every service.
    pub terminal_volume: Option<String>,
    /// Exec agent helper volume, added to every service.
    pub exec_volume: Option<String>,
    /// IDE agent bundle, dev machine only.
    pub agent_volume: Option<String>,
    /// Where project files are mounted inside the dev machine.
    pub projects_path: String,
    /// Mount options of the projects bind, e.g. `Z` on SELinux hosts.
    pub projects_volume_options: Option<String>,
    /// Container paths kept out of committed snapshots.
    pub snapshot_excludes: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
    pub local_conf_dir: Option<String>,
    pub host_path_convention: PathConvention,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            terminal_volume: None,
            exec_volume: None,
            agent_volume: None,
            projects_path: "/projects".to_string(),
            projects_volume_options: None,
            snapshot_excludes: Vec::new(),
            extra_env: BTreeMap::new(),
            local_conf_dir: None,
            host_path_convention: PathConvention::current(),
        }
    }
}

pub struct InfrastructureProvisioner {
    config: InfraConfig,
    folders: Arc<dyn WorkspaceFolderPathProvider>,
}

impl InfrastructureProvisioner {
    pub fn new(config: InfraConfig, folders: Arc<dyn WorkspaceFolderPathProvider>) -> Self {
        Self { config, folders }
    }

    /// Provisions every service of an environment.
    ///
    /// Fails before touching any service when the dev machine is missing or its project
    /// folder can't be resolved.
    #[instrument(skip(self, environment, internal), fields(environment = %environment.name))]
    pub async fn provision(
        &self,
        workspace_id: &str,
        environment: &EnvironmentConfig,
        internal: &mut ContainerEnvironment,
    ) -> Result<(), WorkbenchError> {
        let dev = environment
            .dev_machine()
            .ok_or_else(|| WorkbenchError::DevMachineNotFound(environment.name.clone()))?;
        if internal.service(&dev.name).is_none() {
            return Err(WorkbenchError::DevMachineNotFound(dev.name.clone()));
        }

        let projects = self.folders.host_path(workspace_id).await?;
        let dev_name = dev.name.clone();
        for service in &mut internal.services {
            let is_dev = service.name == dev_name;
            self.apply(service, is_dev.then_some(projects.as_path()));
        }
        debug!(workspace_id, services = internal.services.len(), "Provisioned environment");
        Ok(())
    }

    /// Provisions a single service. Safe to call more than once on the same service.
    pub async fn provision_service(
        &self,
        workspace_id: &str,
        service: &mut ServiceSpec,
        is_dev: bool,
    ) -> Result<(), WorkbenchError> {
        let projects = if is_dev {
            Some(self.folders.host_path(workspace_id).await?)
        } else {
            None
        };
        self.apply(service, projects.as_deref());
        Ok(())
    }

    fn apply(&self, service: &mut ServiceSpec, projects: Option<&Path>) {
        let config = &self.config;
        for helper in [&config.terminal_volume, &config.exec_volume]
            .into_iter()
            .flatten()
        {
            service.add_volume(helper.clone());
        }

        if let Some(host_path) = projects {
            let host = config
                .host_path_convention
                .escape(&host_path.to_string_lossy());
            let mut volume = VolumeSpec::bind(host, config.projects_path.clone());
            if let Some(options) = &config.projects_volume_options {
                volume = volume.with_options(options.clone());
            }
            service.add_volume(volume.to_string());
            if let Some(agent) = &config.agent_volume {
                service.add_volume(agent.clone());
            }
        }

        for path in &config.snapshot_excludes {
            service.add_volume(VolumeSpec::anonymous(path.clone()).to_string());
        }

        for (key, value) in &config.extra_env {
            service.add_env_if_absent(key.clone(), value.clone());
        }
        if let Some(dir) = &config.local_conf_dir {
            service.add_env_if_absent(LOCAL_CONF_DIR_ENV, dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use workbench_common::{MachineConfig, MachineSource};

    struct FixedFolders(PathBuf);

    #[async_trait]
    impl WorkspaceFolderPathProvider for FixedFolders {
        async fn host_path(&self, _workspace_id: &str) -> Result<PathBuf, WorkbenchError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenFolders;

    #[async_trait]
    impl WorkspaceFolderPathProvider for BrokenFolders {
        async fn host_path(&self, workspace_id: &str) -> Result<PathBuf, WorkbenchError> {
            Err(WorkbenchError::PathResolution {
                workspace_id: workspace_id.to_string(),
                message: "storage unreachable".into(),
            })
        }
    }

    fn config() -> InfraConfig {
        InfraConfig {
            terminal_volume: Some("/usr/local/workbench/terminal:/mnt/terminal:ro".into()),
            exec_volume: Some("/usr/local/workbench/exec:/mnt/exec:ro".into()),
            agent_volume: Some("/usr/local/workbench/ws-agent:/mnt/ws-agent:ro".into()),
            projects_path: "/projects".into(),
            projects_volume_options: Some("Z".into()),
            snapshot_excludes: vec!["/projects/.m2".into()],
            extra_env: BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
            local_conf_dir: Some("/mnt/workbench/conf".into()),
            host_path_convention: PathConvention::Unix,
        }
    }

    fn environment() -> (EnvironmentConfig, ContainerEnvironment) {
        let env = EnvironmentConfig {
            name: "default".into(),
            machines: vec![MachineConfig::dev("dev"), MachineConfig::new("db")],
        };
        let internal = ContainerEnvironment {
            network: None,
            services: vec![
                ServiceSpec::new("dev", MachineSource::image("ubuntu")),
                ServiceSpec::new("db", MachineSource::image("postgres")),
            ],
        };
        (env, internal)
    }

    #[tokio::test]
    async fn test_dev_and_helper_volumes() {
        let provisioner = InfrastructureProvisioner::new(
            config(),
            Arc::new(FixedFolders("/var/lib/workbench/ws1".into())),
        );
        let (env, mut internal) = environment();
        internal.services[0]
            .environment
            .insert("LANG".into(), "en_US.UTF-8".into());
        provisioner.provision("ws1", &env, &mut internal).await.unwrap();

        let dev = internal.service("dev").unwrap();
        assert!(dev
            .volumes
            .contains(&"/var/lib/workbench/ws1:/projects:Z".to_string()));
        assert!(dev
            .volumes
            .contains(&"/usr/local/workbench/ws-agent:/mnt/ws-agent:ro".to_string()));
        assert!(dev.volumes.contains(&"/projects/.m2".to_string()));
        assert_eq!(dev.environment["LANG"], "en_US.UTF-8");
        assert_eq!(dev.environment[LOCAL_CONF_DIR_ENV], "/mnt/workbench/conf");

        let db = internal.service("db").unwrap();
        assert_eq!(
            db.volumes,
            vec![
                "/usr/local/workbench/terminal:/mnt/terminal:ro".to_string(),
                "/usr/local/workbench/exec:/mnt/exec:ro".to_string(),
                "/projects/.m2".to_string(),
            ]
        );
        assert_eq!(db.environment["LANG"], "C.UTF-8");
    }

    #[tokio::test]
    async fn test_provisioning_twice_adds_nothing() {
        let provisioner =
            InfrastructureProvisioner::new(config(), Arc::new(FixedFolders("/srv/ws1".into())));
        let (env, mut internal) = environment();
        provisioner.provision("ws1", &env, &mut internal).await.unwrap();
        let first = internal.clone();
        provisioner.provision("ws1", &env, &mut internal).await.unwrap();
        assert_eq!(first, internal);
    }

    #[tokio::test]
    async fn test_windows_host_paths_are_escaped() {
        let provisioner = InfrastructureProvisioner::new(
            InfraConfig {
                host_path_convention: PathConvention::Windows,
                projects_volume_options: None,
                ..config()
            },
            Arc::new(FixedFolders(PathBuf::from(r"C:\workbench\ws1"))),
        );
        let mut service = ServiceSpec::new("dev", MachineSource::image("ubuntu"));
        provisioner
            .provision_service("ws1", &mut service, true)
            .await
            .unwrap();
        assert!(service
            .volumes
            .contains(&"/c/workbench/ws1:/projects".to_string()));
    }

    #[tokio::test]
    async fn test_missing_dev_machine() {
        let provisioner =
            InfrastructureProvisioner::new(config(), Arc::new(FixedFolders("/srv".into())));
        let (mut env, mut internal) = environment();
        env.machines[0].is_dev = false;
        let err = provisioner
            .provision("ws1", &env, &mut internal)
            .await
            .unwrap_err();
        assert!(err.is_structural());
        assert!(internal.services.iter().all(|s| s.volumes.is_empty()));
    }

    #[tokio::test]
    async fn test_path_failure_leaves_services_untouched() {
        let provisioner = InfrastructureProvisioner::new(config(), Arc::new(BrokenFolders));
        let (env, mut internal) = environment();
        let err = provisioner
            .provision("ws1", &env, &mut internal)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkbenchError::PathResolution { .. }));
        assert!(internal.services.iter().all(|s| s.volumes.is_empty()));
    }
}
