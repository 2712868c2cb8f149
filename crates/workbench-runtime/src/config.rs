//! Runtime configuration, loaded from `WORKBENCH_*` env vars or a TOML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use workbench_common::WorkbenchError;

use crate::address::{AddressConfig, HostHints};
use crate::agents::AgentCatalog;
use crate::auth::{parse_entries, Credentials, RegistryAuthResolver};
use crate::infra::InfraConfig;
use crate::provisioner::ContainerDefaults;
use crate::servers::ServerCatalog;
use crate::snapshot::SnapshotConfig;

/// Bounds for every remote call. Nothing in the runtime waits without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_secs: u64,
    /// Whole build, pull, push or commit.
    pub build_secs: u64,
    /// Longest silence tolerated between two items of a progress stream.
    pub stream_step_secs: u64,
    pub stop_grace_secs: u64,
    pub registry_connect_secs: u64,
    pub registry_request_secs: u64,
    pub start_poll_interval_ms: u64,
    pub start_deadline_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            build_secs: 30 * 60,
            stream_step_secs: 5 * 60,
            stop_grace_secs: 10,
            registry_connect_secs: 10,
            registry_request_secs: 60,
            start_poll_interval_ms: 250,
            start_deadline_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs.max(1))
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs.max(1))
    }

    pub fn stream_step(&self) -> Duration {
        Duration::from_secs(self.stream_step_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn registry_connect(&self) -> Duration {
        Duration::from_secs(self.registry_connect_secs.max(1))
    }

    pub fn registry_request(&self) -> Duration {
        Duration::from_secs(self.registry_request_secs.max(1))
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms.max(10))
    }

    pub fn start_deadline(&self) -> Duration {
        Duration::from_secs(self.start_deadline_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub address: AddressConfig,
    pub servers: ServerCatalog,
    pub agents: AgentCatalog,
    pub infra: InfraConfig,
    pub container: ContainerDefaults,
    pub snapshot: SnapshotConfig,
    pub timeouts: TimeoutConfig,
    /// Registry hostname to credentials. Hub synonyms share one entry.
    pub registry_auth: BTreeMap<String, Credentials>,
    pub workspaces_root: PathBuf,
    /// Size of the worker pool for create, destroy and snapshot operations.
    pub max_concurrent_operations: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            address: AddressConfig::default(),
            servers: ServerCatalog::default(),
            agents: AgentCatalog::default(),
            infra: InfraConfig::default(),
            container: ContainerDefaults::default(),
            snapshot: SnapshotConfig::default(),
            timeouts: TimeoutConfig::default(),
            registry_auth: BTreeMap::new(),
            workspaces_root: PathBuf::from("/var/lib/workbench/workspaces"),
            max_concurrent_operations: 8,
        }
    }
}

fn config_err(key: &str, value: &str, reason: impl std::fmt::Display) -> WorkbenchError {
    WorkbenchError::Config(format!("invalid {key}='{value}': {reason}"))
}

/// Splits a list value, dropping blanks and duplicates while keeping order.
pub(crate) fn split_list(value: &str, separators: &[char]) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.split(separators).map(str::trim) {
        if !item.is_empty() && !items.iter().any(|i| i == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Typed access to a key/value source such as the process environment.
struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, WorkbenchError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e| config_err(key, &value, e)),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, WorkbenchError> {
        match self.string(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(config_err(key, &value, "expected a boolean")),
            },
            None => Ok(None),
        }
    }

    fn list(&self, key: &str, separators: &[char]) -> Option<Vec<String>> {
        self.string(key).map(|v| split_list(&v, separators))
    }

    /// `KEY=VALUE` pairs separated by `;`.
    fn map(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, WorkbenchError> {
        let Some(value) = self.string(key) else {
            return Ok(None);
        };
        let mut map = BTreeMap::new();
        for entry in split_list(&value, &[';']) {
            let (k, v) = entry
                .split_once('=')
                .ok_or_else(|| config_err(key, &entry, "expected KEY=VALUE"))?;
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(Some(map))
    }
}

macro_rules! set_if {
    ($target:expr, $value:expr) => {
        if let Some(value) = $value {
            $target = value;
        }
    };
}

impl RuntimeConfig {
    /// Reads `WORKBENCH_*` variables over the defaults.
    pub fn from_env() -> Result<Self, WorkbenchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkbenchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let mut config = RuntimeConfig::default();

        let address = &mut config.address;
        set_if!(address.strategy, env.parse("WORKBENCH_ADDRESS_STRATEGY")?);
        address.internal_address = env.string("WORKBENCH_INTERNAL_ADDRESS");
        address.external_address = env.string("WORKBENCH_EXTERNAL_ADDRESS");
        set_if!(address.prefer_internal_ip, env.flag("WORKBENCH_PREFER_INTERNAL_IP")?);
        address.assisted_internal_host = env
            .string("WORKBENCH_ASSISTED_INTERNAL_HOST")
            .or_else(|| HostHints::from_docker_host(env.string("DOCKER_HOST").as_deref()).internal);
        address.assisted_external_host = env.string("WORKBENCH_ASSISTED_EXTERNAL_HOST");

        let infra = &mut config.infra;
        infra.terminal_volume = env.string("WORKBENCH_TERMINAL_VOLUME");
        infra.exec_volume = env.string("WORKBENCH_EXEC_VOLUME");
        infra.agent_volume = env.string("WORKBENCH_AGENT_VOLUME");
        set_if!(infra.projects_path, env.string("WORKBENCH_PROJECTS_PATH"));
        infra.projects_volume_options = env.string("WORKBENCH_PROJECTS_VOLUME_OPTIONS");
        set_if!(
            infra.snapshot_excludes,
            env.list("WORKBENCH_SNAPSHOT_EXCLUDES", &[';'])
        );
        set_if!(infra.extra_env, env.map("WORKBENCH_EXTRA_ENV")?);
        infra.local_conf_dir = env.string("WORKBENCH_LOCAL_CONF_DIR");
        set_if!(
            infra.host_path_convention,
            env.parse("WORKBENCH_HOST_PATH_CONVENTION")?
        );

        let container = &mut config.container;
        set_if!(
            container.default_memory_bytes,
            env.parse("WORKBENCH_DEFAULT_MEMORY_BYTES")?
        );
        set_if!(
            container.memory_swap_multiplier,
            env.parse("WORKBENCH_MEMORY_SWAP_MULTIPLIER")?
        );
        container.pids_limit = env.parse("WORKBENCH_PIDS_LIMIT")?;
        set_if!(container.privileged, env.flag("WORKBENCH_PRIVILEGED")?);
        set_if!(
            container.publish_all_ports,
            env.flag("WORKBENCH_PUBLISH_ALL_PORTS")?
        );
        container.network = env.string("WORKBENCH_NETWORK");
        set_if!(container.extra_hosts, env.list("WORKBENCH_EXTRA_HOSTS", &[',']));
        set_if!(container.dns, env.list("WORKBENCH_DNS", &[',']));
        container.cpuset_cpus = env.string("WORKBENCH_CPUSET_CPUS");
        container.cpu_period = env.parse("WORKBENCH_CPU_PERIOD")?;
        container.cpu_quota = env.parse("WORKBENCH_CPU_QUOTA")?;
        container.cgroup_parent = env.string("WORKBENCH_CGROUP_PARENT");
        set_if!(container.build_args, env.map("WORKBENCH_BUILD_ARGS")?);
        set_if!(container.force_pull, env.flag("WORKBENCH_FORCE_PULL")?);
        set_if!(
            container.system_volumes,
            env.list("WORKBENCH_SYSTEM_VOLUMES", &[';'])
        );
        set_if!(
            container.dev_system_volumes,
            env.list("WORKBENCH_DEV_SYSTEM_VOLUMES", &[';'])
        );
        set_if!(container.system_env, env.map("WORKBENCH_SYSTEM_ENV")?);
        set_if!(container.dev_system_env, env.map("WORKBENCH_DEV_SYSTEM_ENV")?);

        let snapshot = &mut config.snapshot;
        set_if!(
            snapshot.use_registry,
            env.flag("WORKBENCH_SNAPSHOT_USE_REGISTRY")?
        );
        snapshot.registry = env.string("WORKBENCH_SNAPSHOT_REGISTRY");
        set_if!(
            snapshot.registry_scheme,
            env.string("WORKBENCH_SNAPSHOT_REGISTRY_SCHEME")
        );
        snapshot.namespace = env.string("WORKBENCH_SNAPSHOT_NAMESPACE");
        set_if!(snapshot.hub_url, env.string("WORKBENCH_SNAPSHOT_HUB_URL"));

        let timeouts = &mut config.timeouts;
        set_if!(
            timeouts.request_secs,
            env.parse("WORKBENCH_REQUEST_TIMEOUT_SECS")?
        );
        set_if!(timeouts.build_secs, env.parse("WORKBENCH_BUILD_TIMEOUT_SECS")?);
        set_if!(
            timeouts.stop_grace_secs,
            env.parse("WORKBENCH_STOP_GRACE_SECS")?
        );
        set_if!(
            timeouts.registry_connect_secs,
            env.parse("WORKBENCH_REGISTRY_CONNECT_TIMEOUT_SECS")?
        );
        set_if!(
            timeouts.start_deadline_secs,
            env.parse("WORKBENCH_START_TIMEOUT_SECS")?
        );

        if let Some(auth) = env.string("WORKBENCH_REGISTRY_AUTH") {
            config.registry_auth.extend(parse_entries(&auth)?);
        }

        set_if!(
            config.workspaces_root,
            env.string("WORKBENCH_WORKSPACES_ROOT").map(PathBuf::from)
        );
        set_if!(
            config.max_concurrent_operations,
            env.parse("WORKBENCH_MAX_CONCURRENT_OPERATIONS")?
        );

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, WorkbenchError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WorkbenchError::Config(format!("can't read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, WorkbenchError> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| WorkbenchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkbenchError> {
        if self.max_concurrent_operations == 0 {
            return Err(WorkbenchError::Config(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        let multiplier = self.container.memory_swap_multiplier;
        if multiplier != -1.0 && multiplier < 0.0 {
            return Err(WorkbenchError::Config(format!(
                "memory swap multiplier must be -1 or non-negative, got {multiplier}"
            )));
        }
        if self.snapshot.use_registry && self.snapshot.registry.is_none() {
            return Err(WorkbenchError::Config(
                "registry-backed snapshots need a snapshot registry".into(),
            ));
        }
        if !self.infra.projects_path.starts_with('/') {
            return Err(WorkbenchError::Config(format!(
                "projects path must be absolute, got '{}'",
                self.infra.projects_path
            )));
        }
        Ok(())
    }

    pub fn auth_resolver(&self) -> RegistryAuthResolver {
        RegistryAuthResolver::new(
            self.registry_auth
                .iter()
                .map(|(registry, creds)| (registry.as_str(), creds.clone())),
        )
    }
}
