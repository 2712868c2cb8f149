//! Environment definitions: the machines of a workspace and the container specs backing them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::machine::{MachineConfig, MachineSource};

/// Machines declared by a workspace environment, in start order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub machines: Vec<MachineConfig>,
}

impl EnvironmentConfig {
    pub fn machine(&self, name: &str) -> Option<&MachineConfig> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn dev_machine(&self) -> Option<&MachineConfig> {
        self.machines.iter().find(|m| m.is_dev)
    }
}

/// Container level description of every service of an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerEnvironment {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl ContainerEnvironment {
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceSpec> {
        self.services.iter_mut().find(|s| s.name == name)
    }
}

/// Everything needed to create the container of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub source: MachineSource,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Colon-joined volume specs in the daemon wire format.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub memory_limit: Option<i64>,
    #[serde(default)]
    pub networks: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, source: MachineSource) -> Self {
        Self {
            name: name.into(),
            source,
            container_name: None,
            command: None,
            entrypoint: None,
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            expose: Vec::new(),
            labels: BTreeMap::new(),
            memory_limit: None,
            networks: Vec::new(),
        }
    }

    /// Service derived from a machine definition: its env, memory limit, and declared ports.
    pub fn from_machine(machine: &MachineConfig, source: MachineSource) -> Self {
        let mut service = Self::new(machine.name.clone(), source);
        service.environment = machine.env.clone();
        service.memory_limit = machine.memory_limit_bytes;
        for server in &machine.servers {
            service.add_expose(&server.normalized_port());
        }
        service
    }

    /// Appends a volume unless an identical spec is already present. Returns whether it was added.
    pub fn add_volume(&mut self, volume: impl Into<String>) -> bool {
        let volume = volume.into();
        if volume.is_empty() || self.volumes.contains(&volume) {
            return false;
        }
        self.volumes.push(volume);
        true
    }

    pub fn add_expose(&mut self, port: &str) -> bool {
        let port = crate::normalize_port(port);
        if self.expose.contains(&port) {
            return false;
        }
        self.expose.push(port);
        true
    }

    /// Sets an env var only when the service does not define it already.
    pub fn add_env_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.entry(key.into()).or_insert_with(|| value.into());
    }
}

/// One `host:container:options` mount. A spec without a host part is an anonymous volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub host: Option<String>,
    pub container: String,
    pub options: Option<String>,
}

impl VolumeSpec {
    pub fn bind(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            container: container.into(),
            options: None,
        }
    }

    pub fn anonymous(container: impl Into<String>) -> Self {
        Self {
            host: None,
            container: container.into(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Parses an already escaped spec. Drive letters must have been escaped beforehand.
    pub fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [container] if !container.is_empty() => Some(Self::anonymous(*container)),
            [host, container] if !host.is_empty() && !container.is_empty() => {
                Some(Self::bind(*host, *container))
            }
            [host, container, options] if !host.is_empty() && !container.is_empty() => {
                Some(Self::bind(*host, *container).with_options(*options))
            }
            _ => None,
        }
    }

    pub fn is_bind(&self) -> bool {
        self.host.is_some()
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{host}:")?;
        }
        write!(f, "{}", self.container)?;
        if let Some(options) = &self.options {
            write!(f, ":{options}")?;
        }
        Ok(())
    }
}
