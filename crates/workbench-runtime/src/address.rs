//! Address resolution for exposed servers.
//!
//! Which host a server is reachable on depends on the deployment topology. Both strategies
//! share one precedence order for hosts and only differ in which port they hand out for
//! internal addresses.

use serde::{Deserialize, Serialize};

use crate::docker::PortBinding;

/// How the resolving process reaches containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressStrategy {
    /// Same network as the containers: internal addresses use container ports.
    #[default]
    Local,
    /// No route to the container network: every address goes through published host ports.
    HostMappedPorts,
}

impl std::str::FromStr for AddressStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "" => Ok(AddressStrategy::Local),
            "host-mapped-ports" | "host_mapped_ports" | "default" => {
                Ok(AddressStrategy::HostMappedPorts)
            }
            other => Err(format!("unknown address strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    pub strategy: AddressStrategy,
    /// Host other machines use to reach this one. Outranks inspected data.
    pub internal_address: Option<String>,
    /// Host clients outside the container network use.
    pub external_address: Option<String>,
    /// Use the container IP for internal addresses even when an override is set.
    pub prefer_internal_ip: bool,
    /// Daemon host as seen by this process, usually derived from `DOCKER_HOST`.
    pub assisted_internal_host: Option<String>,
    pub assisted_external_host: Option<String>,
}

/// Hostnames supplied by the caller rather than read from the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostHints {
    pub internal: Option<String>,
    pub external: Option<String>,
}

impl HostHints {
    /// Extracts the daemon host from a `DOCKER_HOST` style URL. Socket transports yield nothing.
    pub fn from_docker_host(docker_host: Option<&str>) -> Self {
        let internal = docker_host
            .map(str::trim)
            .and_then(|url| {
                ["tcp://", "http://", "https://"]
                    .iter()
                    .find_map(|scheme| url.strip_prefix(scheme))
            })
            .map(|rest| rest.split('/').next().unwrap_or_default())
            .map(|authority| match authority.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
                _ => authority,
            })
            .filter(|host| !host.is_empty())
            .map(str::to_string);
        Self {
            internal,
            external: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHosts {
    pub internal: String,
    pub external: String,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl AddressConfig {
    pub fn hints(&self) -> HostHints {
        HostHints {
            internal: self.assisted_internal_host.clone(),
            external: self.assisted_external_host.clone(),
        }
    }

    /// Resolves the internal and external host for a container.
    ///
    /// Internal: preferred container IP, internal override, assisted host, container IP.
    /// External: external override, assisted external host, resolved internal host.
    /// `None` only when no source exists at all.
    pub fn resolve_hosts(
        &self,
        container_ip: Option<&str>,
        hints: &HostHints,
    ) -> Option<ResolvedHosts> {
        let container_ip = present(container_ip);

        let internal = container_ip
            .filter(|_| self.prefer_internal_ip)
            .or_else(|| present(self.internal_address.as_deref()))
            .or_else(|| present(hints.internal.as_deref()))
            .or(container_ip)?
            .to_string();

        let external = present(self.external_address.as_deref())
            .or_else(|| present(hints.external.as_deref()))
            .map(str::to_string)
            .unwrap_or_else(|| internal.clone());

        Some(ResolvedHosts { internal, external })
    }

    /// Picks `(internal_port, external_port)` for an exposed `port/transport`.
    pub fn resolve_ports(&self, exposed: &str, bindings: &[PortBinding]) -> (String, String) {
        let container_port = exposed.split('/').next().unwrap_or(exposed).to_string();
        let published = bindings
            .iter()
            .map(|b| b.host_port.trim())
            .find(|p| !p.is_empty())
            .map(str::to_string);
        let external = published.clone().unwrap_or_else(|| container_port.clone());
        let internal = match self.strategy {
            AddressStrategy::Local => container_port,
            AddressStrategy::HostMappedPorts => external.clone(),
        };
        (internal, external)
    }
}
