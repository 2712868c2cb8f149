//! Runtime info assembly: which servers an instance exposes and where to reach them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use workbench_common::{normalize_port, MachineConfig, Server, ServerConfig, WorkbenchError};

use crate::address::{AddressConfig, AddressStrategy, HostHints};
use crate::docker::ContainerInfo;

/// Servers every machine exposes without declaring them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCatalog {
    pub all_machines: Vec<ServerConfig>,
    /// Added on top of `all_machines` for the dev machine only.
    pub dev_machine: Vec<ServerConfig>,
}

impl ServerCatalog {
    /// Effective servers of a machine keyed by normalized port.
    ///
    /// System servers are applied first and the machine's declared servers last, so a
    /// declared server always wins a port collision.
    pub fn effective_servers(&self, machine: &MachineConfig) -> BTreeMap<String, ServerConfig> {
        let mut servers = BTreeMap::new();
        for server in &self.all_machines {
            servers.insert(server.normalized_port(), server.clone());
        }
        if machine.is_dev {
            for server in &self.dev_machine {
                if let Some(previous) = servers.insert(server.normalized_port(), server.clone()) {
                    debug!(
                        port = %server.normalized_port(),
                        replaced = %previous.name,
                        "Dev machine server overrides system server"
                    );
                }
            }
        }
        for server in &machine.servers {
            if let Some(previous) = servers.insert(server.normalized_port(), server.clone()) {
                warn!(
                    machine = %machine.name,
                    port = %server.normalized_port(),
                    declared = %server.name,
                    replaced = %previous.name,
                    "Declared server collides with a system server, declared one wins"
                );
            }
        }
        servers
    }
}

/// Inspection result combined with the servers it exposes. Recompute rather than cache.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub container: ContainerInfo,
    pub servers: BTreeMap<String, Server>,
    pub inspected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ServersAssembler {
    address: AddressConfig,
    catalog: ServerCatalog,
}

impl ServersAssembler {
    pub fn new(address: AddressConfig, catalog: ServerCatalog) -> Self {
        Self { address, catalog }
    }

    /// Builds the servers map of a container, keyed by server name.
    ///
    /// Exposed ports without a config are reported under their normalized port with
    /// protocol `tcp`. A container without network settings yields an empty map.
    pub fn build_servers(
        &self,
        container: &ContainerInfo,
        hints: &HostHints,
        configs: &BTreeMap<String, ServerConfig>,
    ) -> Result<BTreeMap<String, Server>, WorkbenchError> {
        let Some(network) = &container.network else {
            return Ok(BTreeMap::new());
        };

        let hosts = self
            .address
            .resolve_hosts(network.container_ip(), hints)
            .ok_or_else(|| WorkbenchError::AddressUnresolved(container.id.clone()))?;

        let host_mapped = self.address.strategy == AddressStrategy::HostMappedPorts;
        let mut servers = BTreeMap::new();
        for (exposed, bindings) in &network.ports {
            let port = normalize_port(exposed);
            let (internal_port, external_port) = self.address.resolve_ports(&port, bindings);
            let published = bindings.iter().any(|b| !b.host_port.trim().is_empty());
            let (internal_host, external_host) = match network.container_ip() {
                // The daemon host doesn't serve unpublished ports.
                Some(ip) if host_mapped && !published => {
                    debug!(container_id = %container.id, port = %port, "Port is not published, using the container address");
                    (ip, ip)
                }
                _ => (hosts.internal.as_str(), hosts.external.as_str()),
            };
            let address = format!("{external_host}:{external_port}");
            let internal_address = format!("{internal_host}:{internal_port}");

            let (key, server) = match configs.get(&port) {
                Some(config) => {
                    let protocol = config.protocol.as_deref().unwrap_or("tcp");
                    let key = if config.name.is_empty() {
                        port.clone()
                    } else {
                        config.name.clone()
                    };
                    let server = Server::new(
                        Some(key.clone()),
                        protocol,
                        address,
                        internal_address,
                        config.path.clone(),
                    );
                    (key, server)
                }
                None => {
                    let server = Server::new(None, "tcp", address, internal_address, None);
                    (port.clone(), server)
                }
            };

            if servers.insert(key.clone(), server).is_some() {
                warn!(container_id = %container.id, server = %key, "Duplicate server name, last exposed port wins");
            }
        }
        Ok(servers)
    }

    /// Servers of `machine` running in `container`, including system servers.
    pub fn runtime_info(
        &self,
        container: ContainerInfo,
        machine: &MachineConfig,
        hints: &HostHints,
    ) -> Result<RuntimeInfo, WorkbenchError> {
        let configs = self.catalog.effective_servers(machine);
        let servers = self.build_servers(&container, hints, &configs)?;
        Ok(RuntimeInfo {
            container,
            servers,
            inspected_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{NetworkSettings, PortBinding};

    fn container(ports: &[(&str, Option<&str>)]) -> ContainerInfo {
        let ports = ports
            .iter()
            .map(|(port, host_port)| {
                let bindings = host_port
                    .map(|hp| {
                        vec![PortBinding {
                            host_ip: Some("0.0.0.0".into()),
                            host_port: hp.to_string(),
                        }]
                    })
                    .unwrap_or_default();
                (port.to_string(), bindings)
            })
            .collect();
        ContainerInfo {
            id: "c0ffee".into(),
            name: "ws1_dev".into(),
            running: true,
            status: Some("running".into()),
            network: Some(NetworkSettings {
                ip_address: Some("172.17.0.5".into()),
                networks: BTreeMap::new(),
                ports,
            }),
            ..Default::default()
        }
    }

    fn catalog() -> ServerCatalog {
        ServerCatalog {
            all_machines: vec![ServerConfig::new("exec-agent", "4412").with_protocol("http")],
            dev_machine: vec![
                ServerConfig::new("terminal", "4411").with_protocol("ws"),
                ServerConfig::new("system-web", "8080").with_protocol("tcp"),
            ],
        }
    }

    #[test]
    fn test_declared_server_wins_collision() {
        let machine = MachineConfig::dev("dev")
            .with_server(ServerConfig::new("web", "8080/tcp").with_protocol("http"));
        let effective = catalog().effective_servers(&machine);
        let web = &effective["8080/tcp"];
        assert_eq!(web.name, "web");
        assert_eq!(web.protocol.as_deref(), Some("http"));
        assert_eq!(effective.len(), 3);
    }

    #[test]
    fn test_dev_servers_only_on_dev_machine() {
        let effective = catalog().effective_servers(&MachineConfig::new("db"));
        assert_eq!(effective.keys().collect::<Vec<_>>(), vec!["4412/tcp"]);
    }

    #[test]
    fn test_build_servers_reports_unmanaged_ports() {
        let assembler = ServersAssembler::new(AddressConfig::default(), catalog());
        let machine = MachineConfig::dev("dev")
            .with_server(ServerConfig::new("web", "8080").with_protocol("http").with_path("/ide"));
        let info = assembler
            .runtime_info(
                container(&[("8080/tcp", Some("32768")), ("5432/tcp", Some("32769"))]),
                &machine,
                &HostHints::default(),
            )
            .unwrap();

        let web = &info.servers["web"];
        assert_eq!(web.reference.as_deref(), Some("web"));
        assert_eq!(web.address, "172.17.0.5:32768");
        assert_eq!(web.internal_address, "172.17.0.5:8080");
        assert_eq!(web.url, "http://172.17.0.5:32768/ide");

        let unmanaged = &info.servers["5432/tcp"];
        assert_eq!(unmanaged.reference, None);
        assert_eq!(unmanaged.protocol, "tcp");
        assert_eq!(unmanaged.address, "172.17.0.5:32769");
    }

    #[test]
    fn test_host_mapped_strategy_uses_overrides_and_host_ports() {
        let assembler = ServersAssembler::new(
            AddressConfig {
                strategy: AddressStrategy::HostMappedPorts,
                internal_address: Some("daemon.internal".into()),
                external_address: Some("workbench.example.com".into()),
                ..Default::default()
            },
            ServerCatalog::default(),
        );
        let mut configs = BTreeMap::new();
        configs.insert("8080/tcp".to_string(), ServerConfig::new("web", "8080"));
        let servers = assembler
            .build_servers(
                &container(&[("8080/tcp", Some("32768"))]),
                &HostHints::default(),
                &configs,
            )
            .unwrap();
        assert_eq!(servers["web"].internal_address, "daemon.internal:32768");
        assert_eq!(servers["web"].address, "workbench.example.com:32768");
        assert_eq!(servers["web"].protocol, "tcp");
    }

    #[test]
    fn test_host_mapped_unpublished_port_uses_container_address() {
        let assembler = ServersAssembler::new(
            AddressConfig {
                strategy: AddressStrategy::HostMappedPorts,
                internal_address: Some("daemon.internal".into()),
                external_address: Some("workbench.example.com".into()),
                ..Default::default()
            },
            ServerCatalog::default(),
        );
        let servers = assembler
            .build_servers(
                &container(&[("8080/tcp", Some("32768")), ("9000/tcp", None)]),
                &HostHints::default(),
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(servers["8080/tcp"].address, "workbench.example.com:32768");
        assert_eq!(servers["9000/tcp"].address, "172.17.0.5:9000");
        assert_eq!(servers["9000/tcp"].internal_address, "172.17.0.5:9000");
    }

    #[test]
    fn test_not_started_container_has_no_servers() {
        let assembler = ServersAssembler::default();
        let mut info = container(&[]);
        info.network = None;
        let servers = assembler
            .build_servers(&info, &HostHints::default(), &BTreeMap::new())
            .unwrap();
        assert!(servers.is_empty());
    }

    #[test]
    fn test_missing_address_source_is_explicit() {
        let assembler = ServersAssembler::default();
        let mut info = container(&[("8080/tcp", None)]);
        if let Some(network) = info.network.as_mut() {
            network.ip_address = None;
        }
        let err = assembler
            .build_servers(&info, &HostHints::default(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, WorkbenchError::AddressUnresolved(id) if id == "c0ffee"));
    }
}
