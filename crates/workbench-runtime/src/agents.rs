//! Agents a machine can reference by name. Applying an agent adds the servers and env it
//! needs; this has to happen before infrastructure provisioning so its ports get exposed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use workbench_common::{MachineConfig, ServerConfig, WorkbenchError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub servers: Vec<ServerConfig>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentCatalog {
    agents: BTreeMap<String, AgentSpec>,
}

impl AgentCatalog {
    pub fn new(agents: BTreeMap<String, AgentSpec>) -> Self {
        Self { agents }
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    /// Returns `machine` with the servers and env of every referenced agent merged in.
    ///
    /// Agent servers go before the machine's own, so declared servers keep precedence on
    /// port collisions. Env the machine already defines is kept.
    pub fn apply(&self, mut machine: MachineConfig) -> Result<MachineConfig, WorkbenchError> {
        let mut agent_servers = Vec::new();
        for name in &machine.agents {
            let agent = self
                .agents
                .get(name)
                .ok_or_else(|| WorkbenchError::NotFound(format!("agent {name}")))?;
            for server in &agent.servers {
                if !machine.servers.iter().any(|s| s.name == server.name) {
                    agent_servers.push(server.clone());
                }
            }
            for (key, value) in &agent.env {
                machine
                    .env
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            debug!(machine = %machine.name, agent = %name, "Applied agent");
        }
        agent_servers.append(&mut machine.servers);
        machine.servers = agent_servers;
        Ok(machine)
    }
}
