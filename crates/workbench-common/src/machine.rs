//! Machine level declarations: what a machine exposes and where it comes from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::WorkbenchError;

/// Transport assumed when a port is declared without one.
pub const DEFAULT_TRANSPORT: &str = "tcp";

/// Normalizes a port declaration so it always carries a transport suffix.
///
/// `"8080"` and `"8080/tcp"` yield the same key, and normalizing twice is a no-op.
pub fn normalize_port(port: &str) -> String {
    let port = port.trim();
    match port.split_once('/') {
        Some((number, transport)) if !transport.trim().is_empty() => {
            format!("{}/{}", number.trim(), transport.trim().to_ascii_lowercase())
        }
        Some((number, _)) => format!("{}/{DEFAULT_TRANSPORT}", number.trim()),
        None => format!("{port}/{DEFAULT_TRANSPORT}"),
    }
}

/// A declared server: a port plus the logical name it is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub port: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, port: &str) -> Self {
        Self {
            name: name.into(),
            port: normalize_port(port),
            protocol: None,
            path: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Port key used in lookup maps. Deserialized configs may not be normalized yet.
    pub fn normalized_port(&self) -> String {
        normalize_port(&self.port)
    }
}

/// Logical definition of a workspace container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    #[serde(default)]
    pub is_dev: bool,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn dev(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dev: true,
            ..Default::default()
        }
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }
}

/// Where the image of a machine comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MachineSource {
    /// Build from a Dockerfile given inline (`content`) or as a build context URL (`location`).
    Recipe {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
    /// Reuse an existing `repository[:tag]` reference.
    Image { location: String },
}

impl MachineSource {
    pub fn recipe(content: impl Into<String>) -> Self {
        MachineSource::Recipe {
            content: Some(content.into()),
            location: None,
            dockerfile: None,
            args: BTreeMap::new(),
        }
    }

    pub fn image(location: impl Into<String>) -> Self {
        MachineSource::Image {
            location: location.into(),
        }
    }

    /// Builds a source from the loosely typed (kind, location, content) triple used by
    /// environment definitions.
    pub fn from_parts(
        kind: &str,
        location: Option<&str>,
        content: Option<&str>,
    ) -> Result<Self, WorkbenchError> {
        let source = match kind.trim().to_ascii_lowercase().as_str() {
            "dockerfile" | "recipe" => MachineSource::Recipe {
                content: content.map(str::to_string),
                location: location.map(str::to_string),
                dockerfile: None,
                args: BTreeMap::new(),
            },
            "image" => MachineSource::Image {
                location: location.unwrap_or_default().to_string(),
            },
            other => return Err(WorkbenchError::UnsupportedSourceKind(other.to_string())),
        };
        source.validate()?;
        Ok(source)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MachineSource::Recipe { .. } => "recipe",
            MachineSource::Image { .. } => "image",
        }
    }

    /// Structural checks performed before any remote call.
    pub fn validate(&self) -> Result<(), WorkbenchError> {
        match self {
            MachineSource::Recipe {
                content, location, ..
            } => {
                let has_content = content.as_deref().is_some_and(|c| !c.trim().is_empty());
                let has_location = location.as_deref().is_some_and(|l| !l.trim().is_empty());
                if !has_content && !has_location {
                    return Err(WorkbenchError::InvalidRecipe(
                        "recipe has neither content nor location".to_string(),
                    ));
                }
                if has_content {
                    let first = content
                        .as_deref()
                        .unwrap_or_default()
                        .lines()
                        .map(str::trim)
                        .find(|line| !line.is_empty() && !line.starts_with('#'))
                        .unwrap_or_default();
                    let instruction = first.split_whitespace().next().unwrap_or_default();
                    if !instruction.eq_ignore_ascii_case("FROM")
                        && !instruction.eq_ignore_ascii_case("ARG")
                    {
                        return Err(WorkbenchError::InvalidRecipe(format!(
                            "recipe must start with FROM, found '{first}'"
                        )));
                    }
                }
                Ok(())
            }
            MachineSource::Image { location } => {
                if location.trim().is_empty() {
                    return Err(WorkbenchError::InvalidRecipe(
                        "image source has no repository".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Resolved endpoint exposed by a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Logical name, absent for exposed ports nobody declared.
    pub reference: Option<String>,
    pub protocol: String,
    /// `host:port` reachable from outside the container network.
    pub address: String,
    pub url: String,
    /// `host:port` reachable from other machines of the workspace.
    pub internal_address: String,
    pub internal_url: String,
    pub path: Option<String>,
}

impl Server {
    pub fn new(
        reference: Option<String>,
        protocol: &str,
        address: String,
        internal_address: String,
        path: Option<String>,
    ) -> Self {
        let url = server_url(protocol, &address, path.as_deref());
        let internal_url = server_url(protocol, &internal_address, path.as_deref());
        Self {
            reference,
            protocol: protocol.to_string(),
            address,
            url,
            internal_address,
            internal_url,
            path,
        }
    }
}

fn server_url(protocol: &str, address: &str, path: Option<&str>) -> String {
    match path {
        Some(path) if !path.is_empty() => {
            let path = path.strip_prefix('/').unwrap_or(path);
            format!("{protocol}://{address}/{path}")
        }
        _ => format!("{protocol}://{address}"),
    }
}
