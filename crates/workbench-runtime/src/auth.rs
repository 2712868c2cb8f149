//! Registry credentials lookup.
//!
//! The public hub is known under several historical hostnames; all of them resolve to
//! the same credential entry.

use std::collections::HashMap;

use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};
use workbench_common::WorkbenchError;

/// Canonical key of the public hub.
pub const DEFAULT_REGISTRY: &str = "https://index.docker.io/v1/";

const DEFAULT_REGISTRY_SYNONYMS: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
    "https://index.docker.io/v1",
    "https://index.docker.io/v1/",
    "https://index.docker.io",
    "https://registry-1.docker.io",
];

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn to_docker(&self, registry: &str) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }
    }
}

/// Maps a registry hostname to its lookup key. `None` and empty hostnames mean the public hub.
pub fn normalize_registry(registry: Option<&str>) -> String {
    let registry = registry.map(str::trim).unwrap_or_default();
    if registry.is_empty() || is_default_registry(registry) {
        return DEFAULT_REGISTRY.to_string();
    }
    registry
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

pub fn is_default_registry(registry: &str) -> bool {
    let registry = registry.trim().to_ascii_lowercase();
    registry.is_empty() || DEFAULT_REGISTRY_SYNONYMS.contains(&registry.as_str())
}

/// Read-mostly credential table, shared across concurrent operations without locking.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuthResolver {
    credentials: HashMap<String, Credentials>,
}

impl RegistryAuthResolver {
    pub fn new<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Credentials)>,
        K: AsRef<str>,
    {
        let credentials = entries
            .into_iter()
            .map(|(registry, creds)| (normalize_registry(Some(registry.as_ref())), creds))
            .collect();
        Self { credentials }
    }

    pub fn resolve_basic_auth(&self, registry: Option<&str>) -> Option<&Credentials> {
        self.credentials.get(&normalize_registry(registry))
    }
}

/// Parses `registry=user:password` entries separated by `;`. Passwords may contain `:`.
pub(crate) fn parse_entries(spec: &str) -> Result<Vec<(String, Credentials)>, WorkbenchError> {
    let mut entries = Vec::new();
    for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (registry, creds) = entry.split_once('=').ok_or_else(|| {
            WorkbenchError::Config(format!("registry auth entry '{entry}' lacks '='"))
        })?;
        let (username, password) = creds.split_once(':').ok_or_else(|| {
            WorkbenchError::Config(format!(
                "registry auth entry for '{registry}' must be user:password"
            ))
        })?;
        entries.push((registry.trim().to_string(), Credentials::new(username, password)));
    }
    Ok(entries)
}
