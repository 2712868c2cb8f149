//! Commit running instances to images and remove them again.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use workbench_common::image::{LATEST_TAG, SNAPSHOT_REPOSITORY_PREFIX};
use workbench_common::{InstanceKey, WorkbenchError};

use crate::auth::{is_default_registry, RegistryAuthResolver};
use crate::config::TimeoutConfig;
use crate::docker::{CommitRequest, ContainerApi};
use crate::logs::LogSink;
use crate::provisioner::Instance;
use crate::registry::{RegistryClient, Removal};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Push snapshots to `registry` instead of keeping them on the daemon.
    pub use_registry: bool,
    pub registry: Option<String>,
    pub registry_scheme: String,
    /// Account or organization the snapshot repositories live under.
    pub namespace: Option<String>,
    pub author: String,
    /// Base URL of the public hub API, used when `registry` is a hub hostname.
    pub hub_url: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            use_registry: false,
            registry: None,
            registry_scheme: "https".to_string(),
            namespace: None,
            author: "workbench".to_string(),
            hub_url: "https://index.docker.io".to_string(),
        }
    }
}

pub struct SnapshotManager {
    api: Arc<dyn ContainerApi>,
    auth: Arc<RegistryAuthResolver>,
    registry: RegistryClient,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        auth: Arc<RegistryAuthResolver>,
        config: SnapshotConfig,
        timeouts: &TimeoutConfig,
    ) -> Result<Self, WorkbenchError> {
        let registry = RegistryClient::new(
            &config.registry_scheme,
            timeouts.registry_connect(),
            timeouts.registry_request(),
        )?;
        Ok(Self {
            api,
            auth,
            registry,
            config,
        })
    }

    fn target_registry(&self) -> Option<&str> {
        if self.config.use_registry {
            self.config.registry.as_deref()
        } else {
            None
        }
    }

    /// Commits the container of `instance` without pausing it, then pushes the image when
    /// snapshots are registry-backed.
    #[instrument(skip(self, instance, logs), fields(instance_id = %instance.id, container_id = %instance.container_id))]
    pub async fn save(
        &self,
        instance: &Instance,
        logs: &dyn LogSink,
    ) -> Result<InstanceKey, WorkbenchError> {
        let name = format!("{SNAPSHOT_REPOSITORY_PREFIX}{}", Uuid::new_v4().simple());
        let repository = match &self.config.namespace {
            Some(namespace) => format!("{namespace}/{name}"),
            None => name,
        };
        let registry = self.target_registry().map(str::to_string);
        let full_repository = match &registry {
            Some(registry) if !is_default_registry(registry) => format!("{registry}/{repository}"),
            _ => repository.clone(),
        };

        let request = CommitRequest {
            container: instance.container_id.clone(),
            repository: full_repository.clone(),
            tag: LATEST_TAG.to_string(),
            comment: Utc::now()
                .format("Suspended at %a %b %d %H:%M:%S UTC %Y")
                .to_string(),
            author: self.config.author.clone(),
        };
        let image_id = self
            .api
            .commit_container(&request)
            .await
            .map_err(|e| WorkbenchError::CommitFailed {
                container: instance.container_id.clone(),
                message: e.to_string(),
            })?;
        debug!(image_id = %image_id, repository = %full_repository, "Committed container");

        let Some(registry) = registry else {
            info!(repository = %full_repository, "Saved snapshot");
            return Ok(InstanceKey {
                registry: None,
                repository,
                tag: LATEST_TAG.to_string(),
                digest: None,
            });
        };

        let credentials = self.auth.resolve_basic_auth(Some(&registry));
        let pushed = self
            .api
            .push_image(&full_repository, LATEST_TAG, credentials, logs)
            .await;
        let local_image = format!("{full_repository}:{LATEST_TAG}");
        // The pushed image is pulled back on restore, so the local copy is not kept.
        if let Err(e) = self.api.remove_image(&local_image, false).await {
            if !e.is_not_found() {
                warn!(image = %local_image, error = %e, "Failed to remove local snapshot image");
            }
        }

        let digest = pushed.map_err(|e| WorkbenchError::PushFailed {
            image: local_image.clone(),
            message: e.to_string(),
        })?;
        info!(image = %local_image, digest = %digest, "Saved snapshot to registry");
        Ok(InstanceKey {
            registry: Some(registry),
            repository,
            tag: LATEST_TAG.to_string(),
            digest: Some(digest),
        })
    }

    /// Removes a snapshot. Snapshots that are already gone count as removed.
    #[instrument(skip(self, key), fields(snapshot = %key))]
    pub async fn remove_snapshot(&self, key: &InstanceKey) -> Result<(), WorkbenchError> {
        let removal = match key.registry.as_deref() {
            Some(registry) if is_default_registry(registry) => {
                let credentials = self.auth.resolve_basic_auth(None);
                self.registry
                    .delete_hub_repository(&self.config.hub_url, &key.repository, credentials)
                    .await?
            }
            Some(registry) => {
                let credentials = self.auth.resolve_basic_auth(Some(registry));
                let digest = match &key.digest {
                    Some(digest) => Some(digest.clone()),
                    None => {
                        self.registry
                            .manifest_digest(registry, &key.repository, &key.tag, credentials)
                            .await?
                    }
                };
                match digest {
                    Some(digest) => {
                        self.registry
                            .delete_manifest(registry, &key.repository, &digest, credentials)
                            .await?
                    }
                    None => Removal::AlreadyGone,
                }
            }
            None => {
                let image = key.location();
                match self.api.remove_image(&image, false).await {
                    Ok(()) => Removal::Deleted,
                    Err(e) if e.is_not_found() => Removal::AlreadyGone,
                    Err(e) => {
                        return Err(WorkbenchError::SnapshotNotRemovable {
                            image,
                            message: e.to_string(),
                        })
                    }
                }
            }
        };
        debug!(?removal, "Snapshot removal finished");
        Ok(())
    }
}
