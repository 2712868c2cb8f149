//! Deleting snapshot images from registries over HTTP.
//!
//! The daemon can't delete from a registry, so removal talks to the registry API directly:
//! the v2 manifest endpoint for private registries and the legacy v1 repository endpoint
//! for the public hub.

use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use workbench_common::WorkbenchError;

use crate::auth::Credentials;

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Result of a delete that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    AlreadyGone,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
    scheme: String,
}

impl RegistryClient {
    pub fn new(
        scheme: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, WorkbenchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| WorkbenchError::Config(format!("failed to create HTTP client: {e}")))?;
        let scheme = scheme.trim().trim_end_matches("://").to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(WorkbenchError::Config(format!(
                "unsupported registry scheme '{scheme}'"
            )));
        }
        Ok(Self { client, scheme })
    }

    fn manifest_url(&self, registry: &str, repository: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme,
            registry.trim_end_matches('/'),
            repository,
            reference
        )
    }

    fn not_removable(image: &str, message: impl Into<String>) -> WorkbenchError {
        WorkbenchError::SnapshotNotRemovable {
            image: image.to_string(),
            message: message.into(),
        }
    }

    /// Looks up the digest a tag points to. `None` when the tag doesn't exist.
    pub async fn manifest_digest(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<String>, WorkbenchError> {
        let url = self.manifest_url(registry, repository, tag);
        let image = format!("{registry}/{repository}:{tag}");
        let mut request = self
            .client
            .head(&url)
            .header(ACCEPT, HeaderValue::from_static(MANIFEST_MEDIA_TYPES));
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::not_removable(&image, format!("digest lookup failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get(DIGEST_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Self::not_removable(&image, "registry returned no content digest")
                    })?;
                Ok(Some(digest))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(None),
            status => Err(Self::not_removable(
                &image,
                format!("digest lookup returned {status}"),
            )),
        }
    }

    /// Deletes a manifest by digest. A manifest that is already gone counts as deleted.
    pub async fn delete_manifest(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Removal, WorkbenchError> {
        let url = self.manifest_url(registry, repository, digest);
        let image = format!("{registry}/{repository}@{digest}");
        let mut request = self.client.delete(&url);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::not_removable(&image, e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                info!(image = %image, "Removed snapshot from registry");
                Ok(Removal::Deleted)
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(image = %image, "Snapshot already absent from registry");
                Ok(Removal::AlreadyGone)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Self::not_removable(
                    &image,
                    format!("registry returned {status}: {}", body.trim()),
                ))
            }
        }
    }

    /// Deletes a repository from the public hub through its v1 API.
    pub async fn delete_hub_repository(
        &self,
        hub_url: &str,
        repository: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Removal, WorkbenchError> {
        let creds = credentials.ok_or_else(|| {
            Self::not_removable(repository, "no credentials configured for the public hub")
        })?;
        let url = format!(
            "{}/v1/repositories/{}/",
            hub_url.trim_end_matches('/'),
            repository
        );
        let response = self
            .client
            .delete(&url)
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await
            .map_err(|e| Self::not_removable(repository, e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                info!(repository, "Removed snapshot from the public hub");
                Ok(Removal::Deleted)
            }
            StatusCode::NOT_FOUND => {
                debug!(repository, "Snapshot already absent from the public hub");
                Ok(Removal::AlreadyGone)
            }
            status => Err(Self::not_removable(
                repository,
                format!("hub returned {status}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url() {
        let client =
            RegistryClient::new("http", Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.manifest_url("localhost:5000/", "machine_snapshot_ab12", "sha256:00ff"),
            "http://localhost:5000/v2/machine_snapshot_ab12/manifests/sha256:00ff"
        );
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let err = RegistryClient::new("ftp", Duration::from_secs(1), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, WorkbenchError::Config(_)));
        assert!(
            RegistryClient::new("https://", Duration::from_secs(1), Duration::from_secs(1))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_not_removable() {
        let client = RegistryClient::new(
            "http",
            Duration::from_millis(200),
            Duration::from_millis(500),
        )
        .unwrap();
        // Port 9 (discard) is closed on test machines.
        let err = client
            .delete_manifest("127.0.0.1:9", "machine_snapshot_x", "sha256:00", None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkbenchError::SnapshotNotRemovable { .. }));
    }
}
