//! Image references and snapshot identities.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const LATEST_TAG: &str = "latest";

/// Every snapshot repository name starts with this prefix.
pub const SNAPSHOT_REPOSITORY_PREFIX: &str = "machine_snapshot_";

/// A parsed `[registry/]repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(location: &str) -> Option<Self> {
        let location = location.trim();
        if location.is_empty() {
            return None;
        }

        let (name, digest) = match location.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (location, None),
        };

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, name),
        };

        let (repository, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx..].contains('/') => (
                remainder[..idx].to_string(),
                Some(remainder[idx + 1..].to_string()),
            ),
            _ => (remainder.to_string(), None),
        };

        if repository.is_empty() {
            return None;
        }

        Some(Self {
            registry,
            repository,
            tag: tag.filter(|t| !t.is_empty()),
            digest,
        })
    }

    /// Repository including the registry prefix, as the daemon expects it for pull/push.
    pub fn full_repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or(LATEST_TAG)
    }

    /// Location suitable for pull and tag operations. The digest is stripped because
    /// pulling by digest drops the tag.
    pub fn location_without_digest(&self) -> String {
        format!("{}:{}", self.full_repository(), self.tag_or_latest())
    }

    pub fn is_snapshot(&self) -> bool {
        self.repository
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with(SNAPSHOT_REPOSITORY_PREFIX))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Identity of a committed snapshot image.
///
/// Created at commit time and persisted by whoever stores snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceKey {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl InstanceKey {
    pub fn image_reference(&self) -> ImageReference {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(self.tag.clone()),
            digest: self.digest.clone(),
        }
    }

    /// Location to recreate an instance from, digest excluded.
    pub fn location(&self) -> String {
        self.image_reference().location_without_digest()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.image_reference())
    }
}
