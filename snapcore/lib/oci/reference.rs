use std::{fmt, str::FromStr};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::{SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The namespace prepended to single-segment repositories on the default registry.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// The tag assumed when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// The host daemons use to address the default registry.
pub const DOCKER_INDEX_HOST: &str = "index.docker.io";

/// The host serving the registry HTTP API of the default registry.
pub const DOCKER_REGISTRY_API_HOST: &str = "registry-1.docker.io";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An OCI image reference as found in snapshot labels.
///
/// Short references are normalized the way container runtimes do it: a missing registry
/// becomes `docker.io`, single-segment repositories on `docker.io` get the `library/`
/// namespace and a missing tag becomes `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry where the image is hosted.
    registry: String,

    /// The repository name of the image.
    repository: String,

    /// The tag and/or digest selecting the image.
    selector: ReferenceSelector,
}

/// Represents the selector part of an OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// Tag variant containing the image tag and an optional digest.
    Tag {
        /// The image tag.
        tag: String,

        /// The optional digest.
        digest: Option<Digest>,
    },

    /// Digest variant containing only a digest.
    Digest(Digest),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// The registry host to put into a daemon backend configuration.
    ///
    /// Images on the default registry are addressed through `index.docker.io`.
    pub fn registry_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_INDEX_HOST
        } else {
            &self.registry
        }
    }

    /// The host serving the registry HTTP API for this image.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }

    /// The tag, if the reference carries one.
    pub fn tag(&self) -> Option<&str> {
        match &self.selector {
            ReferenceSelector::Tag { tag, .. } => Some(tag),
            ReferenceSelector::Digest(_) => None,
        }
    }

    /// The digest, if the reference pins one.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.selector {
            ReferenceSelector::Tag { digest, .. } => digest.as_ref(),
            ReferenceSelector::Digest(digest) => Some(digest),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = SnapshotterError;

    /// Parses a reference such as `alpine`, `ghcr.io/org/app:v1` or
    /// `localhost:5000/app@sha256:...`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SnapshotterError::InvalidReference(
                "input string is empty".into(),
            ));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    SnapshotterError::InvalidReference(format!("invalid digest {digest}: {e}"))
                })?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        let (registry, remainder) = extract_registry_and_path(name);
        let (repository, tag) = extract_repository_and_tag(&registry, remainder)?;

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        let selector = match (tag, digest) {
            (Some(tag), digest) => ReferenceSelector::Tag { tag, digest },
            (None, Some(digest)) => ReferenceSelector::Digest(digest),
            (None, None) => ReferenceSelector::Tag {
                tag: DEFAULT_TAG.to_string(),
                digest: None,
            },
        };

        Ok(Reference {
            registry,
            repository,
            selector,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag {
                tag,
                digest: Some(d),
            } => write!(f, ":{}@{}", tag, d),
            ReferenceSelector::Tag { tag, digest: None } => write!(f, ":{}", tag),
            ReferenceSelector::Digest(d) => write!(f, "@{}", d),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn validate_registry(registry: &str) -> SnapshotterResult<()> {
    let re = Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").map_err(SnapshotterError::custom)?;
    if re.is_match(registry) {
        Ok(())
    } else {
        Err(SnapshotterError::InvalidReference(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

fn validate_repository(repository: &str) -> SnapshotterResult<()> {
    let re = Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .map_err(SnapshotterError::custom)?;
    if re.is_match(repository) {
        Ok(())
    } else {
        Err(SnapshotterError::InvalidReference(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

fn validate_tag(tag: &str) -> SnapshotterResult<()> {
    let re = Regex::new(r"^\w[\w.-]{0,127}$").map_err(SnapshotterError::custom)?;
    if re.is_match(tag) {
        Ok(())
    } else {
        Err(SnapshotterError::InvalidReference(format!(
            "invalid tag: {}",
            tag
        )))
    }
}

/// Splits off the registry if the first segment looks like a host.
fn extract_registry_and_path(reference: &str) -> (String, &str) {
    match reference.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest)
        }
        _ => (DEFAULT_REGISTRY.to_string(), reference),
    }
}

fn extract_repository_and_tag(
    registry: &str,
    path: &str,
) -> SnapshotterResult<(String, Option<String>)> {
    let (repo_part, tag) = match path.rfind(':') {
        Some(idx) => (&path[..idx], Some(path[idx + 1..].to_string())),
        None => (path, None),
    };

    if repo_part.is_empty() {
        return Err(SnapshotterError::InvalidReference(
            "repository is empty".into(),
        ));
    }

    let repository = if registry == DEFAULT_REGISTRY && !repo_part.contains('/') {
        format!("{}/{}", DEFAULT_REPOSITORY_NAMESPACE, repo_part)
    } else {
        repo_part.to_string()
    };

    Ok((repository, tag))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:1ff6c18fbef2045af6b9c16bf034cc421a29027b800e4f9b68ae9b1cb3e9ae07";

    #[test]
    fn test_reference_short_name_is_normalized() {
        let reference = "alpine".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "docker.io");
        assert_eq!(reference.get_repository(), "library/alpine");
        assert_eq!(reference.tag(), Some("latest"));
        assert_eq!(reference.registry_host(), "index.docker.io");
        assert_eq!(reference.api_host(), "registry-1.docker.io");
        assert_eq!(reference.to_string(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn test_reference_with_registry_port_and_tag() {
        let reference = "localhost:5000/team/app:v1.2".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "localhost:5000");
        assert_eq!(reference.get_repository(), "team/app");
        assert_eq!(reference.tag(), Some("v1.2"));
        assert_eq!(reference.registry_host(), "localhost:5000");
    }

    #[test]
    fn test_reference_single_segment_on_custom_registry() {
        let reference = "ghcr.io/app:1".parse::<Reference>().unwrap();
        assert_eq!(reference.get_repository(), "app");
    }

    #[test]
    fn test_reference_digest_only() {
        let reference = format!("ghcr.io/org/app@{DIGEST}")
            .parse::<Reference>()
            .unwrap();
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest().unwrap().to_string(), DIGEST);
        assert_eq!(reference.to_string(), format!("ghcr.io/org/app@{DIGEST}"));
    }

    #[test]
    fn test_reference_tag_and_digest() {
        let reference = format!("redis:7@{DIGEST}").parse::<Reference>().unwrap();
        assert_eq!(reference.tag(), Some("7"));
        assert!(reference.digest().is_some());
    }

    #[test]
    fn test_reference_invalid_inputs() {
        assert!("".parse::<Reference>().is_err());
        assert!("docker.io/:v1".parse::<Reference>().is_err());
        assert!("docker.io/Library/Alpine".parse::<Reference>().is_err());
        assert!("alpine:-bad".parse::<Reference>().is_err());
    }
}
