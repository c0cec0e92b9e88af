use std::collections::HashMap;

use async_trait::async_trait;

use crate::{config::Credentials, label, oci::Reference, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where an image is pulled from, as merged into a per-instance daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSource {
    /// Registry host of the backend.
    pub host: Option<String>,

    /// Repository of the image.
    pub repo: Option<String>,

    /// Credentials for the registry, if any.
    pub credentials: Option<Credentials>,
}

/// Resolves image sources from the reference and the pull labels of a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelConfigResolver;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Supplies the per-image part of a daemon configuration.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Resolves the source of `image_ref` for the snapshot `snapshot_id`.
    async fn resolve(
        &self,
        image_ref: &str,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
    ) -> SnapshotterResult<ImageSource>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ConfigResolver for LabelConfigResolver {
    async fn resolve(
        &self,
        image_ref: &str,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
    ) -> SnapshotterResult<ImageSource> {
        let reference: Reference = image_ref.parse()?;

        let credentials = labels.get(label::PULL_SECRET).map(|secret| Credentials {
            username: labels.get(label::PULL_USERNAME).cloned().unwrap_or_default(),
            secret: secret.clone(),
        });

        tracing::debug!(
            snapshot_id = snapshot_id,
            host = reference.registry_host(),
            repo = %reference.get_repository(),
            authenticated = credentials.is_some(),
            "resolved image source"
        );

        Ok(ImageSource {
            host: Some(reference.registry_host().to_string()),
            repo: Some(reference.get_repository().clone()),
            credentials,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
