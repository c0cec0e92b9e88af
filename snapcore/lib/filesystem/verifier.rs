use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use oci_spec::image::DigestAlgorithm;

use crate::{label, utils, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Accepts every bootstrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

/// Checks a bootstrap against the digest carried by the snapshot labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifier;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Validates image metadata before a mount is exposed.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Fails unless `bootstrap` is the metadata the labels vouch for.
    async fn verify(&self, labels: &HashMap<String, String>, bootstrap: &Path)
        -> SnapshotterResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SignatureVerifier for NoopVerifier {
    async fn verify(&self, _: &HashMap<String, String>, _: &Path) -> SnapshotterResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SignatureVerifier for DigestVerifier {
    async fn verify(
        &self,
        labels: &HashMap<String, String>,
        bootstrap: &Path,
    ) -> SnapshotterResult<()> {
        let expected = labels.get(label::NYDUS_BOOTSTRAP_DIGEST).ok_or_else(|| {
            SnapshotterError::InvalidArgument(format!(
                "missing label {} for bootstrap {}",
                label::NYDUS_BOOTSTRAP_DIGEST,
                bootstrap.display()
            ))
        })?;
        let expected = utils::parse_sha256_digest(expected)?;

        let actual = hex::encode(utils::get_file_hash(bootstrap, &DigestAlgorithm::Sha256).await?);
        if actual != expected.digest() {
            return Err(SnapshotterError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: format!("sha256:{actual}"),
            });
        }

        tracing::debug!(bootstrap = %bootstrap.display(), "bootstrap digest verified");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn test_digest_verifier() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bootstrap = dir.path().join("image.boot");
        std::fs::write(&bootstrap, b"")?;

        let mut labels = HashMap::new();
        assert!(DigestVerifier.verify(&labels, &bootstrap).await.is_err());

        labels.insert(label::NYDUS_BOOTSTRAP_DIGEST.to_string(), EMPTY_SHA256.to_string());
        DigestVerifier.verify(&labels, &bootstrap).await?;

        std::fs::write(&bootstrap, b"tampered")?;
        let err = DigestVerifier.verify(&labels, &bootstrap).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::IntegrityMismatch { .. }));

        NoopVerifier.verify(&HashMap::new(), &bootstrap).await?;
        Ok(())
    }
}
