use std::{collections::HashMap, fmt, path::PathBuf};

use getset::Getters;
use oci_spec::image::Digest;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::{label, tarfs::LoopDevice, utils, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Conversion state of a block-mode snapshot.
///
/// States only move forward: `Init → Prepare → {Ready | Failed}`. `Ready` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TarfsState {
    /// Registered, conversion not started.
    Init,

    /// The layer is being downloaded and converted.
    Prepare,

    /// The layer metadata and tar file are in place.
    Ready,

    /// Conversion failed.
    Failed,
}

/// Where the content of a block-mode layer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LayerSource {
    /// The image reference the layer belongs to.
    reference: String,

    /// The image manifest digest.
    manifest_digest: Digest,

    /// The compressed layer digest.
    layer_digest: Digest,
}

/// The block-mode state of one snapshot.
///
/// The conversion state is published through a watch channel so that mergers and mounters
/// can wait for it without holding the resource lock.
#[derive(Debug)]
pub struct SnapshotStatus {
    snapshot_id: String,
    blob_id: String,
    source: Option<LayerSource>,
    state: watch::Sender<TarfsState>,
    cancel: CancellationToken,
    resources: Mutex<StatusResources>,
}

/// Kernel resources held on behalf of a snapshot.
#[derive(Debug, Default)]
pub struct StatusResources {
    /// Where the merged image is mounted.
    pub erofs_mountpoint: Option<PathBuf>,

    /// Loop device backing the merged image metadata.
    pub meta_loopdev: Option<LoopDevice>,

    /// Loop device backing the layer tar file.
    pub data_loopdev: Option<LoopDevice>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarfsState {
    fn rank(&self) -> u8 {
        match self {
            TarfsState::Init => 0,
            TarfsState::Prepare => 1,
            TarfsState::Ready | TarfsState::Failed => 2,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TarfsState::Ready | TarfsState::Failed)
    }

    /// The display name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TarfsState::Init => "init",
            TarfsState::Prepare => "prepare",
            TarfsState::Ready => "ready",
            TarfsState::Failed => "failed",
        }
    }
}

impl LayerSource {
    /// Creates a layer source.
    pub fn new(reference: impl Into<String>, manifest_digest: Digest, layer_digest: Digest) -> Self {
        Self {
            reference: reference.into(),
            manifest_digest,
            layer_digest,
        }
    }

    /// Reads the layer source from snapshot labels.
    pub fn from_labels(labels: &HashMap<String, String>) -> SnapshotterResult<Self> {
        let reference = label::image_reference(labels)
            .ok_or_else(|| SnapshotterError::NotFound("image reference label".to_string()))?;
        let layer_digest = labels
            .get(label::CRI_LAYER_DIGEST)
            .ok_or_else(|| SnapshotterError::NotFound("layer digest label".to_string()))?;
        let manifest_digest = labels
            .get(label::CRI_MANIFEST_DIGEST)
            .ok_or_else(|| SnapshotterError::NotFound("manifest digest label".to_string()))?;

        Ok(Self::new(
            reference,
            utils::parse_sha256_digest(manifest_digest)?,
            utils::parse_sha256_digest(layer_digest)?,
        ))
    }

    /// The blob id of the layer, the hex part of its digest.
    pub fn blob_id(&self) -> String {
        self.layer_digest.digest().to_string()
    }
}

impl SnapshotStatus {
    /// Creates a status in `state`.
    pub fn new(
        snapshot_id: impl Into<String>,
        blob_id: impl Into<String>,
        source: Option<LayerSource>,
        state: TarfsState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            snapshot_id: snapshot_id.into(),
            blob_id: blob_id.into(),
            source,
            state,
            cancel: CancellationToken::new(),
            resources: Mutex::new(StatusResources::default()),
        }
    }

    /// Records an image mount that outlived the previous process.
    pub fn with_mountpoint(mut self, mountpoint: Option<PathBuf>) -> Self {
        self.resources.get_mut().erofs_mountpoint = mountpoint;
        self
    }

    /// The snapshot this status belongs to.
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// The blob id of the layer.
    pub fn blob_id(&self) -> &str {
        &self.blob_id
    }

    /// Where the layer is fetched from, when known.
    pub fn source(&self) -> Option<&LayerSource> {
        self.source.as_ref()
    }

    /// The current conversion state.
    pub fn state(&self) -> TarfsState {
        *self.state.borrow()
    }

    /// Moves to `next`, rejecting any transition that is not forward.
    pub fn advance(&self, next: TarfsState) -> SnapshotterResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                result = Err(SnapshotterError::InvalidState(format!(
                    "tarfs snapshot {} cannot move from {current} to {next}",
                    self.snapshot_id
                )));
                false
            }
        });

        if result.is_ok() {
            tracing::debug!(snapshot_id = %self.snapshot_id, state = %next, "tarfs snapshot state changed");
        }
        result
    }

    /// Waits until conversion finishes and returns the terminal state.
    ///
    /// Fails if the snapshot is detached while waiting.
    pub async fn wait_terminal(&self) -> SnapshotterResult<TarfsState> {
        let mut receiver = self.state.subscribe();
        tokio::select! {
            state = receiver.wait_for(TarfsState::is_terminal) => state
                .map(|s| *s)
                .map_err(|_| SnapshotterError::InvalidState(format!(
                    "tarfs snapshot {} state channel closed",
                    self.snapshot_id
                ))),
            _ = self.cancel.cancelled() => Err(SnapshotterError::InvalidState(format!(
                "tarfs snapshot {} was detached",
                self.snapshot_id
            ))),
        }
    }

    /// Locks the kernel resources of the snapshot.
    pub async fn lock(&self) -> MutexGuard<'_, StatusResources> {
        self.resources.lock().await
    }

    /// Token cancelled when the snapshot is detached.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels background work of the snapshot.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for TarfsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    const LAYER: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const MANIFEST: &str =
        "sha256:0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_state_never_regresses() {
        let status = SnapshotStatus::new("s1", "blob", None, TarfsState::Init);

        status.advance(TarfsState::Prepare).unwrap();
        assert!(status.advance(TarfsState::Init).is_err());
        assert!(status.advance(TarfsState::Prepare).is_err());

        status.advance(TarfsState::Ready).unwrap();
        assert!(status.advance(TarfsState::Failed).is_err());
        assert!(status.advance(TarfsState::Prepare).is_err());
        assert_eq!(status.state(), TarfsState::Ready);
    }

    #[test]
    fn test_failed_is_terminal() {
        let status = SnapshotStatus::new("s1", "blob", None, TarfsState::Prepare);
        status.advance(TarfsState::Failed).unwrap();
        assert!(status.advance(TarfsState::Ready).is_err());
        assert_eq!(status.state(), TarfsState::Failed);
    }

    #[tokio::test]
    async fn test_waiters_see_the_terminal_state() -> anyhow::Result<()> {
        let status = Arc::new(SnapshotStatus::new("s1", "blob", None, TarfsState::Prepare));

        let waiter = tokio::spawn({
            let status = status.clone();
            async move { status.wait_terminal().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        status.advance(TarfsState::Ready)?;

        assert_eq!(waiter.await??, TarfsState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let status = Arc::new(SnapshotStatus::new("s1", "blob", None, TarfsState::Prepare));
        let waiter = tokio::spawn({
            let status = status.clone();
            async move { status.wait_terminal().await }
        });

        status.cancel();
        assert!(waiter.await.unwrap().is_err());
    }

    #[test]
    fn test_layer_source_from_labels() {
        let mut labels = HashMap::new();
        labels.insert(label::CRI_IMAGE_REF.to_string(), "busybox:latest".to_string());
        labels.insert(label::CRI_LAYER_DIGEST.to_string(), LAYER.to_string());
        assert!(LayerSource::from_labels(&labels).unwrap_err().is_not_found());

        labels.insert(label::CRI_MANIFEST_DIGEST.to_string(), MANIFEST.to_string());
        let source = LayerSource::from_labels(&labels).unwrap();
        assert_eq!(source.get_reference(), "busybox:latest");
        assert_eq!(
            source.blob_id(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        labels.insert(label::CRI_LAYER_DIGEST.to_string(), "md5:abc".to_string());
        assert!(LayerSource::from_labels(&labels).is_err());
    }
}
