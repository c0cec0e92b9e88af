use std::{collections::HashMap, path::PathBuf};

use crate::{
    filesystem::Filesystem,
    label,
    tarfs::LayerSource,
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Whether block-mode snapshots are enabled.
    pub fn tarfs_enabled(&self) -> bool {
        self.tarfs_manager.is_some()
    }

    /// Starts converting the layer of `snapshot_id` and marks it as a block-mode layer in
    /// `labels`.
    pub async fn prepare_tarfs_layer(
        &self,
        snapshot_id: &str,
        labels: &mut HashMap<String, String>,
    ) -> SnapshotterResult<()> {
        let tarfs = self.tarfs()?;
        let source = LayerSource::from_labels(labels)?;

        if !tarfs
            .check_tarfs_hint_annotation(source.get_reference(), source.get_manifest_digest())
            .await?
        {
            return Err(SnapshotterError::InvalidArgument(format!(
                "image {} does not carry the tarfs hint",
                source.get_reference()
            )));
        }

        let blob_id = source.blob_id();
        tarfs.prepare_layer(snapshot_id, source).await?;
        labels.insert(label::NYDUS_TARFS_LAYER.to_string(), blob_id);
        Ok(())
    }

    /// Merges the metadata of `parent_ids`, nearest first, into one image.
    pub async fn merge_tarfs_layers(&self, parent_ids: &[String]) -> SnapshotterResult<()> {
        self.tarfs()?.merge_layers(parent_ids).await
    }

    /// Releases the block-mode resources of a removed snapshot.
    pub async fn detach_tarfs_layer(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        self.tarfs()?.detach_layer(snapshot_id).await
    }

    /// Exports block disks on commit. See [`TarfsManager::export_block_data`].
    ///
    /// [`TarfsManager::export_block_data`]: crate::tarfs::TarfsManager::export_block_data
    pub async fn export_tarfs_block_data(
        &self,
        snapshot_id: &str,
        parent_ids: &[String],
        per_layer: bool,
        labels: &mut HashMap<String, String>,
    ) -> SnapshotterResult<Vec<String>> {
        self.tarfs()?
            .export_block_data(snapshot_id, parent_ids, per_layer, labels)
            .await
    }

    /// The exported disk of the image whose top layer is `blob_id`.
    pub fn tarfs_image_disk_path(&self, blob_id: &str) -> SnapshotterResult<PathBuf> {
        Ok(self.tarfs()?.image_disk_path(blob_id))
    }

    /// Rebuilds the block-mode status of a layer snapshot found on disk.
    pub fn recover_tarfs_snapshot(
        &self,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
    ) -> SnapshotterResult<()> {
        self.tarfs()?.recover_snapshot_info(snapshot_id, labels)
    }

    /// Mounts again the block-mode images found unmounted at startup, logging failures.
    ///
    /// Layer snapshots must have been recovered first.
    pub async fn remount_tarfs_instances(&self) {
        let Some(tarfs) = &self.tarfs_manager else {
            return;
        };

        for mut instance in tarfs.take_remount_candidates() {
            let snapshot_id = instance.get_snapshot_id().clone();
            match tarfs.remount_erofs(&snapshot_id, &mut instance).await {
                Ok(()) => {
                    self.get_registry().add(instance);
                }
                Err(e) => {
                    tracing::error!(snapshot_id = %snapshot_id, error = %e, "failed to remount tarfs image");
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
