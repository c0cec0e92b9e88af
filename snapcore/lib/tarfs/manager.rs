use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use futures::TryStreamExt;
use moka::future::Cache;
use oci_spec::image::{Digest, ImageManifest};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::{ExportMode, MAX_MANIFEST_CONFIG_SIZE},
    daemon::RafsInstance,
    label,
    oci::{BlobFetcher, FetchedBlob, Reference},
    tarfs::{
        stream, ConversionTool, LayerSource, LoopDevice, SnapshotStatus, StatusResources,
        TarfsState,
    },
    utils::{self, IMAGE_BOOTSTRAP_FILENAME, SNAPSHOT_FS_SUBDIR},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File name of the metadata of a single layer.
pub const TARFS_LAYER_BOOTSTRAP_NAME: &str = "layer.boot";

/// Suffix of an exported layer block disk.
pub const TARFS_LAYER_DISK_NAME: &str = "layer.disk";

/// Suffix of an exported image block disk.
pub const TARFS_IMAGE_DISK_NAME: &str = "image.disk";

const TMP_SUFFIX: &str = ".tarfs.tmp";

const TARFS_HINT_CACHE_CAPACITY: u64 = 50;

const DIFF_ID_CACHE_CAPACITY: u64 = 1000;

const LIMITER_CACHE_CAPACITY: u64 = 50;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for [`TarfsManager::new`].
#[derive(TypedBuilder)]
pub struct TarfsOptions {
    /// Root of the snapshot directories. Layer metadata lives in `<root>/<id>/fs/image`.
    #[builder(setter(into))]
    snapshots_dir: PathBuf,

    /// Where layer tar files and exported disks are stored.
    #[builder(setter(into))]
    cache_dir: PathBuf,

    /// Registry access.
    fetcher: Arc<dyn BlobFetcher>,

    /// Metadata conversion tool.
    tool: Arc<dyn ConversionTool>,

    /// Only convert images whose manifest carries the tarfs hint.
    #[builder(default)]
    check_tarfs_hint: bool,

    /// Compare the decompressed layer digest with the image config.
    #[builder(default = true)]
    validate_diff_id: bool,

    /// Maximum simultaneous conversions per image reference, `0` for no limit.
    #[builder(default)]
    max_concurrent_proc: usize,

    /// Mount merged images with erofs on the host.
    #[builder(default)]
    mount_on_host: bool,

    /// Which block disks to export.
    #[builder(default)]
    export_mode: ExportMode,
}

/// Builds erofs images out of OCI tar layers and mounts them over loop devices.
///
/// Each layer is converted once into a metadata file plus the raw tar file. Images are
/// mounted by merging their layer metadata and handing the kernel one loop device per
/// referenced tar file.
pub struct TarfsManager {
    snapshots_dir: PathBuf,
    cache_dir: PathBuf,
    fetcher: Arc<dyn BlobFetcher>,
    tool: Arc<dyn ConversionTool>,
    check_tarfs_hint: bool,
    validate_diff_id: bool,
    max_concurrent_proc: usize,
    mount_on_host: bool,
    export_mode: ExportMode,
    snapshots: Mutex<HashMap<String, Arc<SnapshotStatus>>>,
    loopdev_lock: Mutex<()>,
    tarfs_hints: Cache<String, bool>,
    diff_ids: Cache<String, String>,
    limiters: Cache<String, Arc<Semaphore>>,
    remount_pending: Mutex<Vec<RafsInstance>>,
}

/// The part of an image config that conversion needs. Other fields, `history` included,
/// are optional and ignored.
#[derive(Debug, Deserialize)]
struct ImageRootfs {
    rootfs: RootfsDiffIds,
}

#[derive(Debug, Deserialize)]
struct RootfsDiffIds {
    #[serde(default)]
    diff_ids: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarfsManager {
    /// Creates a manager.
    pub fn new(options: TarfsOptions) -> Self {
        Self {
            snapshots_dir: options.snapshots_dir,
            cache_dir: options.cache_dir,
            fetcher: options.fetcher,
            tool: options.tool,
            check_tarfs_hint: options.check_tarfs_hint,
            validate_diff_id: options.validate_diff_id,
            max_concurrent_proc: options.max_concurrent_proc,
            mount_on_host: options.mount_on_host,
            export_mode: options.export_mode,
            snapshots: Mutex::new(HashMap::new()),
            loopdev_lock: Mutex::new(()),
            tarfs_hints: Cache::builder()
                .max_capacity(TARFS_HINT_CACHE_CAPACITY)
                .build(),
            diff_ids: Cache::builder().max_capacity(DIFF_ID_CACHE_CAPACITY).build(),
            limiters: Cache::builder().max_capacity(LIMITER_CACHE_CAPACITY).build(),
            remount_pending: Mutex::new(Vec::new()),
        }
    }

    /// Whether merged images are mounted on the host.
    pub fn mount_on_host(&self) -> bool {
        self.mount_on_host
    }

    /// The directory holding the metadata of snapshot `snapshot_id`.
    pub fn upper_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir.join(snapshot_id).join(SNAPSHOT_FS_SUBDIR)
    }

    /// Where the tar file of blob `blob_id` is stored.
    pub fn layer_tar_path(&self, blob_id: &str) -> PathBuf {
        self.cache_dir.join(blob_id)
    }

    /// Where the exported layer disk of blob `blob_id` is stored.
    pub fn layer_disk_path(&self, blob_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{blob_id}.{TARFS_LAYER_DISK_NAME}"))
    }

    /// Where the exported image disk named after blob `blob_id` is stored.
    pub fn image_disk_path(&self, blob_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{blob_id}.{TARFS_IMAGE_DISK_NAME}"))
    }

    /// The conversion state of `snapshot_id`.
    pub fn state(&self, snapshot_id: &str) -> Option<TarfsState> {
        self.lock_snapshots().get(snapshot_id).map(|s| s.state())
    }

    /// Starts converting the layer of `snapshot_id` in the background.
    ///
    /// Fails if the snapshot already has a block-mode status. Waits for a slot of the
    /// reference's conversion limiter before returning.
    pub async fn prepare_layer(
        self: &Arc<Self>,
        snapshot_id: &str,
        source: LayerSource,
    ) -> SnapshotterResult<()> {
        let status = Arc::new(SnapshotStatus::new(
            snapshot_id,
            source.blob_id(),
            Some(source.clone()),
            TarfsState::Init,
        ));
        {
            let mut snapshots = self.lock_snapshots();
            if snapshots.contains_key(snapshot_id) {
                return Err(SnapshotterError::AlreadyExists(format!(
                    "tarfs snapshot {snapshot_id}"
                )));
            }
            snapshots.insert(snapshot_id.to_string(), status.clone());
        }
        status.advance(TarfsState::Prepare)?;

        let permit = match self.get_concurrent_limiter(source.get_reference()).await {
            Some(limiter) => Some(limiter.acquire_owned().await.map_err(|e| {
                SnapshotterError::InvalidState(format!("conversion limiter closed: {e}"))
            })?),
            None => None,
        };

        tracing::info!(snapshot_id = snapshot_id, reference = %source.get_reference(), blob_id = %status.blob_id(), "preparing tarfs layer");

        let manager = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = manager.process_layer(&status).await {
                tracing::error!(snapshot_id = %status.snapshot_id(), error = %e, "failed to prepare tarfs layer");
            }
        });

        Ok(())
    }

    /// Waits for `snapshot_id` to finish converting and fails unless it is ready.
    pub async fn wait_layer_ready(&self, snapshot_id: &str) -> SnapshotterResult<Arc<SnapshotStatus>> {
        let status = self.get_status(snapshot_id)?;
        tracing::debug!(snapshot_id = snapshot_id, "waiting for tarfs layer");

        match status.wait_terminal().await? {
            TarfsState::Ready => Ok(status),
            state => Err(SnapshotterError::InvalidState(format!(
                "tarfs snapshot {snapshot_id} is {state} instead of ready"
            ))),
        }
    }

    /// Converts a failed layer again, in the foreground.
    ///
    /// The failed status is replaced by a fresh one, so waiters of the old status keep
    /// seeing the failure. Concurrent retries share the conversion of the first one.
    pub async fn retry_prepare_layer(&self, snapshot_id: &str) -> SnapshotterResult<Arc<SnapshotStatus>> {
        let current = self.get_status(snapshot_id)?;
        if current.state() != TarfsState::Failed {
            return self.wait_layer_ready(snapshot_id).await;
        }

        let source = current.source().cloned().ok_or_else(|| {
            SnapshotterError::InvalidState(format!(
                "tarfs snapshot {snapshot_id} has no layer source to retry from"
            ))
        })?;
        let next = Arc::new(SnapshotStatus::new(
            snapshot_id,
            current.blob_id(),
            Some(source),
            TarfsState::Prepare,
        ));

        {
            let mut snapshots = self.lock_snapshots();
            match snapshots.get(snapshot_id) {
                Some(s) if Arc::ptr_eq(s, &current) => {
                    snapshots.insert(snapshot_id.to_string(), next.clone());
                }
                Some(_) => {
                    drop(snapshots);
                    return self.wait_layer_ready(snapshot_id).await;
                }
                None => {
                    return Err(SnapshotterError::NotFound(format!(
                        "tarfs snapshot {snapshot_id}"
                    )))
                }
            }
        }

        tracing::info!(snapshot_id = snapshot_id, "retrying failed tarfs layer");
        self.process_layer(&next).await?;
        Ok(next)
    }

    /// Merges the metadata of `parent_ids`, nearest parent first, into the image metadata of
    /// the nearest parent.
    ///
    /// Every layer must become ready, failed layers are converted again once.
    pub async fn merge_layers(&self, parent_ids: &[String]) -> SnapshotterResult<()> {
        let top = parent_ids.first().ok_or_else(|| {
            SnapshotterError::InvalidArgument("no layers to merge".to_string())
        })?;
        let merged = image_meta_path(&self.upper_dir(top));
        if merged.exists() {
            tracing::debug!(snapshot_id = %top, bootstrap = %merged.display(), "tarfs image already merged");
            return Ok(());
        }

        let mut bootstraps = Vec::with_capacity(parent_ids.len());
        for snapshot_id in parent_ids.iter().rev() {
            self.wait_or_retry(snapshot_id).await?;
            bootstraps.push(layer_meta_path(&self.upper_dir(snapshot_id)));
        }

        if let [single] = bootstraps.as_slice() {
            tokio::fs::hard_link(single, &merged).await?;
            return Ok(());
        }

        let merged_tmp = tmp_path(&merged);
        let _cleanup = scopeguard::guard(merged_tmp.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        self.tool.merge(&bootstraps, &merged_tmp).await?;
        tokio::fs::rename(&merged_tmp, &merged).await?;

        tracing::info!(snapshot_id = %top, layers = parent_ids.len(), "merged tarfs image");
        Ok(())
    }

    /// Exports a block disk for a layer or a whole image, as the export mode asks.
    ///
    /// `per_layer` tells which kind of snapshot is being committed. Nothing happens when it
    /// does not match the export mode. With dm-verity, the verity parameters are stored in
    /// `labels`. Returns the label fields that changed, as `labels.<key>`.
    pub async fn export_block_data(
        &self,
        snapshot_id: &str,
        parent_ids: &[String],
        per_layer: bool,
        labels: &mut HashMap<String, String>,
    ) -> SnapshotterResult<Vec<String>> {
        let flags = self.export_mode.flags();
        if (!flags.export_disk && !flags.with_verity) || flags.whole_image == per_layer {
            return Ok(Vec::new());
        }

        let target = if per_layer {
            snapshot_id
        } else {
            parent_ids.first().ok_or_else(|| {
                SnapshotterError::InvalidArgument(format!("snapshot {snapshot_id} has no parent"))
            })?
        };
        let blob_id = labels
            .get(label::NYDUS_TARFS_LAYER)
            .cloned()
            .ok_or_else(|| {
                SnapshotterError::NotFound(format!("tarfs layer label of snapshot {snapshot_id}"))
            })?;

        let upper = self.upper_dir(target);
        let (meta, disk, info_label) = if flags.whole_image {
            (
                image_meta_path(&upper),
                self.image_disk_path(&blob_id),
                label::NYDUS_IMAGE_BLOCK_INFO,
            )
        } else {
            (
                layer_meta_path(&upper),
                self.layer_disk_path(&blob_id),
                label::NYDUS_LAYER_BLOCK_INFO,
            )
        };

        if disk.exists() {
            return Ok(Vec::new());
        }

        let status = self.wait_layer_ready(target).await?;
        let _resources = status.lock().await;

        let disk_tmp = tmp_path(&disk);
        let _cleanup = scopeguard::guard(disk_tmp.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        let output = self
            .tool
            .export_block(&meta, &self.cache_dir, &disk_tmp, flags.with_verity)
            .await?;

        let block_info = if flags.with_verity {
            parse_verity_info(&output)?
        } else {
            String::new()
        };
        labels.insert(info_label.to_string(), block_info);
        tokio::fs::rename(&disk_tmp, &disk).await?;

        tracing::info!(snapshot_id = %target, disk = %disk.display(), verity = flags.with_verity, "exported tarfs block disk");
        Ok(vec![format!("labels.{info_label}")])
    }

    /// Mounts the merged image of `snapshot_id` for `instance`.
    ///
    /// `parent_ids` lists the image layers, nearest first. Only layers whose blob the
    /// merged metadata references get a data device. Mounting again at the same
    /// mountpoint is a no-op, mounting at another one fails. Without host mounts the
    /// instance just points at the metadata directory.
    pub async fn mount_tar_erofs(
        &self,
        snapshot_id: &str,
        parent_ids: &[String],
        labels: &HashMap<String, String>,
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        copy_tarfs_annotations(labels, instance);

        let upper = instance.get_snapshot_dir().join(SNAPSHOT_FS_SUBDIR);
        if !self.mount_on_host {
            instance.set_mountpoint(&upper);
            return Ok(());
        }

        let blob_info = self.tool.inspect_blobs(&image_meta_path(&upper)).await?;

        let mut devices = Vec::new();
        let mut parents = Vec::new();
        let mut blobs = Vec::new();
        for layer_id in parent_ids.iter().rev() {
            let status = self.wait_layer_ready(layer_id).await?;
            let marker = format!("\"blob_id\":\"{}\"", status.blob_id());
            if blob_info.contains(&marker) {
                let mut resources = status.lock().await;
                let device = self.ensure_data_loopdev(&status, &mut resources)?;
                devices.push(format!("device={}", device.display()));
                parents.push(layer_id.clone());
                blobs.push(status.blob_id().to_string());
            }
        }

        self.mount_image(snapshot_id, &upper, devices, instance).await?;
        instance.add_annotation(label::NYDUS_TARFS_PARENTS, parents.join(","));
        instance.add_annotation(label::NYDUS_TARFS_PARENT_BLOBS, blobs.join(","));
        Ok(())
    }

    /// Mounts a recovered instance again, using the layers recorded at its first mount.
    ///
    /// Parent layers without a status are recovered from their recorded blob id when their
    /// metadata is still on disk.
    pub async fn remount_erofs(
        &self,
        snapshot_id: &str,
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        let upper = instance.get_snapshot_dir().join(SNAPSHOT_FS_SUBDIR);
        tracing::info!(snapshot_id = snapshot_id, upper = %upper.display(), "remounting tarfs image");

        let Some(parents) = instance.annotation(label::NYDUS_TARFS_PARENTS).map(str::to_string)
        else {
            if !self.mount_on_host {
                instance.set_mountpoint(&upper);
            }
            return Ok(());
        };

        let blobs = instance
            .annotation(label::NYDUS_TARFS_PARENT_BLOBS)
            .unwrap_or_default()
            .split(',')
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut devices = Vec::new();
        for (i, layer_id) in parents.split(',').filter(|p| !p.is_empty()).enumerate() {
            if let Some(blob_id) = blobs.get(i).filter(|b| !b.is_empty()) {
                self.recover_parent_layer(layer_id, blob_id);
            }
            let status = self.wait_layer_ready(layer_id).await?;
            let mut resources = status.lock().await;
            let device = self.ensure_data_loopdev(&status, &mut resources)?;
            devices.push(format!("device={}", device.display()));
        }

        self.mount_image(snapshot_id, &upper, devices, instance).await
    }

    /// Unmounts the merged image of `snapshot_id`, keeping its loop devices.
    pub async fn umount_tar_erofs(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        let status = self.get_status(snapshot_id)?;
        let mut resources = status.lock().await;

        if let Some(mountpoint) = resources.erofs_mountpoint.take() {
            if let Err(e) = utils::umount(&mountpoint, false) {
                resources.erofs_mountpoint = Some(mountpoint);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Releases every block-mode resource of `snapshot_id`: the mount, both loop devices,
    /// background work and the status itself.
    pub async fn detach_layer(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        let status = self.get_status(snapshot_id)?;
        {
            let mut resources = status.lock().await;

            if let Some(mountpoint) = resources.erofs_mountpoint.take() {
                if let Err(e) = utils::umount(&mountpoint, false) {
                    resources.erofs_mountpoint = Some(mountpoint);
                    return Err(e);
                }
            }
            if let Some(device) = resources.meta_loopdev.take() {
                device.detach()?;
            }
            if let Some(device) = resources.data_loopdev.take() {
                device.detach()?;
            }
        }

        status.cancel();
        let mut snapshots = self.lock_snapshots();
        if snapshots
            .get(snapshot_id)
            .is_some_and(|s| Arc::ptr_eq(s, &status))
        {
            snapshots.remove(snapshot_id);
        }

        tracing::info!(snapshot_id = snapshot_id, "detached tarfs layer");
        Ok(())
    }

    /// Rebuilds the status of a layer snapshot found on disk at startup.
    ///
    /// Layers with metadata are ready, others are failed and get converted again when
    /// needed. Snapshots already recovered from their mount instance are left alone.
    pub fn recover_snapshot_info(
        &self,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
    ) -> SnapshotterResult<()> {
        let mut snapshots = self.lock_snapshots();
        if snapshots.contains_key(snapshot_id) {
            return Ok(());
        }

        let upper = self.upper_dir(snapshot_id);
        tracing::info!(snapshot_id = snapshot_id, upper = %upper.display(), "recovering tarfs snapshot");

        let source = LayerSource::from_labels(labels).ok();
        let status = if layer_meta_path(&upper).exists() {
            let layer_digest = labels.get(label::CRI_LAYER_DIGEST).ok_or_else(|| {
                SnapshotterError::NotFound(format!("layer digest label of snapshot {snapshot_id}"))
            })?;
            let blob_id = utils::blob_id_from_digest(layer_digest)?;
            SnapshotStatus::new(snapshot_id, blob_id, source, TarfsState::Ready)
        } else {
            let blob_id = source.as_ref().map(LayerSource::blob_id).unwrap_or_default();
            SnapshotStatus::new(snapshot_id, blob_id, source, TarfsState::Failed)
        };

        snapshots.insert(snapshot_id.to_string(), Arc::new(status));
        Ok(())
    }

    /// Rebuilds the status of a persisted block-mode instance at startup.
    ///
    /// An instance whose image was mounted before but is not anymore is queued for
    /// [`TarfsManager::take_remount_candidates`].
    pub fn recover_rafs_instance(&self, instance: &RafsInstance) -> SnapshotterResult<()> {
        let snapshot_id = instance.get_snapshot_id();
        let mut snapshots = self.lock_snapshots();
        if snapshots.contains_key(snapshot_id) {
            return Err(SnapshotterError::AlreadyExists(format!(
                "tarfs snapshot {snapshot_id}"
            )));
        }
        tracing::info!(snapshot_id = %snapshot_id, "recovering tarfs instance");

        let layer_digest = instance.annotation(label::CRI_LAYER_DIGEST).ok_or_else(|| {
            SnapshotterError::InvalidArgument(format!(
                "no layer digest for tarfs snapshot {snapshot_id}"
            ))
        })?;
        let blob_id = utils::blob_id_from_digest(layer_digest)?;
        let source = LayerSource::from_labels(instance.get_annotations()).ok();

        let upper = instance.get_snapshot_dir().join(SNAPSHOT_FS_SUBDIR);
        let status = if layer_meta_path(&upper).exists() {
            let mountpoint = instance.snapshot_mountpoint();
            let mounted = utils::is_mounted(&mountpoint);
            if !mounted && instance.annotation(label::NYDUS_TARFS_PARENTS).is_some() {
                self.lock_remount_pending().push(instance.clone());
            }

            SnapshotStatus::new(snapshot_id, blob_id, source, TarfsState::Ready)
                .with_mountpoint(mounted.then_some(mountpoint))
        } else {
            SnapshotStatus::new(snapshot_id, blob_id, source, TarfsState::Failed)
        };

        snapshots.insert(snapshot_id.clone(), Arc::new(status));
        Ok(())
    }

    /// Marks a parent layer ready when its metadata survived and nothing recovered it yet.
    fn recover_parent_layer(&self, snapshot_id: &str, blob_id: &str) {
        let mut snapshots = self.lock_snapshots();
        if snapshots.contains_key(snapshot_id)
            || !layer_meta_path(&self.upper_dir(snapshot_id)).exists()
        {
            return;
        }

        tracing::info!(snapshot_id = snapshot_id, blob_id = blob_id, "recovering tarfs parent layer");
        let status = SnapshotStatus::new(snapshot_id, blob_id, None, TarfsState::Ready);
        snapshots.insert(snapshot_id.to_string(), Arc::new(status));
    }

    /// Instances found unmounted during recovery, to be passed to
    /// [`TarfsManager::remount_erofs`].
    pub fn take_remount_candidates(&self) -> Vec<RafsInstance> {
        std::mem::take(&mut *self.lock_remount_pending())
    }

    /// Whether the image may be converted, according to its manifest's tarfs hint.
    ///
    /// Always `true` when hints are not checked. The manifest and config are fetched once
    /// per reference, concurrent callers share the fetch.
    pub async fn check_tarfs_hint_annotation(
        &self,
        reference: &str,
        manifest_digest: &Digest,
    ) -> SnapshotterResult<bool> {
        if !self.check_tarfs_hint {
            return Ok(true);
        }

        self.image_info(reference, manifest_digest).await
    }

    /// The conversion limiter shared by every layer of `reference`, if conversions are
    /// limited.
    pub async fn get_concurrent_limiter(&self, reference: &str) -> Option<Arc<Semaphore>> {
        if self.max_concurrent_proc == 0 {
            return None;
        }

        let permits = self.max_concurrent_proc;
        Some(
            self.limiters
                .get_with(reference.to_string(), async move {
                    Arc::new(Semaphore::new(permits))
                })
                .await,
        )
    }

    async fn process_layer(&self, status: &SnapshotStatus) -> SnapshotterResult<()> {
        let result = self.convert_layer(status).await;
        let next = match &result {
            Ok(()) => TarfsState::Ready,
            Err(_) => TarfsState::Failed,
        };
        status.advance(next)?;

        match &result {
            Ok(()) => {
                tracing::info!(snapshot_id = %status.snapshot_id(), blob_id = %status.blob_id(), "tarfs layer is ready")
            }
            Err(e) => {
                tracing::warn!(snapshot_id = %status.snapshot_id(), error = %e, "tarfs layer conversion failed")
            }
        }
        result
    }

    async fn convert_layer(&self, status: &SnapshotStatus) -> SnapshotterResult<()> {
        let snapshot_id = status.snapshot_id();
        let source = status.source().ok_or_else(|| {
            SnapshotterError::InvalidState(format!("tarfs snapshot {snapshot_id} has no layer source"))
        })?;

        let upper = self.upper_dir(snapshot_id);
        let layer_meta = layer_meta_path(&upper);
        if layer_meta.exists() {
            tracing::debug!(snapshot_id = snapshot_id, "tarfs layer metadata already exists");
            return Ok(());
        }
        if let Some(image_dir) = layer_meta.parent() {
            tokio::fs::create_dir_all(image_dir).await?;
        }
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let expected = if self.validate_diff_id {
            Some(self.get_blob_diff_id(source).await?)
        } else {
            None
        };

        let reference: Reference = source.get_reference().parse()?;
        let blob = self
            .fetcher
            .fetch_blob(&reference, source.get_layer_digest())
            .await?;

        let blob_id = status.blob_id();
        let tar_path = self.layer_tar_path(blob_id);
        let tar_tmp = tmp_path(&tar_path);
        let meta_tmp = tmp_path(&layer_meta);
        let fifo = upper.join(format!("layer_{snapshot_id}_tar.fifo"));

        if let Err(e) = tokio::fs::remove_file(&fifo).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        stream::create_fifo(&fifo)?;
        let _cleanup = scopeguard::guard(
            [fifo.clone(), meta_tmp.clone(), tar_tmp.clone()],
            |paths| {
                for path in paths {
                    let _ = std::fs::remove_file(path);
                }
            },
        );

        let tool_exited = CancellationToken::new();
        let streaming = stream::stream_layer(blob.stream, tar_tmp.clone(), fifo.clone(), tool_exited.clone());
        let converting = async {
            let result = self
                .tool
                .create_layer(&fifo, &meta_tmp, blob_id, &self.cache_dir)
                .await;
            tool_exited.cancel();
            result
        };

        let (streamed, converted) = tokio::select! {
            _ = status.cancellation().cancelled() => {
                return Err(SnapshotterError::InvalidState(format!(
                    "tarfs snapshot {snapshot_id} was detached during conversion"
                )));
            }
            results = async { tokio::join!(streaming, converting) } => results,
        };
        converted?;
        let outcome = streamed?;

        if let Some(expected) = expected {
            if outcome.digest != expected {
                return Err(SnapshotterError::IntegrityMismatch {
                    expected,
                    actual: outcome.digest,
                });
            }
        }

        tokio::fs::rename(&tar_tmp, &tar_path).await?;
        tokio::fs::rename(&meta_tmp, &layer_meta).await?;

        tracing::debug!(snapshot_id = snapshot_id, digest = %outcome.digest, size = outcome.size, "converted tarfs layer");
        Ok(())
    }

    async fn wait_or_retry(&self, snapshot_id: &str) -> SnapshotterResult<Arc<SnapshotStatus>> {
        match self.wait_layer_ready(snapshot_id).await {
            Ok(status) => Ok(status),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                tracing::warn!(snapshot_id = snapshot_id, error = %e, "tarfs layer is not ready, retrying");
                self.retry_prepare_layer(snapshot_id).await
            }
        }
    }

    async fn get_blob_diff_id(&self, source: &LayerSource) -> SnapshotterResult<String> {
        let layer = source.get_layer_digest().to_string();
        if let Some(diff_id) = self.diff_ids.get(&layer).await {
            return Ok(diff_id);
        }

        self.image_info(source.get_reference(), source.get_manifest_digest())
            .await?;
        if let Some(diff_id) = self.diff_ids.get(&layer).await {
            return Ok(diff_id);
        }

        // The image info outlived the diff ids it brought in.
        self.tarfs_hints.invalidate(source.get_reference()).await;
        self.image_info(source.get_reference(), source.get_manifest_digest())
            .await?;
        self.diff_ids
            .get(&layer)
            .await
            .ok_or_else(|| SnapshotterError::NotFound(format!("diff id of layer {layer}")))
    }

    /// Fetches manifest and config of `reference` once, caching the diff ids of its layers.
    /// Returns the tarfs hint of the manifest.
    async fn image_info(&self, reference: &str, manifest_digest: &Digest) -> SnapshotterResult<bool> {
        self.tarfs_hints
            .try_get_with(
                reference.to_string(),
                self.fetch_image_info(reference, manifest_digest),
            )
            .await
            .map_err(|e| {
                SnapshotterError::Upstream(format!("fetch image info of {reference}: {e}"))
            })
    }

    async fn fetch_image_info(&self, reference: &str, manifest_digest: &Digest) -> SnapshotterResult<bool> {
        let parsed: Reference = reference.parse()?;

        let raw = read_bounded(self.fetcher.fetch_manifest(&parsed, manifest_digest).await?).await?;
        let manifest: ImageManifest = serde_json::from_slice(&raw)?;
        if manifest.layers().is_empty() {
            return Err(SnapshotterError::InvalidArgument(format!(
                "image manifest of {reference} has no layer"
            )));
        }

        let raw = read_bounded(self.fetcher.fetch_blob(&parsed, manifest.config().digest()).await?).await?;
        let config: ImageRootfs = serde_json::from_slice(&raw)?;
        let diff_ids = &config.rootfs.diff_ids;
        if diff_ids.len() != manifest.layers().len() {
            return Err(SnapshotterError::InvalidArgument(format!(
                "image {reference} has {} diff ids for {} layers",
                diff_ids.len(),
                manifest.layers().len()
            )));
        }

        for (layer, diff_id) in manifest.layers().iter().zip(diff_ids) {
            self.diff_ids
                .insert(layer.digest().to_string(), diff_id.clone())
                .await;
        }

        tracing::debug!(reference = reference, layers = diff_ids.len(), "fetched image info");
        Ok(label::has_tarfs_hint(manifest.annotations().as_ref()))
    }

    async fn mount_image(
        &self,
        snapshot_id: &str,
        upper: &Path,
        mut devices: Vec<String>,
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        let status = self.get_status(snapshot_id)?;
        let mut resources = status.lock().await;

        let mountpoint = instance.snapshot_mountpoint();
        if let Some(mounted) = &resources.erofs_mountpoint {
            if *mounted == mountpoint {
                tracing::debug!(snapshot_id = snapshot_id, mountpoint = %mountpoint.display(), "tarfs image already mounted");
                instance.set_mountpoint(&mountpoint);
                return Ok(());
            }
            return Err(SnapshotterError::InvalidState(format!(
                "tarfs snapshot {snapshot_id} is already mounted at {}",
                mounted.display()
            )));
        }

        let meta_device = match resources.meta_loopdev.take() {
            Some(device) => device,
            None => self.attach_loopdev(&image_meta_path(upper))?,
        };
        let source = meta_device.path().to_string_lossy().into_owned();
        resources.meta_loopdev = Some(meta_device);

        devices.push("ro".to_string());
        utils::mount_erofs(&source, &mountpoint, &devices.join(","))?;

        resources.erofs_mountpoint = Some(mountpoint.clone());
        instance.set_mountpoint(&mountpoint);
        Ok(())
    }

    fn ensure_data_loopdev(
        &self,
        status: &SnapshotStatus,
        resources: &mut StatusResources,
    ) -> SnapshotterResult<PathBuf> {
        let device = match resources.data_loopdev.take() {
            Some(device) => device,
            None => self.attach_loopdev(&self.layer_tar_path(status.blob_id()))?,
        };
        let path = device.path().to_path_buf();
        resources.data_loopdev = Some(device);
        Ok(path)
    }

    fn attach_loopdev(&self, backing: &Path) -> SnapshotterResult<LoopDevice> {
        let _guard = self.loopdev_lock.lock().unwrap_or_else(|e| e.into_inner());
        LoopDevice::attach(backing)
    }

    fn get_status(&self, snapshot_id: &str) -> SnapshotterResult<Arc<SnapshotStatus>> {
        self.lock_snapshots()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| SnapshotterError::NotFound(format!("tarfs snapshot {snapshot_id}")))
    }

    fn lock_snapshots(&self) -> MutexGuard<'_, HashMap<String, Arc<SnapshotStatus>>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_remount_pending(&self) -> MutexGuard<'_, Vec<RafsInstance>> {
        self.remount_pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies the labels block-mode mounts depend on into the instance annotations.
pub fn copy_tarfs_annotations(labels: &HashMap<String, String>, instance: &mut RafsInstance) {
    const KEYS: [&str; 6] = [
        label::CRI_IMAGE_REF,
        label::CRI_LAYER_DIGEST,
        label::CRI_MANIFEST_DIGEST,
        label::NYDUS_TARFS_LAYER,
        label::NYDUS_IMAGE_BLOCK_INFO,
        label::NYDUS_LAYER_BLOCK_INFO,
    ];

    for key in KEYS {
        if let Some(value) = labels.get(key) {
            instance.add_annotation(key, value.clone());
        }
    }
}

/// Turns the dm-verity line printed by an export into `<data blocks>,<hash offset>,sha256:<root>`.
pub fn parse_verity_info(output: &str) -> SnapshotterResult<String> {
    let invalid = || {
        SnapshotterError::InvalidArgument(format!(
            "no dm-verity options in conversion tool output: {output}"
        ))
    };

    let options = output
        .lines()
        .find_map(|line| line.split_once("dm-verity options:").map(|(_, rest)| rest))
        .ok_or_else(invalid)?;
    let tokens: Vec<&str> = options.split_whitespace().collect();
    let value_of = |flag: &str| {
        tokens
            .iter()
            .position(|t| *t == flag)
            .and_then(|i| tokens.get(i + 1))
            .and_then(|v| v.parse::<u64>().ok())
    };

    let data_blocks = value_of("--data-blocks").ok_or_else(invalid)?;
    let hash_offset = value_of("--hash-offset").ok_or_else(invalid)?;
    let root_hash = tokens
        .last()
        .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(invalid)?;

    Ok(format!("{data_blocks},{hash_offset},sha256:{root_hash}"))
}

fn layer_meta_path(upper: &Path) -> PathBuf {
    upper.join("image").join(TARFS_LAYER_BOOTSTRAP_NAME)
}

fn image_meta_path(upper: &Path) -> PathBuf {
    upper.join("image").join(IMAGE_BOOTSTRAP_FILENAME)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

async fn read_bounded(blob: FetchedBlob) -> SnapshotterResult<Vec<u8>> {
    let too_big = |size: u64| {
        SnapshotterError::InvalidArgument(format!(
            "image manifest or config of {size:#x} bytes is too big"
        ))
    };
    if let Some(size) = blob.size.filter(|s| *s > MAX_MANIFEST_CONFIG_SIZE) {
        return Err(too_big(size));
    }

    let mut content = Vec::new();
    let mut stream = blob.stream;
    while let Some(chunk) = stream.try_next().await? {
        content.extend_from_slice(&chunk);
        if content.len() as u64 > MAX_MANIFEST_CONFIG_SIZE {
            return Err(too_big(content.len() as u64));
        }
    }

    Ok(content)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{
        config::FsDriver,
        tarfs::{fake::sha256_digest, FakeTool, MemoryFetcher},
    };

    use super::*;

    const REFERENCE: &str = "docker.io/library/busybox:latest";

    struct Fixture {
        _root: tempfile::TempDir,
        snapshots_dir: PathBuf,
        cache_dir: PathBuf,
        fetcher: Arc<MemoryFetcher>,
        tool: Arc<FakeTool>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            Self {
                snapshots_dir: root.path().join("snapshots"),
                cache_dir: root.path().join("cache"),
                _root: root,
                fetcher: Arc::new(MemoryFetcher::default()),
                tool: Arc::new(FakeTool::default()),
            }
        }

        fn manager(&self, export_mode: ExportMode, check_tarfs_hint: bool) -> Arc<TarfsManager> {
            Arc::new(TarfsManager::new(
                TarfsOptions::builder()
                    .snapshots_dir(&self.snapshots_dir)
                    .cache_dir(&self.cache_dir)
                    .fetcher(self.fetcher.clone())
                    .tool(self.tool.clone())
                    .check_tarfs_hint(check_tarfs_hint)
                    .max_concurrent_proc(2)
                    .export_mode(export_mode)
                    .build(),
            ))
        }
    }

    fn source(manifest: &Digest, layer: &Digest) -> LayerSource {
        LayerSource::new(REFERENCE, manifest.clone(), layer.clone())
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_layer_becomes_ready() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[Vec::new()], false);

        manager.prepare_layer("s1", source(&manifest, &layers[0])).await?;
        let status = manager.wait_layer_ready("s1").await?;

        assert_eq!(manager.state("s1"), Some(TarfsState::Ready));
        let layer_meta = layer_meta_path(&manager.upper_dir("s1"));
        assert_eq!(std::fs::read(&layer_meta)?, b"");
        assert!(manager.layer_tar_path(status.blob_id()).exists());
        assert!(!tmp_path(&layer_meta).exists());
        assert_eq!(fixture.tool.calls(), vec!["create"]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_diff_id_mismatch_fails() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[b"original".to_vec()], false);
        let src = source(&manifest, &layers[0]);

        // The image config claims other content for the layer.
        manager
            .diff_ids
            .insert(layers[0].to_string(), sha256_digest(b"tampered").to_string())
            .await;

        let status = SnapshotStatus::new("s1", src.blob_id(), Some(src.clone()), TarfsState::Prepare);
        let err = manager.convert_layer(&status).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::IntegrityMismatch { .. }));

        manager.prepare_layer("s2", src.clone()).await?;
        assert!(manager.wait_layer_ready("s2").await.is_err());
        assert_eq!(manager.state("s2"), Some(TarfsState::Failed));
        assert!(!layer_meta_path(&manager.upper_dir("s2")).exists());
        assert!(!manager.layer_tar_path(&src.blob_id()).exists());
        assert!(!tmp_path(&manager.layer_tar_path(&src.blob_id())).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_twice_is_rejected() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[Vec::new()], false);

        manager.prepare_layer("s1", source(&manifest, &layers[0])).await?;
        let err = manager
            .prepare_layer("s1", source(&manifest, &layers[0]))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        manager.wait_layer_ready("s1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_image_config_without_history() -> anyhow::Result<()> {
        let config: ImageRootfs = serde_json::from_str(
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":["sha256:aa"]}}"#,
        )?;
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:aa".to_string()]);

        // The fixture image config carries no history either.
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, true);
        let (manifest, layers) = fixture.fetcher.add_image(&[b"a".to_vec()], true);
        assert!(manager.check_tarfs_hint_annotation(REFERENCE, &manifest).await?);
        assert_eq!(
            manager.diff_ids.get(&layers[0].to_string()).await,
            Some(sha256_digest(b"a").to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_hint_is_fetched_once_per_reference() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, true);
        let (manifest, _) = fixture.fetcher.add_image(&[b"a".to_vec(), b"b".to_vec()], true);

        let checks = (0..5).map(|_| manager.check_tarfs_hint_annotation(REFERENCE, &manifest));
        for hint in futures::future::join_all(checks).await {
            assert!(hint?);
        }
        assert_eq!(fixture.fetcher.manifest_fetches(), 1);

        let (other, _) = fixture.fetcher.add_image(&[b"c".to_vec()], false);
        assert!(!manager
            .check_tarfs_hint_annotation("docker.io/library/alpine:3", &other)
            .await?);

        let unchecked = fixture.manager(ExportMode::None, false);
        assert!(unchecked.check_tarfs_hint_annotation(REFERENCE, &other).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_merge_orders_layers_lowest_first() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture
            .fetcher
            .add_image(&[b"lower".to_vec(), b"upper".to_vec()], false);

        manager.prepare_layer("lower", source(&manifest, &layers[0])).await?;
        manager.prepare_layer("upper", source(&manifest, &layers[1])).await?;

        let parents = vec!["upper".to_string(), "lower".to_string()];
        manager.merge_layers(&parents).await?;

        assert_eq!(
            fixture.tool.merged(),
            vec![vec![
                layer_meta_path(&manager.upper_dir("lower")),
                layer_meta_path(&manager.upper_dir("upper")),
            ]]
        );
        assert!(image_meta_path(&manager.upper_dir("upper")).exists());

        // Already merged.
        manager.merge_layers(&parents).await?;
        assert_eq!(fixture.tool.merged().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_layer_merge_links_metadata() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[Vec::new()], false);

        manager.prepare_layer("s1", source(&manifest, &layers[0])).await?;
        manager.merge_layers(&["s1".to_string()]).await?;

        assert!(image_meta_path(&manager.upper_dir("s1")).exists());
        assert!(fixture.tool.merged().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_layer_is_retried_on_merge() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[b"layer".to_vec()], false);

        fixture.fetcher.remove(&layers[0]);
        manager.prepare_layer("s1", source(&manifest, &layers[0])).await?;
        assert!(manager.wait_layer_ready("s1").await.is_err());
        assert_eq!(manager.state("s1"), Some(TarfsState::Failed));

        fixture.fetcher.add(b"layer".to_vec());
        manager.merge_layers(&["s1".to_string()]).await?;
        assert_eq!(manager.state("s1"), Some(TarfsState::Ready));
        Ok(())
    }

    #[tokio::test]
    async fn test_export_layer_disk_with_verity() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::LayerBlockWithVerity, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[Vec::new()], false);
        let src = source(&manifest, &layers[0]);
        manager.prepare_layer("s1", src.clone()).await?;

        let mut labels = HashMap::new();
        labels.insert(label::NYDUS_TARFS_LAYER.to_string(), src.blob_id());

        // Image exports do not apply to layer commits.
        assert!(manager
            .export_block_data("s1", &[], false, &mut labels)
            .await?
            .is_empty());

        let updated = manager.export_block_data("s1", &[], true, &mut labels).await?;
        assert_eq!(updated, vec![format!("labels.{}", label::NYDUS_LAYER_BLOCK_INFO)]);
        assert_eq!(labels[label::NYDUS_LAYER_BLOCK_INFO], "8,4096,sha256:0123abcd");
        assert!(manager.layer_disk_path(&src.blob_id()).exists());

        // The disk exists now.
        assert!(manager
            .export_block_data("s1", &[], true, &mut labels)
            .await?
            .is_empty());
        assert_eq!(fixture.tool.calls(), vec!["create", "export"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_without_host_mount_points_at_metadata() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);

        let mut labels = HashMap::new();
        labels.insert(label::CRI_IMAGE_REF.to_string(), REFERENCE.to_string());
        labels.insert(label::NYDUS_TARFS_LAYER.to_string(), "abc".to_string());
        labels.insert("unrelated".to_string(), "x".to_string());

        let mut instance = RafsInstance::builder()
            .image_id(REFERENCE)
            .fs_driver(FsDriver::Blockdev)
            .snapshot_id("s1")
            .snapshot_dir(fixture.snapshots_dir.join("s1"))
            .build();
        manager
            .mount_tar_erofs("s1", &["s1".to_string()], &labels, &mut instance)
            .await?;

        assert_eq!(instance.get_mountpoint(), &fixture.snapshots_dir.join("s1/fs"));
        assert_eq!(instance.annotation(label::NYDUS_TARFS_LAYER), Some("abc"));
        assert_eq!(instance.annotation("unrelated"), None);
        assert!(fixture.tool.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_detach_removes_status() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let (manifest, layers) = fixture.fetcher.add_image(&[Vec::new()], false);

        manager.prepare_layer("s1", source(&manifest, &layers[0])).await?;
        manager.wait_layer_ready("s1").await?;
        manager.detach_layer("s1").await?;

        assert_eq!(manager.state("s1"), None);
        assert!(manager.detach_layer("s1").await.unwrap_err().is_not_found());
        assert!(manager.umount_tar_erofs("s1").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_recover_snapshot_info() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let layer = sha256_digest(b"layer");

        let mut labels = HashMap::new();
        labels.insert(label::CRI_LAYER_DIGEST.to_string(), layer.to_string());

        let meta = layer_meta_path(&manager.upper_dir("ready"));
        std::fs::create_dir_all(meta.parent().unwrap())?;
        std::fs::write(&meta, b"")?;

        manager.recover_snapshot_info("ready", &labels)?;
        manager.recover_snapshot_info("missing", &labels)?;

        assert_eq!(manager.state("ready"), Some(TarfsState::Ready));
        assert_eq!(manager.state("missing"), Some(TarfsState::Failed));
        assert_eq!(
            manager.wait_layer_ready("ready").await?.blob_id(),
            layer.digest()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_recover_rafs_instance_queues_unmounted_images() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);
        let layer = sha256_digest(b"layer");

        let mut instance = RafsInstance::builder()
            .image_id(REFERENCE)
            .fs_driver(FsDriver::Blockdev)
            .snapshot_id("s1")
            .snapshot_dir(fixture.snapshots_dir.join("s1"))
            .build();
        instance.add_annotation(label::CRI_LAYER_DIGEST, layer.to_string());
        instance.add_annotation(label::NYDUS_TARFS_PARENTS, "s1");

        let meta = layer_meta_path(&manager.upper_dir("s1"));
        std::fs::create_dir_all(meta.parent().unwrap())?;
        std::fs::write(&meta, b"")?;

        manager.recover_rafs_instance(&instance)?;
        assert_eq!(manager.state("s1"), Some(TarfsState::Ready));
        assert!(manager.recover_rafs_instance(&instance).unwrap_err().is_already_exists());

        let candidates = manager.take_remount_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].get_snapshot_id(), "s1");
        assert!(manager.take_remount_candidates().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remount_recovers_parent_layers() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        let manager = TarfsManager::new(
            TarfsOptions::builder()
                .snapshots_dir(&fixture.snapshots_dir)
                .cache_dir(&fixture.cache_dir)
                .fetcher(fixture.fetcher.clone())
                .tool(fixture.tool.clone())
                .mount_on_host(true)
                .build(),
        );
        let lower = sha256_digest(b"lower");
        let upper = sha256_digest(b"upper");

        for snapshot_id in ["lower", "s1"] {
            let meta = layer_meta_path(&manager.upper_dir(snapshot_id));
            std::fs::create_dir_all(meta.parent().unwrap())?;
            std::fs::write(&meta, b"")?;
        }

        let mut instance = RafsInstance::builder()
            .image_id(REFERENCE)
            .fs_driver(FsDriver::Blockdev)
            .snapshot_id("s1")
            .snapshot_dir(fixture.snapshots_dir.join("s1"))
            .build();
        instance.add_annotation(label::CRI_LAYER_DIGEST, upper.to_string());
        instance.add_annotation(label::NYDUS_TARFS_PARENTS, "lower");
        instance.add_annotation(label::NYDUS_TARFS_PARENT_BLOBS, lower.digest());

        manager.recover_rafs_instance(&instance)?;
        assert_eq!(manager.state("lower"), None);

        let mut candidate = manager.take_remount_candidates().pop().expect("candidate");

        // The tar file of the lower layer was never fetched, so no data device can back it.
        assert!(manager.remount_erofs("s1", &mut candidate).await.is_err());
        assert_eq!(manager.state("lower"), Some(TarfsState::Ready));
        assert_eq!(manager.wait_layer_ready("lower").await?.blob_id(), lower.digest());
        Ok(())
    }

    #[tokio::test]
    async fn test_limiter_is_shared_per_reference() {
        let fixture = Fixture::new();
        let manager = fixture.manager(ExportMode::None, false);

        let a = manager.get_concurrent_limiter(REFERENCE).await.unwrap();
        let b = manager.get_concurrent_limiter(REFERENCE).await.unwrap();
        let c = manager.get_concurrent_limiter("docker.io/library/alpine:3").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.available_permits(), 2);

        let unlimited = Arc::new(TarfsManager::new(
            TarfsOptions::builder()
                .snapshots_dir(&fixture.snapshots_dir)
                .cache_dir(&fixture.cache_dir)
                .fetcher(fixture.fetcher.clone())
                .tool(fixture.tool.clone())
                .build(),
        ));
        assert!(unlimited.get_concurrent_limiter(REFERENCE).await.is_none());
    }

    #[test]
    fn test_parse_verity_info() {
        let output = "exporting\n\
            dm-verity options: --no-superblock --format=1 -s \"\" --hash=sha256 \
            --data-block-size=512 --hash-block-size=4096 --data-blocks 2048 --hash-offset 1048576 \
            a1b2c3\n";
        assert_eq!(parse_verity_info(output).unwrap(), "2048,1048576,sha256:a1b2c3");
        assert!(parse_verity_info("nothing here").is_err());
        assert!(parse_verity_info("dm-verity options: --data-blocks x").is_err());
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(
            tmp_path(Path::new("/cache/abc")),
            PathBuf::from("/cache/abc.tarfs.tmp")
        );
    }
}
