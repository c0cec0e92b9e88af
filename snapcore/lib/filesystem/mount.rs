use std::{collections::HashMap, path::PathBuf, sync::Arc};

use crate::{
    config::{DaemonMode, FsDriver, SupplementParams},
    daemon::{Daemon, DaemonState, RafsInstance},
    filesystem::{fs::dedicated_daemon_id, Filesystem},
    label,
    management::Manager,
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Mounts the image of `snapshot_id` and returns where it is visible on the host.
    ///
    /// Mounting a snapshot that is already mounted returns the existing mountpoint.
    pub async fn mount(
        &self,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
    ) -> SnapshotterResult<PathBuf> {
        self.mount_with_parents(snapshot_id, labels, &[]).await
    }

    /// Like [`mount`](Self::mount), with the layers below `snapshot_id`, nearest first.
    ///
    /// Block-mode images are merged from `snapshot_id` and `parent_ids`. Daemon-backed
    /// mounts ignore the parents.
    pub async fn mount_with_parents(
        &self,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
        parent_ids: &[String],
    ) -> SnapshotterResult<PathBuf> {
        let fs_driver = self.select_driver(labels);
        if fs_driver == FsDriver::Nodev {
            tracing::debug!(snapshot_id = snapshot_id, "no daemon configured, nothing to mount");
            return Ok(self.get_config().root_mountpoint());
        }

        let image_ref = label::image_reference(labels).ok_or_else(|| {
            SnapshotterError::InvalidArgument(format!(
                "snapshot {snapshot_id} has no image reference label"
            ))
        })?;

        let _guard = self.snapshot_locks.lock(snapshot_id).await;
        if let Some(instance) = self.get_registry().get(snapshot_id) {
            tracing::debug!(snapshot_id = snapshot_id, mountpoint = %instance.get_mountpoint().display(), "snapshot already mounted");
            return Ok(instance.get_mountpoint().clone());
        }

        let manager = self.get_manager(fs_driver)?.clone();
        let mut instance = RafsInstance::builder()
            .image_id(image_ref)
            .fs_driver(fs_driver)
            .snapshot_id(snapshot_id)
            .snapshot_dir(self.get_config().snapshots_dir().join(snapshot_id))
            .build();

        match fs_driver {
            FsDriver::Blockdev => {
                self.mount_block(snapshot_id, labels, parent_ids, &mut instance)
                    .await?
            }
            _ => {
                self.mount_with_daemon(&manager, image_ref, labels, &mut instance)
                    .await?
            }
        }

        let mountpoint = instance.get_mountpoint().clone();
        if let Err(e) = manager.new_instance(&mut instance).await {
            tracing::error!(snapshot_id = snapshot_id, error = %e, "failed to persist instance, rolling back");
            if let Err(e) = self.release_instance(&manager, &instance).await {
                tracing::warn!(snapshot_id = snapshot_id, error = %e, "failed to release instance");
            }
            return Err(e);
        }

        self.get_registry().add(instance.clone());
        if let Some(daemon) = self.attached_daemon(&manager, &instance) {
            daemon.add_instance(instance);
        }

        tracing::info!(snapshot_id = snapshot_id, fs_driver = %fs_driver, mountpoint = %mountpoint.display(), "mounted snapshot");
        Ok(mountpoint)
    }

    /// Unmounts `snapshot_id`. Unmounting a snapshot that is not mounted succeeds.
    ///
    /// A daemon left without instances is destroyed.
    pub async fn umount(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        let _guard = self.snapshot_locks.lock(snapshot_id).await;
        let Some(instance) = self.get_registry().get(snapshot_id) else {
            tracing::debug!(snapshot_id = snapshot_id, "snapshot is not mounted");
            return Ok(());
        };

        let manager = self.get_manager(*instance.get_fs_driver())?.clone();
        manager.remove_instance(snapshot_id).await?;
        self.get_registry().remove(snapshot_id);
        self.release_instance(&manager, &instance).await?;

        tracing::info!(snapshot_id = snapshot_id, "unmounted snapshot");
        Ok(())
    }

    /// Picks the driver serving a snapshot with `labels`.
    pub(super) fn select_driver(&self, labels: &HashMap<String, String>) -> FsDriver {
        if self.tarfs_manager.is_some() && label::is_tarfs_layer(labels) {
            return FsDriver::Blockdev;
        }

        if !self.daemon_backed() {
            return FsDriver::Nodev;
        }

        *self.get_config().get_daemon().get_fs_driver()
    }

    /// Takes an instance down: its mount, its place in the daemon and the daemon itself
    /// once nothing else uses it.
    async fn release_instance(
        &self,
        manager: &Arc<Manager>,
        instance: &RafsInstance,
    ) -> SnapshotterResult<()> {
        let snapshot_id = instance.get_snapshot_id();
        match instance.get_fs_driver() {
            FsDriver::Blockdev => self.tarfs()?.umount_tar_erofs(snapshot_id).await,
            _ => {
                let daemon = self.daemon_of(instance)?;
                daemon.remove_instance(snapshot_id);
                daemon.umount_instance(instance).await?;

                if daemon.get_ref() == 0 {
                    manager.destroy_daemon(&daemon).await?;
                }
                Ok(())
            }
        }
    }

    fn attached_daemon(&self, manager: &Manager, instance: &RafsInstance) -> Option<Arc<Daemon>> {
        if !instance.get_fs_driver().is_daemon_backed() {
            return None;
        }

        instance
            .get_daemon_id()
            .as_deref()
            .and_then(|id| manager.get_by_daemon_id(id))
    }

    async fn mount_block(
        &self,
        snapshot_id: &str,
        labels: &HashMap<String, String>,
        parent_ids: &[String],
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        let tarfs = self.tarfs()?;

        let mut layers = Vec::with_capacity(parent_ids.len() + 1);
        layers.push(snapshot_id.to_string());
        layers.extend(parent_ids.iter().cloned());

        tarfs.merge_layers(&layers).await?;
        self.verifier
            .verify(labels, &instance.bootstrap_file()?)
            .await?;
        tarfs
            .mount_tar_erofs(snapshot_id, &layers, labels, instance)
            .await
    }

    async fn mount_with_daemon(
        &self,
        manager: &Arc<Manager>,
        image_ref: &str,
        labels: &HashMap<String, String>,
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        let fs_driver = *instance.get_fs_driver();
        let snapshot_id = instance.get_snapshot_id().clone();
        let bootstrap = instance.bootstrap_file()?;
        let shared = self.use_shared_daemon(fs_driver);

        let daemon = if shared {
            self.shared_daemon(fs_driver).ok_or_else(|| {
                SnapshotterError::NotFound(format!("shared {fs_driver} daemon"))
            })?
        } else {
            self.create_dedicated_daemon(manager, instance).await?
        };
        instance.set_daemon_id(daemon.id());

        let result = self
            .serve_instance(manager, &daemon, shared, image_ref, &bootstrap, labels, instance)
            .await;

        if let Err(e) = &result {
            tracing::error!(snapshot_id = %snapshot_id, daemon_id = %daemon.id(), error = %e, "failed to mount snapshot, cleaning up");
            daemon.remove_instance(&snapshot_id);

            if shared {
                let config_dir = daemon.config_file(Some(&snapshot_id));
                if let Some(dir) = config_dir.parent() {
                    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                        tracing::debug!(dir = %dir.display(), error = %e, "failed to remove instance config");
                    }
                }
            } else if let Err(e) = manager.destroy_daemon(&daemon).await {
                tracing::warn!(daemon_id = %daemon.id(), error = %e, "failed to destroy daemon");
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_instance(
        &self,
        manager: &Arc<Manager>,
        daemon: &Arc<Daemon>,
        shared: bool,
        image_ref: &str,
        bootstrap: &std::path::Path,
        labels: &HashMap<String, String>,
        instance: &mut RafsInstance,
    ) -> SnapshotterResult<()> {
        let fs_driver = *instance.get_fs_driver();
        let snapshot_id = instance.get_snapshot_id().clone();

        let source = self.resolver.resolve(image_ref, &snapshot_id, labels).await?;
        let mut config = manager.get_daemon_config().clone().ok_or_else(|| {
            SnapshotterError::InvalidState(format!("no daemon config template for {fs_driver}"))
        })?;
        config.supplement(&SupplementParams {
            host: source.host,
            repo: source.repo,
            snapshot_id: snapshot_id.clone(),
            cache_dir: Some(manager.get_cache_dir().clone()),
            work_dir: Some(instance.fscache_work_dir()),
            bootstrap: Some(bootstrap.to_path_buf()),
        })?;
        config.fill_auth(source.credentials.as_ref());

        let config_file = daemon.config_file(shared.then_some(snapshot_id.as_str()));
        match config.dump_file(&config_file) {
            Err(e) if e.is_already_exists() => {
                tracing::debug!(config = %config_file.display(), "daemon config already written");
            }
            result => result?,
        }
        if !shared {
            daemon.set_config(config);
        }

        daemon.add_instance(instance.clone());
        self.verifier.verify(labels, bootstrap).await?;

        if shared {
            let mountpoint = match fs_driver {
                FsDriver::Fusedev => daemon
                    .host_mountpoint()
                    .ok_or_else(|| {
                        SnapshotterError::InvalidState(format!(
                            "shared daemon {} has no mountpoint",
                            daemon.id()
                        ))
                    })?
                    .join(&snapshot_id),
                _ => {
                    let mountpoint = instance.snapshot_mountpoint();
                    tokio::fs::create_dir_all(&mountpoint).await?;
                    mountpoint
                }
            };
            instance.set_mountpoint(&mountpoint);

            if daemon.last_state() != DaemonState::Running {
                daemon.wait_until_state(DaemonState::Running).await?;
            }
            daemon.shared_mount(instance).await?;
        } else {
            let mountpoint = daemon.host_mountpoint().ok_or_else(|| {
                SnapshotterError::InvalidState(format!(
                    "dedicated daemon {} has no mountpoint",
                    daemon.id()
                ))
            })?;
            instance.set_mountpoint(&mountpoint);

            if is_daemon_running(daemon).await {
                tracing::info!(daemon_id = %daemon.id(), snapshot_id = %snapshot_id, "dedicated daemon already running");
            } else {
                manager.start_daemon(daemon).await?;
                daemon.wait_until_state(DaemonState::Running).await?;
            }
        }

        daemon.add_instance(instance.clone());
        Ok(())
    }

    async fn create_dedicated_daemon(
        &self,
        manager: &Manager,
        instance: &RafsInstance,
    ) -> SnapshotterResult<Arc<Daemon>> {
        let snapshot_id = instance.get_snapshot_id();
        let id = dedicated_daemon_id(snapshot_id);
        let mountpoint = instance.snapshot_mountpoint();
        tokio::fs::create_dir_all(&mountpoint).await?;

        let states = self.new_daemon_states(
            &id,
            *instance.get_fs_driver(),
            DaemonMode::Dedicated,
            Some(mountpoint),
        );

        match manager.new_daemon(states).await {
            Err(e) if e.is_already_exists() => {
                tracing::info!(daemon_id = %id, snapshot_id = %snapshot_id, "reusing daemon of snapshot");
                manager
                    .get_by_daemon_id(&id)
                    .ok_or_else(|| SnapshotterError::NotFound(format!("daemon {id}")))
            }
            result => result,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether the process of `daemon` is alive and serving.
async fn is_daemon_running(daemon: &Daemon) -> bool {
    let Some(pid) = daemon.pid() else {
        return false;
    };

    snaputils::is_process_alive(pid) && matches!(daemon.get_state().await, Ok(DaemonState::Running))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{
        config::DaemonMode,
        filesystem::fs::tests::{image_labels, Harness},
    };

    use super::*;

    const IMAGE: &str = "docker.io/library/busybox:latest";

    #[test_log::test(tokio::test)]
    async fn test_shared_fusedev_mount_is_idempotent() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Shared).await?;
        let fs = harness.filesystem().await?;
        let shared = fs.shared_daemon(FsDriver::Fusedev).expect("shared daemon");
        harness.snapshot("s1");

        let first = fs.mount("s1", &image_labels(IMAGE)).await?;
        let second = fs.mount("s1", &image_labels(IMAGE)).await?;
        assert_eq!(first, second);
        assert_eq!(first, harness.config.root_mountpoint().join("s1"));
        assert_eq!(fs.mount_point("s1")?, first);

        // One reference held by the filesystem, one by the instance.
        assert_eq!(shared.get_ref(), 2);
        assert_eq!(shared.instances().len(), 1);
        assert!(shared.config_file(Some("s1")).exists());

        let calls = harness.connector.daemon(&shared.api_socket()).calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "mount /s1").count(), 1);

        fs.umount("s1").await?;
        assert_eq!(shared.get_ref(), 1);
        assert!(fs.get_registry().is_empty());
        assert!(harness
            .connector
            .daemon(&shared.api_socket())
            .calls()
            .contains(&"umount /s1".to_string()));

        fs.try_stop_shared_daemons().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_mounts_share_one_instance() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Shared).await?;
        let fs = harness.filesystem().await?;
        let shared = fs.shared_daemon(FsDriver::Fusedev).expect("shared daemon");
        harness.snapshot("s1");

        let labels = image_labels(IMAGE);
        let mounts = (0..4).map(|_| fs.mount("s1", &labels));
        let mountpoints = futures::future::try_join_all(mounts).await?;
        assert!(mountpoints.windows(2).all(|w| w[0] == w[1]));

        assert_eq!(fs.get_registry().len(), 1);
        assert_eq!(shared.get_ref(), 2);
        assert_eq!(fs.get_manager(FsDriver::Fusedev)?.list_daemons().len(), 1);

        fs.umount("s1").await?;
        fs.try_stop_shared_daemons().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_shared_mount_leaves_nothing_behind() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Shared).await?;
        let fs = harness.filesystem().await?;
        let shared = fs.shared_daemon(FsDriver::Fusedev).expect("shared daemon");
        harness.connector.daemon(&shared.api_socket()).fail_mounts();
        harness.snapshot("s1");

        let err = fs.mount("s1", &image_labels(IMAGE)).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::DaemonApi { .. }));

        assert!(fs.get_registry().is_empty());
        assert_eq!(shared.get_ref(), 1);
        assert!(shared.instances().is_empty());
        assert!(!shared.config_file(Some("s1")).exists());
        assert!(fs.mount_point("s1").unwrap_err().is_not_found());

        fs.try_stop_shared_daemons().await;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_dedicated_daemon_lives_as_long_as_its_mount() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;
        let snapshot_dir = harness.snapshot("s1");

        let mountpoint = fs.mount("s1", &image_labels(IMAGE)).await?;
        assert_eq!(mountpoint, snapshot_dir.join("mnt"));

        let manager = fs.get_manager(FsDriver::Fusedev)?.clone();
        let daemons = manager.list_daemons();
        assert_eq!(daemons.len(), 1);
        let daemon = daemons[0].clone();
        assert!(!daemon.is_shared());
        assert_eq!(daemon.get_ref(), 1);
        assert!(daemon.config().is_some());
        assert!(daemon.config_file(None).exists());
        fs.wait_until_ready("s1").await?;

        fs.umount("s1").await?;
        assert!(manager.list_daemons().is_empty());
        assert_eq!(daemon.last_state(), DaemonState::Destroyed);
        assert!(!daemon.config_file(None).exists());

        fs.umount("s1").await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_dedicated_mounts_start_one_daemon() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;
        harness.snapshot("s1");

        let labels = image_labels(IMAGE);
        let mounts = (0..4).map(|_| fs.mount("s1", &labels));
        let mountpoints = futures::future::try_join_all(mounts).await?;
        assert!(mountpoints.windows(2).all(|w| w[0] == w[1]));

        let manager = fs.get_manager(FsDriver::Fusedev)?.clone();
        let daemons = manager.list_daemons();
        assert_eq!(daemons.len(), 1);
        let daemon = daemons[0].clone();
        assert_eq!(daemon.get_ref(), 1);
        assert_eq!(fs.get_registry().len(), 1);
        assert_eq!(harness.store.walk_instances().await?.len(), 1);

        fs.umount("s1").await?;
        fs.umount("s1").await?;
        assert!(manager.list_daemons().is_empty());
        assert_eq!(daemon.last_state(), DaemonState::Destroyed);
        assert!(harness.store.walk_daemons(FsDriver::Fusedev).await?.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_dedicated_daemon_that_never_runs_is_cleaned_up() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;
        harness.snapshot("s1");

        let id = dedicated_daemon_id("s1");
        let api_socket = harness
            .config
            .socket_dir()
            .join(&id)
            .join(crate::utils::API_SOCKET_FILENAME);
        harness.connector.daemon(&api_socket).set_state(DaemonState::Init);

        let err = fs.mount("s1", &image_labels(IMAGE)).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::Timeout(_)));

        assert!(fs.get_registry().is_empty());
        assert!(fs.get_manager(FsDriver::Fusedev)?.list_daemons().is_empty());
        assert!(harness.store.walk_daemons(FsDriver::Fusedev).await?.is_empty());
        assert!(harness.store.walk_instances().await?.is_empty());
        assert!(!harness.config.config_dir().join(&id).exists());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_running_dedicated_daemon_is_not_started_again() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;
        let snapshot_dir = harness.snapshot("s1");

        // A daemon of the snapshot that outlived its mount.
        let manager = fs.get_manager(FsDriver::Fusedev)?.clone();
        let states = fs.new_daemon_states(
            &dedicated_daemon_id("s1"),
            FsDriver::Fusedev,
            DaemonMode::Dedicated,
            Some(snapshot_dir.join("mnt")),
        );
        let daemon = manager.new_daemon(states).await?;
        manager.start_daemon(&daemon).await?;
        daemon.wait_until_state(DaemonState::Running).await?;
        let pid = daemon.pid();

        let mountpoint = fs.mount("s1", &image_labels(IMAGE)).await?;
        assert_eq!(mountpoint, snapshot_dir.join("mnt"));
        assert_eq!(daemon.pid(), pid);
        assert_eq!(manager.list_daemons().len(), 1);
        assert_eq!(daemon.get_ref(), 1);

        fs.umount("s1").await?;
        assert!(manager.list_daemons().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_needs_an_image_reference() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;
        harness.snapshot("s1");

        let err = fs.mount("s1", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::InvalidArgument(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_without_bootstrap_fails() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Fusedev, DaemonMode::Dedicated).await?;
        let fs = harness.filesystem().await?;

        assert!(fs.mount("s1", &image_labels(IMAGE)).await.is_err());
        assert!(fs.get_manager(FsDriver::Fusedev)?.list_daemons().is_empty());
        assert!(fs.get_registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_nodev_mount_returns_root_mountpoint() -> anyhow::Result<()> {
        let harness = Harness::new(FsDriver::Nodev, DaemonMode::None).await?;
        let fs = harness.filesystem().await?;

        let mountpoint = fs.mount("s1", &image_labels(IMAGE)).await?;
        assert_eq!(mountpoint, harness.config.root_mountpoint());
        assert!(fs.get_registry().is_empty());
        fs.umount("s1").await?;
        Ok(())
    }
}
