use std::sync::Arc;

use crate::{
    config::{DaemonMode, FsDriver},
    daemon::{new_daemon_id, Daemon},
    filesystem::Filesystem,
    management::Manager,
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// The shared daemon of `fs_driver`, if one is retained.
    pub fn shared_daemon(&self, fs_driver: FsDriver) -> Option<Arc<Daemon>> {
        self.shared_daemons
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fs_driver)
            .cloned()
    }

    /// Looks `daemon_id` up in every manager.
    pub fn get_daemon_by_id(&self, daemon_id: &str) -> Option<Arc<Daemon>> {
        self.managers
            .values()
            .find_map(|manager| manager.get_by_daemon_id(daemon_id))
    }

    /// Keeps `daemon` as the shared daemon of its driver, if it qualifies and the slot is
    /// free. The filesystem then holds one reference on it.
    pub fn try_retain_shared_daemon(&self, daemon: &Arc<Daemon>) -> bool {
        let fs_driver = daemon.fs_driver();
        let qualifies = match fs_driver {
            FsDriver::Fscache => true,
            FsDriver::Fusedev => {
                daemon.is_shared()
                    && daemon.host_mountpoint() == Some(self.get_config().root_mountpoint())
            }
            _ => false,
        };
        if !qualifies {
            return false;
        }

        let mut shared = self
            .shared_daemons
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if shared.contains_key(&fs_driver) {
            return false;
        }

        daemon.inc_ref();
        shared.insert(fs_driver, daemon.clone());
        tracing::info!(daemon_id = %daemon.id(), fs_driver = %fs_driver, "retained shared daemon");
        true
    }

    /// Destroys the shared daemon of `fs_driver` if nothing but the filesystem uses it.
    pub async fn try_stop_shared_daemon(&self, fs_driver: FsDriver) -> SnapshotterResult<()> {
        let Some(daemon) = self.shared_daemon(fs_driver) else {
            return Ok(());
        };
        if daemon.get_ref() != 1 {
            tracing::debug!(daemon_id = %daemon.id(), refs = daemon.get_ref(), "shared daemon still in use");
            return Ok(());
        }

        self.shared_daemons
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fs_driver);
        daemon.dec_ref();

        self.get_manager(fs_driver)?.destroy_daemon(&daemon).await
    }

    /// Stops every idle shared daemon, logging failures.
    pub async fn try_stop_shared_daemons(&self) {
        for fs_driver in [FsDriver::Fusedev, FsDriver::Fscache] {
            if let Err(e) = self.try_stop_shared_daemon(fs_driver).await {
                tracing::error!(fs_driver = %fs_driver, error = %e, "failed to stop shared daemon");
            }
        }
    }

    /// Replaces running daemons whose binary differs from the configured one.
    ///
    /// Failures are logged, the old daemon keeps serving.
    pub async fn try_upgrade_daemons(&self, daemons: &[Arc<Daemon>]) {
        for daemon in daemons {
            let Ok(manager) = self.get_manager(daemon.fs_driver()) else {
                continue;
            };

            match manager
                .do_daemon_upgrade(daemon, manager.get_nydusd_path())
                .await
            {
                Ok(Some(upgraded)) => {
                    let mut shared = self
                        .shared_daemons
                        .write()
                        .unwrap_or_else(|e| e.into_inner());
                    let fs_driver = upgraded.fs_driver();
                    if shared
                        .get(&fs_driver)
                        .is_some_and(|current| Arc::ptr_eq(current, daemon))
                    {
                        upgraded.inc_ref();
                        shared.insert(fs_driver, upgraded);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to upgrade daemon");
                }
            }
        }
    }

    /// Whether snapshots of `fs_driver` are served by the shared daemon.
    pub(super) fn use_shared_daemon(&self, fs_driver: FsDriver) -> bool {
        match fs_driver {
            FsDriver::Fscache => true,
            FsDriver::Fusedev => *self.get_daemon_mode() == DaemonMode::Shared,
            _ => false,
        }
    }

    /// Starts a shared daemon for `manager` and retains it.
    pub(super) async fn init_shared_daemon(&self, manager: &Arc<Manager>) -> SnapshotterResult<()> {
        let fs_driver = *manager.get_fs_driver();
        let mountpoint = match fs_driver {
            FsDriver::Fusedev => {
                let mountpoint = self.get_config().root_mountpoint();
                tokio::fs::create_dir_all(&mountpoint).await?;
                Some(mountpoint)
            }
            FsDriver::Fscache => None,
            _ => {
                return Err(SnapshotterError::InvalidArgument(format!(
                    "fs driver {fs_driver} has no shared daemon"
                )))
            }
        };

        let states =
            self.new_daemon_states(&new_daemon_id(), fs_driver, DaemonMode::Shared, mountpoint);
        let daemon = manager.new_daemon(states).await?;

        let started = async {
            if let Some(config) = manager.get_daemon_config() {
                daemon.set_config(config.clone());
                match config.dump_file(daemon.config_file(None)) {
                    Err(e) if e.is_already_exists() => {}
                    result => result?,
                }
            }
            manager.start_daemon(&daemon).await
        }
        .await;

        if let Err(e) = started {
            if let Err(e) = manager.delete_daemon(&daemon).await {
                tracing::warn!(daemon_id = %daemon.id(), error = %e, "failed to delete daemon record");
            }
            return Err(e);
        }

        self.try_retain_shared_daemon(&daemon);
        tracing::info!(daemon_id = %daemon.id(), fs_driver = %fs_driver, "started shared daemon");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
