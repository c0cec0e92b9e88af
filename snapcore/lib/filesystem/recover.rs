use std::sync::Arc;

use futures::future;

use crate::{
    config::FsDriver,
    daemon::{Daemon, DaemonState},
    filesystem::Filesystem,
    management::Manager,
    SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Reloads the state of a previous run and starts what is missing.
    pub(super) async fn startup(&self) -> SnapshotterResult<()> {
        let mut live = Vec::new();
        let mut recovering = Vec::new();

        for manager in self.managers.values() {
            let recovered = manager.recover(self.get_registry()).await?;
            live.extend(recovered.live.into_iter().map(|d| (manager.clone(), d)));
            recovering.extend(recovered.recovering.into_iter().map(|d| (manager.clone(), d)));
        }

        for fs_driver in [FsDriver::Fusedev, FsDriver::Fscache] {
            let Some(manager) = self.managers.get(&fs_driver) else {
                continue;
            };
            if !self.use_shared_daemon(fs_driver) {
                continue;
            }

            let has_shared = live
                .iter()
                .chain(recovering.iter())
                .filter(|(m, _)| Arc::ptr_eq(m, manager))
                .any(|(_, d)| fs_driver == FsDriver::Fscache || d.is_shared());
            if !has_shared {
                tracing::info!(fs_driver = %fs_driver, "no shared daemon recovered, starting one");
                self.init_shared_daemon(manager).await?;
            }
        }

        let restarts = recovering
            .iter()
            .map(|(manager, daemon)| self.restart_daemon(manager, daemon));
        for (result, (_, daemon)) in future::join_all(restarts).await.into_iter().zip(&recovering) {
            if let Err(e) = result {
                tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to recover daemon");
            }
        }

        for (_, daemon) in &live {
            self.try_retain_shared_daemon(daemon);
        }

        if let Some(tarfs) = &self.tarfs_manager {
            for instance in self.get_registry().list() {
                if *instance.get_fs_driver() != FsDriver::Blockdev {
                    continue;
                }
                if let Err(e) = tarfs.recover_rafs_instance(&instance) {
                    tracing::error!(snapshot_id = %instance.get_snapshot_id(), error = %e, "failed to recover tarfs instance");
                }
            }
        }
        self.remount_tarfs_instances().await;

        let live: Vec<_> = live.into_iter().map(|(_, d)| d).collect();
        self.try_upgrade_daemons(&live).await;

        tracing::info!(
            daemon_mode = %self.get_daemon_mode(),
            instances = self.get_registry().len(),
            "filesystem ready"
        );
        Ok(())
    }

    /// Relaunches a daemon whose process is gone and mounts its instances again.
    async fn restart_daemon(
        &self,
        manager: &Arc<Manager>,
        daemon: &Arc<Daemon>,
    ) -> SnapshotterResult<()> {
        tracing::info!(daemon_id = %daemon.id(), "restarting daemon");
        daemon.clear_vestige();
        manager.start_daemon(daemon).await?;
        daemon.wait_until_state(DaemonState::Running).await?;

        if daemon.is_shared() {
            self.remount_instances(daemon).await;
        }

        self.try_retain_shared_daemon(daemon);
        Ok(())
    }

    /// Mounts the instances of a restarted shared daemon, logging failures.
    async fn remount_instances(&self, daemon: &Daemon) {
        let host_mountpoint = daemon.host_mountpoint();

        for mut instance in daemon.instances() {
            if Some(instance.get_mountpoint()) == host_mountpoint.as_ref() {
                continue;
            }

            let snapshot_id = instance.get_snapshot_id().clone();
            match daemon.shared_mount(&mut instance).await {
                Ok(()) => {
                    daemon.add_instance(instance.clone());
                    self.get_registry().add(instance);
                    tracing::info!(daemon_id = %daemon.id(), snapshot_id = %snapshot_id, "remounted instance");
                }
                Err(e) => {
                    tracing::error!(daemon_id = %daemon.id(), snapshot_id = %snapshot_id, error = %e, "failed to remount instance");
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
