use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    daemon::{BuildTimeInfo, Daemon, DaemonState},
    management::{Manager, HANDOFF_TIMEOUT},
    utils, SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Manager {
    /// Replaces the process of `daemon` with one running `nydusd_path`, keeping its mounts.
    ///
    /// Nothing happens when the binary reports the same build as the running daemon, or when
    /// the daemon has no supervisor to carry its states over. On success the upgraded daemon
    /// takes the place of `daemon` and is returned. On failure the new process is killed. If
    /// the old one was already told to exit, it is watched again so that its death is
    /// recovered according to the recover policy.
    pub async fn do_daemon_upgrade(
        self: &Arc<Self>,
        daemon: &Arc<Daemon>,
        nydusd_path: &Path,
    ) -> SnapshotterResult<Option<Arc<Daemon>>> {
        let id = daemon.id();
        let Some(supervisor) = daemon.supervisor() else {
            tracing::info!(daemon_id = %id, "daemon has no supervisor, skipping upgrade");
            return Ok(None);
        };

        let binary = binary_version(nydusd_path).await?;
        let running = daemon.get_version().await?;
        if binary == running {
            tracing::debug!(daemon_id = %id, version = %running.package_ver, "daemon is up to date");
            return Ok(None);
        }

        tracing::info!(daemon_id = %id, from = %running.package_ver, to = %binary.package_ver, "upgrading daemon");

        let mut states = daemon.states();
        states.set_api_socket(next_api_socket(states.get_api_socket())?);
        states.set_pid(None);

        let upgraded = Arc::new(Daemon::new(states, self.get_connector().clone()));
        upgraded.set_supervisor(Some(supervisor.clone()));
        if let Some(config) = daemon.config() {
            upgraded.set_config(config);
        }
        for instance in daemon.instances() {
            upgraded.add_instance(instance);
        }

        supervisor.handoff(HANDOFF_TIMEOUT).await?;
        self.spawn_daemon(&upgraded, nydusd_path, true).await?;

        let takeover = async {
            upgraded.wait_for_socket().await?;
            upgraded.wait_until_state(DaemonState::Init).await?;
            upgraded.client().take_over().await?;
            upgraded.wait_until_state(DaemonState::Ready).await
        };
        if let Err(e) = takeover.await {
            tracing::error!(daemon_id = %id, error = %e, "upgraded daemon failed to take over, keeping the old one");
            discard_upgraded(&upgraded).await;
            return Err(e);
        }

        self.unsubscribe_daemon_event(daemon);
        let started = async {
            daemon.client().exit().await?;
            upgraded.client().start().await?;
            self.subscribe_daemon_event(&upgraded, false)?;
            upgraded.wait_until_state(DaemonState::Running).await
        };
        if let Err(e) = started.await {
            tracing::error!(daemon_id = %id, error = %e, "upgraded daemon failed to start, watching the old one again");
            self.unsubscribe_daemon_event(&upgraded);
            discard_upgraded(&upgraded).await;

            // The old process may be gone already. Polling it lets the recover policy react.
            if let Err(e) = self.subscribe_daemon_event(daemon, true) {
                tracing::warn!(daemon_id = %id, error = %e, "failed to watch old daemon");
            }
            return Err(e);
        }

        upgraded.update_states(|s| s.set_version(binary));
        self.replace_daemon(upgraded.clone());
        self.update_daemon(&upgraded).await?;

        if let Err(e) = supervisor.save_states(upgraded.client().as_ref()).await {
            tracing::warn!(daemon_id = %id, error = %e, "failed to save upgraded daemon states");
        }

        tracing::info!(daemon_id = %id, pid = ?upgraded.pid(), api_socket = %upgraded.api_socket().display(), "daemon upgraded");
        Ok(Some(upgraded))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Kills the process of an upgrade that did not go through.
async fn discard_upgraded(upgraded: &Daemon) {
    if let Err(e) = upgraded.terminate() {
        tracing::warn!(daemon_id = %upgraded.id(), error = %e, "failed to terminate upgraded daemon");
    }
    if let Err(e) = upgraded.wait().await {
        tracing::warn!(daemon_id = %upgraded.id(), error = %e, "failed to wait for upgraded daemon");
    }
}

/// Reads the build identity of a daemon binary from `<binary> --version`.
pub async fn binary_version(nydusd_path: &Path) -> SnapshotterResult<BuildTimeInfo> {
    let output = tokio::process::Command::new(nydusd_path)
        .arg("--version")
        .output()
        .await?;

    if !output.status.success() {
        return Err(SnapshotterError::CommandFailed {
            command: format!("{} --version", nydusd_path.display()),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(BuildTimeInfo::parse_version_output(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

/// The control socket of the next generation of a daemon, next to `current`.
pub fn next_api_socket(current: &Path) -> SnapshotterResult<PathBuf> {
    let generation = utils::api_socket_generation(current).ok_or_else(|| {
        SnapshotterError::InvalidArgument(format!(
            "unexpected api socket name {}",
            current.display()
        ))
    })?;

    let name = utils::api_socket_name(generation + 1);
    Ok(match current.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{
        config::{DaemonMode, FsDriver, RecoverPolicy},
        daemon::{FakeConnector, FakeDaemonApi},
        management::{
            manager::tests::{daemon_states, fake_nydusd},
            ManagerOptions, Store,
        },
    };

    use super::*;

    #[test]
    fn test_next_api_socket() {
        assert_eq!(
            next_api_socket(Path::new("/run/d1/api.sock")).unwrap(),
            PathBuf::from("/run/d1/api1.sock")
        );
        assert_eq!(
            next_api_socket(Path::new("/run/d1/api7.sock")).unwrap(),
            PathBuf::from("/run/d1/api8.sock")
        );
        assert!(next_api_socket(Path::new("/run/d1/other.sock")).is_err());
    }

    #[tokio::test]
    async fn test_binary_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let info = binary_version(&fake_nydusd(dir.path(), "v2.3.0")).await?;
        assert_eq!(info.package_ver, "v2.3.0");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_upgrade_hands_states_over() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let connector = Arc::new(FakeConnector::default());
        let manager = Manager::new(
            ManagerOptions::builder()
                .fs_driver(FsDriver::Fscache)
                .nydusd_path("nydusd")
                .cache_dir(root.path().join("cache"))
                .supervisor_dir(root.path().join("supervisor"))
                .recover_policy(RecoverPolicy::Failover)
                .store(Arc::new(Store::open(root.path().join("snapshotter.db")).await?))
                .connector(connector.clone())
                .build(),
        )
        .await?;

        let daemon = manager
            .new_daemon(daemon_states(root.path(), "d1", FsDriver::Fscache, DaemonMode::Shared))
            .await?;
        let supervisor = daemon.supervisor().expect("supervisor attached");

        let old = connector.insert(
            &daemon.api_socket(),
            FakeDaemonApi::default().with_states(supervisor.socket_path(), b"session"),
        );
        old.set_version("v2.2.0");
        supervisor.save_states(daemon.client().as_ref()).await?;

        let next_socket = root.path().join("socket/d1/api1.sock");
        let new = connector.insert(
            &next_socket,
            FakeDaemonApi::default().with_states(supervisor.socket_path(), b"session"),
        );
        new.set_state(DaemonState::Init);

        let binary = fake_nydusd(root.path(), "v2.3.0");
        let upgraded = manager
            .do_daemon_upgrade(&daemon, &binary)
            .await?
            .expect("daemon upgraded");

        assert_eq!(upgraded.api_socket(), next_socket);
        assert_ne!(upgraded.pid(), daemon.pid());
        assert!(old.calls().contains(&"exit".to_string()));
        assert_eq!(new.calls(), vec!["takeover", "start", "sendfd"]);
        assert!(supervisor.has_states());
        assert!(Arc::ptr_eq(
            &manager.get_by_daemon_id("d1").expect("daemon known"),
            &upgraded
        ));

        let stored = manager.get_store().walk_daemons(FsDriver::Fscache).await?;
        assert_eq!(stored[0].get_api_socket(), &next_socket);
        assert_eq!(
            stored[0].get_version().as_ref().map(|v| v.package_ver.as_str()),
            Some("v2.3.0")
        );

        // Same build again is a no-op.
        new.set_version("v2.3.0");
        assert!(manager.do_daemon_upgrade(&upgraded, &binary).await?.is_none());

        manager.destroy_daemon(&upgraded).await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_start_keeps_the_old_daemon() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let connector = Arc::new(FakeConnector::default());
        let manager = Manager::new(
            ManagerOptions::builder()
                .fs_driver(FsDriver::Fscache)
                .nydusd_path(fake_nydusd(root.path(), "v2.2.0"))
                .cache_dir(root.path().join("cache"))
                .supervisor_dir(root.path().join("supervisor"))
                .recover_policy(RecoverPolicy::Failover)
                .store(Arc::new(Store::open(root.path().join("snapshotter.db")).await?))
                .connector(connector.clone())
                .build(),
        )
        .await?;

        let daemon = manager
            .new_daemon(daemon_states(root.path(), "d1", FsDriver::Fscache, DaemonMode::Shared))
            .await?;
        let supervisor = daemon.supervisor().expect("supervisor attached");
        let old = connector.insert(
            &daemon.api_socket(),
            FakeDaemonApi::default().with_states(supervisor.socket_path(), b"session"),
        );
        old.set_version("v2.2.0");
        manager.start_daemon(&daemon).await?;

        // States are saved once the started daemon is watched and running.
        for _ in 0..100 {
            if supervisor.has_states() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(supervisor.has_states());
        let old_pid = daemon.pid().expect("old daemon pid");

        let new = connector.insert(
            &root.path().join("socket/d1/api1.sock"),
            FakeDaemonApi::default().with_states(supervisor.socket_path(), b"session"),
        );
        new.set_state(DaemonState::Init);
        new.fail_starts();

        let binary = fake_nydusd(root.path(), "v2.3.0");
        assert!(manager.do_daemon_upgrade(&daemon, &binary).await.is_err());
        assert!(old.calls().contains(&"exit".to_string()));
        assert_eq!(new.calls(), vec!["takeover", "start"]);

        // The old daemon is still the one known, stored and watched.
        assert!(Arc::ptr_eq(
            &manager.get_by_daemon_id("d1").expect("daemon known"),
            &daemon
        ));
        assert_eq!(daemon.pid(), Some(old_pid));
        assert!(manager.is_monitored("d1"));
        let stored = manager.get_store().walk_daemons(FsDriver::Fscache).await?;
        assert_eq!(stored[0].get_api_socket(), &daemon.api_socket());
        assert_eq!(stored[0].get_pid(), &Some(old_pid));

        manager.destroy_daemon(&daemon).await?;
        Ok(())
    }
}
