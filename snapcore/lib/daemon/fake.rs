use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, net::UnixStream};

use crate::{
    daemon::{
        BuildTimeInfo, CacheMetrics, DaemonApi, DaemonConnector, DaemonInfo, DaemonState,
        FsMetrics, InflightOp,
    },
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory daemon that records the calls it receives.
#[derive(Debug)]
pub(crate) struct FakeDaemonApi {
    state: Mutex<DaemonState>,
    version: Mutex<BuildTimeInfo>,
    calls: Mutex<Vec<String>>,
    fail_mount: Mutex<bool>,
    fail_start: Mutex<bool>,
    unreachable: Mutex<usize>,
    states: Option<(PathBuf, Vec<u8>)>,
}

/// Hands out one [`FakeDaemonApi`] per socket path and never waits for sockets.
#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    daemons: Mutex<HashMap<PathBuf, Arc<FakeDaemonApi>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeDaemonApi {
    /// Makes `send_fd` push `states` to the supervisor socket at `socket`.
    pub(crate) fn with_states(mut self, socket: &Path, states: &[u8]) -> Self {
        self.states = Some((socket.to_path_buf(), states.to_vec()));
        self
    }

    pub(crate) fn set_state(&self, state: DaemonState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn set_version(&self, package_ver: &str) {
        self.version.lock().unwrap().package_ver = package_ver.to_string();
    }

    pub(crate) fn fail_mounts(&self) {
        *self.fail_mount.lock().unwrap() = true;
    }

    pub(crate) fn fail_starts(&self) {
        *self.fail_start.lock().unwrap() = true;
    }

    /// Makes state queries fail as if nothing listened on the socket.
    pub(crate) fn set_unreachable(&self) {
        *self.unreachable.lock().unwrap() = usize::MAX;
    }

    /// Makes the next `count` state queries fail.
    pub(crate) fn fail_state_queries(&self, count: usize) {
        *self.unreachable.lock().unwrap() = count;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl FakeConnector {
    /// The fake behind `api_socket`, created on first use.
    pub(crate) fn daemon(&self, api_socket: &Path) -> Arc<FakeDaemonApi> {
        self.daemons
            .lock()
            .unwrap()
            .entry(api_socket.to_path_buf())
            .or_insert_with(|| Arc::new(FakeDaemonApi::default()))
            .clone()
    }

    /// Puts `api` behind `api_socket`.
    pub(crate) fn insert(&self, api_socket: &Path, api: FakeDaemonApi) -> Arc<FakeDaemonApi> {
        let api = Arc::new(api);
        self.daemons
            .lock()
            .unwrap()
            .insert(api_socket.to_path_buf(), api.clone());
        api
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for FakeDaemonApi {
    fn default() -> Self {
        Self {
            state: Mutex::new(DaemonState::Running),
            version: Mutex::new(BuildTimeInfo::default()),
            calls: Mutex::new(Vec::new()),
            fail_mount: Mutex::new(false),
            fail_start: Mutex::new(false),
            unreachable: Mutex::new(0),
            states: None,
        }
    }
}

#[async_trait]
impl DaemonApi for FakeDaemonApi {
    async fn get_daemon_info(&self) -> SnapshotterResult<DaemonInfo> {
        let mut unreachable = self.unreachable.lock().unwrap();
        if *unreachable > 0 {
            if *unreachable != usize::MAX {
                *unreachable -= 1;
            }
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        Ok(DaemonInfo {
            id: String::new(),
            version: self.version.lock().unwrap().clone(),
            state: *self.state.lock().unwrap(),
        })
    }

    async fn mount(&self, mountpoint: &str, _bootstrap: &str, _config: &str) -> SnapshotterResult<()> {
        if *self.fail_mount.lock().unwrap() {
            return Err(SnapshotterError::DaemonApi {
                code: "EINVAL".into(),
                message: "mount refused".into(),
            });
        }
        self.record(format!("mount {mountpoint}"));
        Ok(())
    }

    async fn umount(&self, mountpoint: &str) -> SnapshotterResult<()> {
        self.record(format!("umount {mountpoint}"));
        Ok(())
    }

    async fn bind_blob(&self, _config: &str) -> SnapshotterResult<()> {
        self.record("bind".into());
        Ok(())
    }

    async fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> SnapshotterResult<()> {
        self.record(format!("unbind {domain_id} {blob_id}"));
        Ok(())
    }

    async fn get_fs_metrics(&self, _snapshot_id: Option<&str>) -> SnapshotterResult<FsMetrics> {
        Ok(FsMetrics::default())
    }

    async fn get_cache_metrics(&self, _snapshot_id: Option<&str>) -> SnapshotterResult<CacheMetrics> {
        Ok(CacheMetrics::default())
    }

    async fn get_inflight_metrics(&self) -> SnapshotterResult<Vec<InflightOp>> {
        Ok(Vec::new())
    }

    async fn take_over(&self) -> SnapshotterResult<()> {
        self.record("takeover".into());
        self.set_state(DaemonState::Ready);
        Ok(())
    }

    async fn send_fd(&self) -> SnapshotterResult<()> {
        self.record("sendfd".into());
        if let Some((socket, states)) = &self.states {
            let mut stream = UnixStream::connect(socket).await?;
            stream.write_all(states).await?;
            stream.shutdown().await?;
        }
        Ok(())
    }

    async fn start(&self) -> SnapshotterResult<()> {
        self.record("start".into());
        if *self.fail_start.lock().unwrap() {
            return Err(SnapshotterError::DaemonApi {
                code: "EIO".into(),
                message: "start refused".into(),
            });
        }
        self.set_state(DaemonState::Running);
        Ok(())
    }

    async fn exit(&self) -> SnapshotterResult<()> {
        self.record("exit".into());
        Ok(())
    }
}

#[async_trait]
impl DaemonConnector for FakeConnector {
    fn connect(&self, api_socket: &Path) -> Arc<dyn DaemonApi> {
        self.daemon(api_socket)
    }

    async fn wait_for_socket(&self, _api_socket: &Path, _pid: Option<u32>) -> SnapshotterResult<()> {
        Ok(())
    }
}
