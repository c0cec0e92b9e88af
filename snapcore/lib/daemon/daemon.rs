use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, RwLock,
    },
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use snaputils::SupervisedProcess;
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use typed_builder::TypedBuilder;

use crate::{
    config::{
        DaemonConfig, DaemonMode, FsDriver, DAEMON_EXIT_TIMEOUT, DAEMON_STATE_WAIT_ATTEMPTS,
        DAEMON_STATE_WAIT_INTERVAL, DEFAULT_LOG_LEVEL,
    },
    daemon::{
        BuildTimeInfo, DaemonApi, DaemonConnector, DaemonState, RafsInstance,
        ANNOTATION_FSCACHE_DOMAIN_ID, ANNOTATION_FSCACHE_ID,
    },
    management::{parse_column, parse_json_column, Supervisor},
    utils::{self, DAEMON_CONFIG_FILENAME, DAEMON_LOG_FILENAME},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The persisted description of a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct DaemonStates {
    /// The daemon id.
    #[builder(default = new_daemon_id(), setter(into))]
    id: String,

    /// The driver the daemon serves.
    fs_driver: FsDriver,

    /// Whether the daemon serves one snapshot or many.
    daemon_mode: DaemonMode,

    /// Pid of the daemon process once started.
    #[builder(default, setter(strip_option))]
    pid: Option<u32>,

    /// The control socket.
    #[builder(setter(into))]
    api_socket: PathBuf,

    /// Where the daemon's configuration files are written.
    #[builder(setter(into))]
    config_dir: PathBuf,

    /// Where the daemon's logs are written.
    #[builder(setter(into))]
    log_dir: PathBuf,

    /// The FUSE mountpoint. Unset for fscache daemons.
    #[builder(default, setter(strip_option, into))]
    mountpoint: Option<PathBuf>,

    /// The supervisor socket, when the daemon is supervised.
    #[builder(default, setter(strip_option, into))]
    supervisor_path: Option<PathBuf>,

    /// Log level passed on the command line.
    #[builder(default = DEFAULT_LOG_LEVEL.to_string(), setter(into))]
    log_level: String,

    /// Rotation size of the daemon log in MiB.
    #[builder(default, setter(strip_option))]
    log_rotation_size: Option<u64>,

    /// Whether the daemon logs to the snapshotter's stdout.
    #[builder(default)]
    log_to_stdout: bool,

    /// Number of worker threads.
    #[builder(default, setter(strip_option))]
    thread_num: Option<u32>,

    /// The blob cache directory served through fscache.
    #[builder(default, setter(strip_option, into))]
    fscache_work_dir: Option<PathBuf>,

    /// Version reported by the running daemon.
    #[builder(default, setter(strip_option))]
    version: Option<BuildTimeInfo>,
}

/// A daemon process, or a handle on one recovered after a restart.
///
/// The record owns the daemon's reference count and the instances attached to it. Process
/// lifecycle operations (`terminate`, `wait`) act on the spawned child when this process
/// started it, and on the recorded pid otherwise.
pub struct Daemon {
    states: RwLock<DaemonStates>,
    instances: Mutex<BTreeMap<String, RafsInstance>>,
    refs: AtomicI32,
    state: Mutex<DaemonState>,
    connector: Arc<dyn DaemonConnector>,
    client: Mutex<Option<Arc<dyn DaemonApi>>>,
    supervisor: RwLock<Option<Arc<dyn Supervisor>>>,
    process: tokio::sync::Mutex<Option<SupervisedProcess>>,
    config: RwLock<Option<DaemonConfig>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonStates {
    /// Sets the process id.
    pub fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    /// Sets the control socket.
    pub fn set_api_socket(&mut self, api_socket: impl Into<PathBuf>) {
        self.api_socket = api_socket.into();
    }

    /// Sets the supervisor socket.
    pub fn set_supervisor_path(&mut self, supervisor_path: Option<PathBuf>) {
        self.supervisor_path = supervisor_path;
    }

    /// Sets the reported version.
    pub fn set_version(&mut self, version: BuildTimeInfo) {
        self.version = Some(version);
    }
}

impl Daemon {
    /// Creates a daemon record. No process is started.
    pub fn new(states: DaemonStates, connector: Arc<dyn DaemonConnector>) -> Self {
        Self {
            states: RwLock::new(states),
            instances: Mutex::new(BTreeMap::new()),
            refs: AtomicI32::new(0),
            state: Mutex::new(DaemonState::Init),
            connector,
            client: Mutex::new(None),
            supervisor: RwLock::new(None),
            process: tokio::sync::Mutex::new(None),
            config: RwLock::new(None),
        }
    }

    /// A copy of the persisted description.
    pub fn states(&self) -> DaemonStates {
        self.read_states().clone()
    }

    /// Updates the persisted description in place.
    pub fn update_states(&self, f: impl FnOnce(&mut DaemonStates)) {
        f(&mut self.states.write().unwrap_or_else(|e| e.into_inner()));
    }

    /// The daemon id.
    pub fn id(&self) -> String {
        self.read_states().id.clone()
    }

    /// The driver the daemon serves.
    pub fn fs_driver(&self) -> FsDriver {
        self.read_states().fs_driver
    }

    /// Returns `true` if the daemon serves many snapshots.
    pub fn is_shared(&self) -> bool {
        self.read_states().daemon_mode == DaemonMode::Shared
    }

    /// Pid of the daemon process.
    pub fn pid(&self) -> Option<u32> {
        self.read_states().pid
    }

    /// The control socket.
    pub fn api_socket(&self) -> PathBuf {
        self.read_states().api_socket.clone()
    }

    /// The FUSE mountpoint of the daemon on the host.
    pub fn host_mountpoint(&self) -> Option<PathBuf> {
        self.read_states().mountpoint.clone()
    }

    /// Configuration file of the daemon, or of one instance of a shared daemon.
    pub fn config_file(&self, snapshot_id: Option<&str>) -> PathBuf {
        let states = self.read_states();
        match snapshot_id {
            Some(sid) if states.daemon_mode == DaemonMode::Shared => {
                states.config_dir.join(sid).join(DAEMON_CONFIG_FILENAME)
            }
            _ => states.config_dir.join(DAEMON_CONFIG_FILENAME),
        }
    }

    /// The daemon's own log file.
    pub fn log_file(&self) -> PathBuf {
        self.read_states().log_dir.join(DAEMON_LOG_FILENAME)
    }

    /// The configuration the daemon was started with.
    pub fn config(&self) -> Option<DaemonConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sets the configuration the daemon is started with.
    pub fn set_config(&self, config: DaemonConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(config);
    }

    /// The supervisor holding the daemon's states for failover.
    pub fn supervisor(&self) -> Option<Arc<dyn Supervisor>> {
        self.supervisor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Attaches a supervisor.
    pub fn set_supervisor(&self, supervisor: Option<Arc<dyn Supervisor>>) {
        self.update_states(|s| {
            s.set_supervisor_path(supervisor.as_ref().map(|s| s.socket_path().to_path_buf()))
        });
        *self.supervisor.write().unwrap_or_else(|e| e.into_inner()) = supervisor;
    }

    /// Records a process spawned for this daemon.
    pub async fn set_process(&self, process: SupervisedProcess) {
        self.update_states(|s| s.set_pid(Some(process.pid())));
        *self.process.lock().await = Some(process);
    }

    /// The control client, created on first use.
    pub fn client(&self) -> Arc<dyn DaemonApi> {
        let api_socket = self.api_socket();
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| self.connector.connect(&api_socket))
            .clone()
    }

    /// Drops the cached control client so the next request reconnects.
    pub fn reset_client(&self) {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Waits until the control socket exists.
    pub async fn wait_for_socket(&self) -> SnapshotterResult<()> {
        self.connector
            .wait_for_socket(&self.api_socket(), self.pid())
            .await
    }

    /// Queries the daemon state through the control API.
    pub async fn get_state(&self) -> SnapshotterResult<DaemonState> {
        let info = self.client().get_daemon_info().await?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = info.state;
        Ok(info.state)
    }

    /// The state seen by the last successful query.
    pub fn last_state(&self) -> DaemonState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a state without asking the daemon.
    pub fn set_last_state(&self, state: DaemonState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Queries the version of the running daemon.
    pub async fn get_version(&self) -> SnapshotterResult<BuildTimeInfo> {
        Ok(self.client().get_daemon_info().await?.version)
    }

    /// Polls the control API until the daemon reports `expected`.
    ///
    /// Gives up early if the daemon process dies.
    pub async fn wait_until_state(&self, expected: DaemonState) -> SnapshotterResult<()> {
        let mut last = String::from("no response");
        for _ in 0..DAEMON_STATE_WAIT_ATTEMPTS {
            if let Some(pid) = self.pid() {
                if !snaputils::is_process_alive(pid) {
                    return Err(SnapshotterError::InvalidState(format!(
                        "daemon {} (pid {pid}) died while waiting for state {expected}",
                        self.id()
                    )));
                }
            }

            match self.get_state().await {
                Ok(state) if state == expected => return Ok(()),
                Ok(state) => last = state.to_string(),
                Err(e) => last = e.to_string(),
            }

            tokio::time::sleep(DAEMON_STATE_WAIT_INTERVAL).await;
        }

        Err(SnapshotterError::Timeout(format!(
            "daemon {} did not reach state {expected}, last seen: {last}",
            self.id()
        )))
    }

    /// Increments the reference count.
    pub fn inc_ref(&self) -> i32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the reference count.
    pub fn dec_ref(&self) -> i32 {
        self.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// The reference count.
    pub fn get_ref(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Attaches an instance and takes a reference for it.
    ///
    /// Re-attaching an instance replaces it without taking another reference.
    pub fn add_instance(&self, instance: RafsInstance) {
        let previous = self
            .lock_instances()
            .insert(instance.get_snapshot_id().clone(), instance);
        if previous.is_none() {
            self.inc_ref();
        }
    }

    /// Detaches the instance of `snapshot_id` and drops its reference.
    pub fn remove_instance(&self, snapshot_id: &str) -> Option<RafsInstance> {
        let removed = self.lock_instances().remove(snapshot_id);
        if removed.is_some() {
            self.dec_ref();
        }
        removed
    }

    /// The attached instances, ordered by sequence number.
    pub fn instances(&self) -> Vec<RafsInstance> {
        let mut instances: Vec<_> = self.lock_instances().values().cloned().collect();
        instances.sort_by_key(|i| *i.get_seq());
        instances
    }

    /// The first attached instance. A dedicated daemon serves exactly this one.
    pub fn head_instance(&self) -> Option<RafsInstance> {
        self.instances().into_iter().next()
    }

    /// Mounts an instance inside this shared daemon.
    ///
    /// The instance's mountpoint must already be set. Fscache instances get their fscache id
    /// and domain recorded as annotations.
    pub async fn shared_mount(&self, instance: &mut RafsInstance) -> SnapshotterResult<()> {
        match self.fs_driver() {
            FsDriver::Fusedev => self.shared_fusedev_mount(instance).await,
            FsDriver::Fscache => self.shared_erofs_mount(instance).await,
            driver => Err(SnapshotterError::InvalidArgument(format!(
                "fs driver {driver} is not served by a shared daemon"
            ))),
        }
    }

    /// Reverses [`shared_mount`](Self::shared_mount).
    pub async fn shared_umount(&self, instance: &RafsInstance) -> SnapshotterResult<()> {
        match self.fs_driver() {
            FsDriver::Fusedev => {
                self.client()
                    .umount(&instance.relative_mountpoint())
                    .await
            }
            FsDriver::Fscache => {
                let fscache_id = instance
                    .annotation(ANNOTATION_FSCACHE_ID)
                    .map(str::to_string)
                    .unwrap_or_else(|| utils::fscache_id(instance.get_snapshot_id()));
                let domain_id = instance
                    .annotation(ANNOTATION_FSCACHE_DOMAIN_ID)
                    .unwrap_or(&fscache_id)
                    .to_string();

                self.client().unbind_blob(&domain_id, &fscache_id).await?;
                utils::umount(instance.get_mountpoint(), false)
            }
            driver => Err(SnapshotterError::InvalidArgument(format!(
                "fs driver {driver} is not served by a shared daemon"
            ))),
        }
    }

    /// Unmounts an instance. Dedicated daemons take their mount down when they exit.
    pub async fn umount_instance(&self, instance: &RafsInstance) -> SnapshotterResult<()> {
        if self.is_shared() {
            self.shared_umount(instance).await?;
        }
        Ok(())
    }

    /// Unmounts every attached instance, logging failures.
    pub async fn umount_all_instances(&self) {
        for instance in self.instances() {
            if let Err(e) = self.umount_instance(&instance).await {
                tracing::warn!(daemon_id = %self.id(), snapshot_id = %instance.get_snapshot_id(), error = %e, "failed to unmount instance");
            }
        }
    }

    /// Removes what a dead daemon left behind so a new process can start in its place.
    pub fn clear_vestige(&self) {
        if let Some(mountpoint) = self.host_mountpoint() {
            if let Err(e) = utils::umount(&mountpoint, true) {
                tracing::warn!(daemon_id = %self.id(), mountpoint = %mountpoint.display(), error = %e, "failed to unmount stale mountpoint");
            }
        }

        let api_socket = self.api_socket();
        if let Err(e) = std::fs::remove_file(&api_socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(daemon_id = %self.id(), socket = %api_socket.display(), error = %e, "failed to remove stale api socket");
            }
        }

        self.reset_client();
    }

    /// Sends `SIGTERM` to the daemon process.
    pub fn terminate(&self) -> SnapshotterResult<()> {
        if let Some(pid) = self.pid() {
            tracing::info!(daemon_id = %self.id(), pid = pid, "terminating daemon");
            snaputils::terminate_process(pid)?;
        }
        Ok(())
    }

    /// Waits for the daemon process to exit, killing it if it lingers.
    pub async fn wait(&self) -> SnapshotterResult<()> {
        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if tokio::time::timeout(DAEMON_EXIT_TIMEOUT, child.wait())
                .await
                .is_err()
            {
                tracing::warn!(daemon_id = %self.id(), pid = child.pid(), "daemon did not exit in time, killing it");
                snaputils::kill_process(child.pid())?;
                child.wait().await;
            }
            process.take();
            return Ok(());
        }
        drop(process);

        if let Some(pid) = self.pid() {
            if !snaputils::wait_for_exit(pid, DAEMON_EXIT_TIMEOUT).await {
                tracing::warn!(daemon_id = %self.id(), pid = pid, "daemon did not exit in time, killing it");
                snaputils::kill_process(pid)?;
                if !snaputils::wait_for_exit(pid, DAEMON_EXIT_TIMEOUT).await {
                    return Err(SnapshotterError::Timeout(format!(
                        "daemon {} (pid {pid}) did not exit",
                        self.id()
                    )));
                }
            }
        }

        Ok(())
    }

    async fn shared_fusedev_mount(&self, instance: &RafsInstance) -> SnapshotterResult<()> {
        let bootstrap = instance.bootstrap_file()?;
        let config = self
            .read_config_file(instance.get_snapshot_id())
            .await?;

        self.client()
            .mount(
                &instance.relative_mountpoint(),
                &bootstrap.display().to_string(),
                &config,
            )
            .await?;

        tracing::info!(daemon_id = %self.id(), snapshot_id = %instance.get_snapshot_id(), "mounted instance in shared daemon");
        Ok(())
    }

    async fn shared_erofs_mount(&self, instance: &mut RafsInstance) -> SnapshotterResult<()> {
        tokio::fs::create_dir_all(instance.fscache_work_dir()).await?;

        let config_file = self.config_file(Some(instance.get_snapshot_id()));
        let daemon_config = DaemonConfig::load(FsDriver::Fscache, &config_file)?;
        let domain_id = match &daemon_config {
            DaemonConfig::Fscache(c) => c.domain_id.clone(),
            DaemonConfig::Fuse(_) => {
                return Err(SnapshotterError::InvalidArgument(format!(
                    "{} is not a fscache configuration",
                    config_file.display()
                )))
            }
        };
        let config = daemon_config.dump_string()?;

        let fscache_id = utils::fscache_id(instance.get_snapshot_id());
        let domain_id = if domain_id.is_empty() {
            fscache_id.clone()
        } else {
            domain_id
        };
        instance.add_annotation(ANNOTATION_FSCACHE_DOMAIN_ID, domain_id.clone());
        instance.add_annotation(ANNOTATION_FSCACHE_ID, fscache_id.clone());

        self.client().bind_blob(&config).await?;

        let options = if domain_id != fscache_id {
            format!("domain_id={domain_id},fsid={fscache_id}")
        } else {
            format!("fsid={fscache_id}")
        };

        match utils::mount_erofs("erofs", instance.get_mountpoint(), &options) {
            Err(SnapshotterError::Nix(nix::Error::EBUSY)) => {
                tracing::warn!(snapshot_id = %instance.get_snapshot_id(), "erofs already mounted");
            }
            result => result?,
        }

        Ok(())
    }

    async fn read_config_file(&self, snapshot_id: &str) -> SnapshotterResult<String> {
        let path = self.config_file(Some(snapshot_id));
        tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SnapshotterError::NotFound(format!("daemon config {}", path.display()))
            }
            _ => e.into(),
        })
    }

    fn read_states(&self) -> std::sync::RwLockReadGuard<'_, DaemonStates> {
        self.states.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RafsInstance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a new daemon id.
pub fn new_daemon_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<'r> FromRow<'r, SqliteRow> for DaemonStates {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let path = |column: &str| -> Result<Option<PathBuf>, sqlx::Error> {
            Ok(row.try_get::<Option<String>, _>(column)?.map(PathBuf::from))
        };

        Ok(Self {
            id: row.try_get("id")?,
            fs_driver: parse_column(row, "fs_driver")?,
            daemon_mode: parse_column(row, "daemon_mode")?,
            pid: row.try_get::<Option<i64>, _>("pid")?.map(|pid| pid as u32),
            api_socket: row.try_get::<String, _>("api_socket")?.into(),
            config_dir: row.try_get::<String, _>("config_dir")?.into(),
            log_dir: row.try_get::<String, _>("log_dir")?.into(),
            mountpoint: path("mountpoint")?,
            supervisor_path: path("supervisor_path")?,
            log_level: row.try_get("log_level")?,
            log_rotation_size: row
                .try_get::<Option<i64>, _>("log_rotation_size")?
                .map(|n| n as u64),
            log_to_stdout: row.try_get("log_to_stdout")?,
            thread_num: row.try_get::<Option<i64>, _>("thread_num")?.map(|n| n as u32),
            fscache_work_dir: path("fscache_work_dir")?,
            version: parse_json_column(row, "version")?,
        })
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("states", &*self.read_states())
            .field("refs", &self.get_ref())
            .field("state", &self.last_state())
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::daemon::FakeConnector;

    use super::*;

    fn shared_fusedev(root: &Path) -> DaemonStates {
        DaemonStates::builder()
            .fs_driver(FsDriver::Fusedev)
            .daemon_mode(DaemonMode::Shared)
            .api_socket(root.join("socket/shared/api.sock"))
            .config_dir(root.join("config/shared"))
            .log_dir(root.join("logs/shared"))
            .mountpoint(root.join("mnt"))
            .build()
    }

    fn instance(root: &Path, sid: &str, seq: u64) -> RafsInstance {
        RafsInstance::builder()
            .seq(seq)
            .image_id("example.com/app:v1")
            .fs_driver(FsDriver::Fusedev)
            .snapshot_id(sid)
            .snapshot_dir(root.join("snapshots").join(sid))
            .mountpoint(root.join("mnt").join(sid))
            .build()
    }

    #[test]
    fn test_config_file_layout() {
        let root = Path::new("/state");
        let shared = Daemon::new(shared_fusedev(root), Arc::new(FakeConnector::default()));
        assert_eq!(
            shared.config_file(Some("7")),
            PathBuf::from("/state/config/shared/7/config.json")
        );
        assert_eq!(
            shared.config_file(None),
            PathBuf::from("/state/config/shared/config.json")
        );
        assert_eq!(shared.log_file(), PathBuf::from("/state/logs/shared/nydusd.log"));

        let dedicated = DaemonStates::builder()
            .fs_driver(FsDriver::Fusedev)
            .daemon_mode(DaemonMode::Dedicated)
            .api_socket("/state/socket/d/api.sock")
            .config_dir("/state/config/d")
            .log_dir("/state/logs/d")
            .build();
        let dedicated = Daemon::new(dedicated, Arc::new(FakeConnector::default()));
        assert_eq!(
            dedicated.config_file(Some("7")),
            PathBuf::from("/state/config/d/config.json")
        );
    }

    #[test]
    fn test_instances_drive_reference_count() {
        let root = Path::new("/state");
        let daemon = Daemon::new(shared_fusedev(root), Arc::new(FakeConnector::default()));

        daemon.add_instance(instance(root, "b", 2));
        daemon.add_instance(instance(root, "a", 1));
        daemon.add_instance(instance(root, "a", 1));
        assert_eq!(daemon.get_ref(), 2);
        assert_eq!(
            daemon.head_instance().map(|i| i.get_snapshot_id().clone()),
            Some("a".to_string())
        );

        assert!(daemon.remove_instance("a").is_some());
        assert!(daemon.remove_instance("a").is_none());
        assert_eq!(daemon.get_ref(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_state() -> anyhow::Result<()> {
        let root = Path::new("/state");
        let connector = Arc::new(FakeConnector::default());
        let daemon = Daemon::new(shared_fusedev(root), connector.clone());

        daemon.wait_until_state(DaemonState::Running).await?;
        assert_eq!(daemon.last_state(), DaemonState::Running);

        connector
            .daemon(&daemon.api_socket())
            .set_state(DaemonState::Init);
        let err = daemon
            .wait_until_state(DaemonState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotterError::Timeout(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_shared_fusedev_mount_uses_instance_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let connector = Arc::new(FakeConnector::default());
        let daemon = Daemon::new(shared_fusedev(dir.path()), connector.clone());

        let mut instance = instance(dir.path(), "s1", 1);
        let bootstrap = dir.path().join("snapshots/s1/fs/image/image.boot");
        std::fs::create_dir_all(bootstrap.parent().unwrap())?;
        std::fs::write(&bootstrap, b"")?;

        assert!(daemon.shared_mount(&mut instance).await.unwrap_err().is_not_found());

        let config_file = daemon.config_file(Some("s1"));
        std::fs::create_dir_all(config_file.parent().unwrap())?;
        std::fs::write(&config_file, b"{}")?;

        daemon.shared_mount(&mut instance).await?;
        daemon.add_instance(instance);
        daemon.umount_all_instances().await;

        let fake = connector.daemon(&daemon.api_socket());
        assert_eq!(fake.calls(), vec!["mount /s1", "umount /s1"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_clear_vestige_removes_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut states = shared_fusedev(dir.path());
        states.set_api_socket(dir.path().join("api.sock"));
        std::fs::write(dir.path().join("api.sock"), b"")?;

        let daemon = Daemon::new(states, Arc::new(FakeConnector::default()));
        daemon.clear_vestige();
        assert!(!dir.path().join("api.sock").exists());

        Ok(())
    }
}
