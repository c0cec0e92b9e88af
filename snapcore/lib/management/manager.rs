use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use getset::Getters;
use snaputils::Supervisor as ProcessSupervisor;
use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

use crate::{
    config::{DaemonConfig, FsDriver, RecoverPolicy},
    daemon::{
        Daemon, DaemonCommand, DaemonConnector, DaemonState, DaemonStates, DaemonSubcommand,
        HttpConnector, InstanceRegistry, RafsInstance,
    },
    management::{DaemonMonitor, DaemonTable, DeathEvent, LivenessMonitor, Store, SupervisorSet},
    utils, SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a supervisor waits for a replacement process to pick the states up.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Name the daemon processes are logged under.
const DAEMON_PROCESS_NAME: &str = "nydusd";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings of a [`Manager`].
#[derive(TypedBuilder)]
pub struct ManagerOptions {
    /// The driver whose daemons the manager owns.
    fs_driver: FsDriver,

    /// The daemon binary.
    #[builder(setter(into))]
    nydusd_path: PathBuf,

    /// Blob cache directory handed to fscache daemons.
    #[builder(setter(into))]
    cache_dir: PathBuf,

    /// Where supervisor sockets live.
    #[builder(setter(into))]
    supervisor_dir: PathBuf,

    /// What to do when a daemon dies.
    #[builder(default)]
    recover_policy: RecoverPolicy,

    /// Template of the per-instance daemon configuration.
    #[builder(default, setter(strip_option))]
    daemon_config: Option<DaemonConfig>,

    /// Daemon records.
    store: Arc<Store>,

    /// Creates control clients.
    #[builder(default = Arc::new(HttpConnector))]
    connector: Arc<dyn DaemonConnector>,
}

/// Owns the daemons of one driver: their records, their processes and their recovery.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Manager {
    /// The driver whose daemons the manager owns.
    fs_driver: FsDriver,

    /// The daemon binary.
    nydusd_path: PathBuf,

    /// Blob cache directory handed to fscache daemons.
    cache_dir: PathBuf,

    /// What to do when a daemon dies.
    recover_policy: RecoverPolicy,

    /// Template of the per-instance daemon configuration.
    daemon_config: Option<DaemonConfig>,

    /// Persistent records.
    store: Arc<Store>,

    /// Creates control clients.
    connector: Arc<dyn DaemonConnector>,

    #[getset(skip)]
    daemons: DaemonTable,

    #[getset(skip)]
    liveness: Arc<LivenessMonitor>,

    #[getset(skip)]
    supervisors: Option<SupervisorSet>,

    #[getset(skip)]
    records: tokio::sync::Mutex<()>,
}

/// Daemons found in the store at startup.
#[derive(Default)]
pub struct RecoveredDaemons {
    /// Daemons still running. They are reused as they are.
    pub live: Vec<Arc<Daemon>>,

    /// Daemons whose process is gone. They must be relaunched and their instances mounted
    /// again.
    pub recovering: Vec<Arc<Daemon>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Manager {
    /// Creates a manager and starts reacting to daemon deaths.
    pub async fn new(options: ManagerOptions) -> SnapshotterResult<Arc<Self>> {
        let ManagerOptions {
            fs_driver,
            nydusd_path,
            cache_dir,
            supervisor_dir,
            recover_policy,
            daemon_config,
            store,
            connector,
        } = options;

        let supervisors = match recover_policy {
            RecoverPolicy::Failover => Some(SupervisorSet::new(supervisor_dir).await?),
            _ => None,
        };

        let (liveness, events) = LivenessMonitor::new();
        let manager = Arc::new(Self {
            fs_driver,
            nydusd_path,
            cache_dir,
            recover_policy,
            daemon_config,
            store,
            connector,
            daemons: DaemonTable::default(),
            liveness,
            supervisors,
            records: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(handle_death_events(Arc::downgrade(&manager), events));
        tracing::info!(fs_driver = %fs_driver, recover_policy = %recover_policy, "daemon manager created");

        Ok(manager)
    }

    /// Registers and persists a new daemon built from `states`.
    ///
    /// Fails with `AlreadyExists` when a daemon with the same id is known, which is how a
    /// concurrent duplicate mount is detected.
    pub async fn new_daemon(&self, states: DaemonStates) -> SnapshotterResult<Arc<Daemon>> {
        let daemon = Arc::new(Daemon::new(states, self.connector.clone()));
        if let Some(supervisors) = &self.supervisors {
            daemon.set_supervisor(Some(supervisors.attach(&daemon.id())));
        }

        let _records = self.records.lock().await;
        self.daemons.add(daemon.clone())?;
        if let Err(e) = self.store.add_daemon(&daemon.states()).await {
            self.daemons.remove(&daemon.id());
            return Err(e);
        }

        tracing::info!(daemon_id = %daemon.id(), fs_driver = %self.fs_driver, shared = daemon.is_shared(), "created daemon");
        Ok(daemon)
    }

    /// Persists the current description of `daemon`.
    pub async fn update_daemon(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        let _records = self.records.lock().await;
        if self.daemons.get(&daemon.id()).is_none() {
            return Err(SnapshotterError::NotFound(format!("daemon {}", daemon.id())));
        }

        self.store.update_daemon(&daemon.states()).await
    }

    /// Forgets `daemon` and deletes its record. The process is left alone.
    pub async fn delete_daemon(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        let _records = self.records.lock().await;
        self.store.delete_daemon(&daemon.id()).await?;
        self.daemons.remove(&daemon.id());
        Ok(())
    }

    /// Returns the daemon `daemon_id`.
    pub fn get_by_daemon_id(&self, daemon_id: &str) -> Option<Arc<Daemon>> {
        self.daemons.get(daemon_id)
    }

    /// Puts `daemon` in place of the known daemon with the same id.
    pub(crate) fn replace_daemon(&self, daemon: Arc<Daemon>) -> Option<Arc<Daemon>> {
        self.daemons.replace(daemon)
    }

    /// All daemons of this manager.
    pub fn list_daemons(&self) -> Vec<Arc<Daemon>> {
        self.daemons.list()
    }

    /// Persists an instance, assigning its sequence number.
    pub async fn new_instance(&self, instance: &mut RafsInstance) -> SnapshotterResult<()> {
        self.store.add_instance(instance).await
    }

    /// Deletes the record of the instance of `snapshot_id`.
    pub async fn remove_instance(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        self.store.delete_instance(snapshot_id).await
    }

    /// Returns `true` if the death of `daemon_id` is being watched for.
    pub fn is_monitored(&self, daemon_id: &str) -> bool {
        self.liveness.is_subscribed(daemon_id)
    }

    /// Builds the command line of `daemon`.
    ///
    /// `upgrade` makes the process take over from the supervisor instead of starting fresh.
    pub fn build_daemon_command(
        &self,
        daemon: &Daemon,
        upgrade: bool,
    ) -> SnapshotterResult<DaemonCommand> {
        let states = daemon.states();
        let threads = states.get_thread_num().filter(|n| *n > 0);

        let (subcommand, fscache, mountpoint) = match daemon.fs_driver() {
            FsDriver::Fscache => (DaemonSubcommand::Singleton, Some(self.cache_dir.clone()), None),
            FsDriver::Fusedev => {
                let mountpoint = daemon.host_mountpoint().ok_or_else(|| {
                    SnapshotterError::InvalidState(format!(
                        "fusedev daemon {} has no mountpoint",
                        daemon.id()
                    ))
                })?;
                (DaemonSubcommand::Fuse, None, Some(mountpoint))
            }
            driver => {
                return Err(SnapshotterError::InvalidArgument(format!(
                    "fs driver {driver} does not run daemons"
                )))
            }
        };

        let (config, bootstrap) = if subcommand == DaemonSubcommand::Fuse && !daemon.is_shared() {
            let instance = daemon.head_instance().ok_or_else(|| {
                SnapshotterError::NotFound(format!("instance of dedicated daemon {}", daemon.id()))
            })?;
            (
                Some(daemon.config_file(None)),
                Some(instance.bootstrap_file()?),
            )
        } else {
            (None, None)
        };

        let supervisor = daemon.supervisor();
        let log_file = (!states.get_log_to_stdout()).then(|| daemon.log_file());

        Ok(DaemonCommand::builder()
            .subcommand(subcommand)
            .fscache(fscache)
            .fscache_threads(threads.filter(|_| subcommand == DaemonSubcommand::Singleton))
            .thread_num(threads.filter(|_| subcommand == DaemonSubcommand::Fuse))
            .id(supervisor.as_ref().map(|_| states.get_id().clone()))
            .config(config)
            .bootstrap(bootstrap)
            .mountpoint(mountpoint)
            .apisock(states.get_api_socket().clone())
            .log_level(states.get_log_level().clone())
            .log_rotation_size(states.get_log_rotation_size().filter(|n| *n > 0))
            .supervisor(supervisor.map(|s| s.socket_path().to_path_buf()))
            .log_file(log_file)
            .upgrade(upgrade)
            .build())
    }

    /// Launches the process of `daemon` and records its pid.
    ///
    /// Once the control socket shows up the process is watched for death, and after it reports
    /// `Running` its states are saved to the supervisor. Both happen in the background.
    pub async fn start_daemon(self: &Arc<Self>, daemon: &Arc<Daemon>) -> SnapshotterResult<()> {
        self.spawn_daemon(daemon, &self.nydusd_path, false).await?;

        if let Err(e) = self.update_daemon(daemon).await {
            tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to persist daemon pid");
        }

        let manager = self.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.watch_started_daemon(&daemon).await {
                tracing::error!(daemon_id = %daemon.id(), error = %e, "daemon did not come up");
            }
        });

        Ok(())
    }

    /// Tears `daemon` down: its record, its instances, its process and its directories.
    pub async fn destroy_daemon(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        let id = daemon.id();
        tracing::info!(daemon_id = %id, "destroying daemon");

        self.delete_daemon(daemon).await?;
        scopeguard::defer! {
            self.clean_up_daemon_resources(daemon);
        }

        daemon.umount_all_instances().await;
        self.liveness.unsubscribe(&id);

        if let Some(supervisors) = &self.supervisors {
            if let Err(e) = supervisors.detach(&id).await {
                tracing::warn!(daemon_id = %id, error = %e, "failed to detach supervisor");
            }
        }

        if let Err(e) = daemon.terminate() {
            tracing::warn!(daemon_id = %id, error = %e, "failed to terminate daemon");
        }
        if let Err(e) = daemon.wait().await {
            tracing::warn!(daemon_id = %id, error = %e, "failed to wait for daemon");
        }

        if !daemon.is_shared() {
            if let Some(mountpoint) = daemon.host_mountpoint() {
                if utils::is_mounted(&mountpoint) {
                    utils::umount(&mountpoint, true)?;
                }
            }
        }

        daemon.set_last_state(DaemonState::Destroyed);
        Ok(())
    }

    /// Removes the configuration and log directories of `daemon`, and its socket directory
    /// unless the daemon is shared.
    pub fn clean_up_daemon_resources(&self, daemon: &Daemon) {
        let states = daemon.states();
        let mut dirs = vec![states.get_config_dir().clone(), states.get_log_dir().clone()];
        if !daemon.is_shared() {
            if let Some(socket_dir) = states.get_api_socket().parent() {
                dirs.push(socket_dir.to_path_buf());
            }
        }

        for dir in dirs {
            match std::fs::remove_dir_all(&dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    tracing::error!(daemon_id = %states.get_id(), dir = %dir.display(), error = %e, "failed to remove daemon directory");
                }
                _ => {}
            }
        }
    }

    /// Reloads the daemons and instances persisted by a previous run.
    ///
    /// Daemons answering on their control socket are `live`; the others are `recovering` and
    /// must be started again. Instances of this manager's driver are attached to their daemons
    /// and added to `registry`.
    pub async fn recover(
        self: &Arc<Self>,
        registry: &InstanceRegistry,
    ) -> SnapshotterResult<RecoveredDaemons> {
        let mut recovered = RecoveredDaemons::default();

        for states in self.store.walk_daemons(self.fs_driver).await? {
            let daemon = Arc::new(Daemon::new(states, self.connector.clone()));
            let id = daemon.id();

            if let Some(supervisors) = &self.supervisors {
                daemon.set_supervisor(Some(supervisors.attach(&id)));
            }

            if self.fs_driver == FsDriver::Fusedev {
                match DaemonConfig::load(FsDriver::Fusedev, daemon.config_file(None)) {
                    Ok(config) => daemon.set_config(config),
                    Err(e) => {
                        tracing::warn!(daemon_id = %id, error = %e, "failed to reload daemon config")
                    }
                }
            }

            self.daemons.replace(daemon.clone());

            match daemon.get_state().await {
                Err(e) => {
                    tracing::warn!(daemon_id = %id, error = %e, "daemon is not reachable, recovering it");
                    recovered.recovering.push(daemon);
                }
                Ok(DaemonState::Running) => {
                    tracing::info!(daemon_id = %id, pid = ?daemon.pid(), "found live daemon");
                    let manager = self.clone();
                    let live = daemon.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.adopt_live_daemon(&live).await {
                            tracing::error!(daemon_id = %live.id(), error = %e, "failed to adopt live daemon");
                        }
                    });
                    recovered.live.push(daemon);
                }
                Ok(state) => {
                    tracing::warn!(daemon_id = %id, state = %state, "daemon is neither running nor gone, skipping it");
                }
            }
        }

        let daemons = recovered
            .live
            .iter()
            .chain(recovered.recovering.iter())
            .map(|d| (d.id(), d.clone()))
            .collect::<std::collections::HashMap<_, _>>();

        for instance in self.store.walk_instances().await? {
            if *instance.get_fs_driver() != self.fs_driver {
                continue;
            }

            match self.fs_driver {
                FsDriver::Fusedev | FsDriver::Fscache => {
                    let daemon = instance
                        .get_daemon_id()
                        .as_deref()
                        .and_then(|id| daemons.get(id));
                    match daemon {
                        Some(daemon) => daemon.add_instance(instance.clone()),
                        None => {
                            tracing::warn!(snapshot_id = %instance.get_snapshot_id(), daemon_id = ?instance.get_daemon_id(), "instance has no recovered daemon");
                        }
                    }
                    registry.add(instance);
                }
                FsDriver::Blockdev => {
                    registry.add(instance);
                }
                _ => {}
            }
        }

        tracing::info!(
            fs_driver = %self.fs_driver,
            live = recovered.live.len(),
            recovering = recovered.recovering.len(),
            "recovered daemons"
        );

        Ok(recovered)
    }

    /// Watches `daemon` for death. `adopted` daemons were not spawned by this process.
    pub fn subscribe_daemon_event(&self, daemon: &Daemon, adopted: bool) -> SnapshotterResult<()> {
        let pid = daemon.pid().ok_or_else(|| {
            SnapshotterError::InvalidState(format!("daemon {} has no pid", daemon.id()))
        })?;
        self.liveness.subscribe(&daemon.id(), pid, adopted);
        Ok(())
    }

    /// Stops watching `daemon` for death.
    pub fn unsubscribe_daemon_event(&self, daemon: &Daemon) {
        self.liveness.unsubscribe(&daemon.id());
    }

    /// Spawns the process of `daemon` from `nydusd_path` and records it.
    pub(crate) async fn spawn_daemon(
        &self,
        daemon: &Daemon,
        nydusd_path: &Path,
        upgrade: bool,
    ) -> SnapshotterResult<()> {
        let command = self.build_daemon_command(daemon, upgrade)?;
        let states = daemon.states();
        tracing::info!(daemon_id = %states.get_id(), args = ?command.args(), upgrade = upgrade, "starting daemon");

        let monitor = DaemonMonitor::new(states.get_id().clone(), self.liveness.clone());
        let process = ProcessSupervisor::new(
            nydusd_path,
            command.args(),
            Vec::<(String, String)>::new(),
            DAEMON_PROCESS_NAME,
            states.get_log_dir(),
            monitor,
        )
        .forward_output(*states.get_log_to_stdout())
        .spawn()
        .await?;

        daemon.set_process(process).await;
        Ok(())
    }

    async fn watch_started_daemon(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        daemon.wait_for_socket().await?;
        self.subscribe_daemon_event(daemon, false)?;
        daemon.wait_until_state(DaemonState::Running).await?;
        self.save_states(daemon).await
    }

    async fn adopt_live_daemon(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        daemon.wait_for_socket().await?;
        self.subscribe_daemon_event(daemon, true)?;
        self.save_states(daemon).await
    }

    async fn save_states(&self, daemon: &Daemon) -> SnapshotterResult<()> {
        if let Some(supervisor) = daemon.supervisor() {
            supervisor.save_states(daemon.client().as_ref()).await?;
        }
        Ok(())
    }

    async fn handle_death(self: &Arc<Self>, event: DeathEvent) {
        let Some(daemon) = self.get_by_daemon_id(&event.daemon_id) else {
            tracing::warn!(daemon_id = %event.daemon_id, "death event for an unknown daemon");
            return;
        };

        daemon.set_last_state(DaemonState::Died);
        tracing::warn!(daemon_id = %event.daemon_id, pid = event.pid, recover_policy = %self.recover_policy, "daemon died");

        let manager = self.clone();
        match self.recover_policy {
            RecoverPolicy::None => {}
            RecoverPolicy::Restart => {
                tokio::spawn(async move {
                    if let Err(e) = manager.do_daemon_restart(&daemon).await {
                        tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to restart daemon");
                    }
                });
            }
            RecoverPolicy::Failover => {
                tokio::spawn(async move {
                    if let Err(e) = manager.do_daemon_failover(&daemon).await {
                        tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to fail daemon over");
                    }
                });
            }
        }
    }

    async fn do_daemon_restart(self: &Arc<Self>, daemon: &Arc<Daemon>) -> SnapshotterResult<()> {
        if let Err(e) = daemon.wait().await {
            tracing::warn!(daemon_id = %daemon.id(), error = %e, "failed to reap dead daemon");
        }

        self.unsubscribe_daemon_event(daemon);
        daemon.clear_vestige();
        self.start_daemon(daemon).await?;

        let instances = daemon.instances();
        if !daemon.is_shared() || instances.is_empty() {
            return Ok(());
        }

        daemon.wait_until_state(DaemonState::Running).await?;
        let host_mountpoint = daemon.host_mountpoint();
        for mut instance in instances {
            if host_mountpoint.as_deref() == Some(instance.get_mountpoint().as_path()) {
                continue;
            }
            if let Err(e) = daemon.shared_mount(&mut instance).await {
                tracing::warn!(daemon_id = %daemon.id(), snapshot_id = %instance.get_snapshot_id(), error = %e, "failed to mount instance again");
            }
        }

        tracing::info!(daemon_id = %daemon.id(), "daemon restarted");
        Ok(())
    }

    async fn do_daemon_failover(self: &Arc<Self>, daemon: &Arc<Daemon>) -> SnapshotterResult<()> {
        if let Err(e) = daemon.wait().await {
            tracing::warn!(daemon_id = %daemon.id(), error = %e, "failed to reap dead daemon");
        }

        self.unsubscribe_daemon_event(daemon);
        let supervisor = daemon.supervisor().ok_or_else(|| {
            SnapshotterError::InvalidState(format!("daemon {} has no supervisor", daemon.id()))
        })?;

        supervisor.handoff(HANDOFF_TIMEOUT).await?;
        daemon.reset_client();
        self.spawn_daemon(daemon, &self.nydusd_path, true).await?;
        if let Err(e) = self.update_daemon(daemon).await {
            tracing::error!(daemon_id = %daemon.id(), error = %e, "failed to persist daemon pid");
        }

        daemon.wait_for_socket().await?;
        self.subscribe_daemon_event(daemon, false)?;
        daemon.wait_until_state(DaemonState::Init).await?;
        daemon.client().take_over().await?;
        daemon.client().start().await?;
        daemon.wait_until_state(DaemonState::Running).await?;
        self.save_states(daemon).await?;

        tracing::info!(daemon_id = %daemon.id(), "daemon failed over");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn handle_death_events(manager: Weak<Manager>, mut events: mpsc::UnboundedReceiver<DeathEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.handle_death(event).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
