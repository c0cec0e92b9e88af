use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use getset::Getters;
use snaputils::KeyedMutex;
use typed_builder::TypedBuilder;

use crate::{
    cache::{CacheManager, Usage},
    config::{DaemonConfig, DaemonMode, FsDriver, SnapshotterConfig},
    daemon::{Daemon, DaemonState, DaemonStates, InstanceRegistry, RafsInstance},
    filesystem::{
        ConfigResolver, DigestVerifier, LabelConfigResolver, NoopVerifier, SignatureVerifier,
    },
    management::{Manager, ManagerOptions, Store},
    oci::RegistryFetcher,
    tarfs::{NydusImageTool, TarfsManager, TarfsOptions},
    utils::{self, API_SOCKET_FILENAME},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Directory below the state root where supervisor sockets live.
const SUPERVISOR_SUBDIR: &str = "supervisor";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a [`Filesystem`] is built from.
#[derive(TypedBuilder)]
pub struct FilesystemOptions {
    /// The snapshotter configuration. Directories and daemon defaults come from it.
    config: SnapshotterConfig,

    /// Daemon managers, at most one per driver.
    #[builder(default)]
    managers: Vec<Arc<Manager>>,

    /// The blob cache.
    #[builder(default)]
    cache_manager: Option<Arc<CacheManager>>,

    /// The block-mode manager, when tarfs is enabled.
    #[builder(default)]
    tarfs_manager: Option<Arc<TarfsManager>>,

    /// Checks image metadata before a mount is exposed.
    #[builder(default = Arc::new(NoopVerifier))]
    verifier: Arc<dyn SignatureVerifier>,

    /// Supplies the per-image part of daemon configurations.
    #[builder(default = Arc::new(LabelConfigResolver))]
    resolver: Arc<dyn ConfigResolver>,

    /// The table of mounted instances.
    #[builder(default)]
    registry: Arc<InstanceRegistry>,
}

/// The entry point for mounting and unmounting snapshots.
///
/// Each mount is routed to a driver: a shared daemon, a dedicated daemon, a block-mode
/// kernel mount, or nothing at all when no daemon is configured. Operations on one
/// snapshot are serialized, operations on different snapshots run concurrently.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Filesystem {
    /// The snapshotter configuration.
    config: SnapshotterConfig,

    /// The daemon mode in effect.
    daemon_mode: DaemonMode,

    /// The table of mounted instances.
    registry: Arc<InstanceRegistry>,

    #[getset(skip)]
    pub(super) managers: HashMap<FsDriver, Arc<Manager>>,

    #[getset(skip)]
    pub(super) cache_manager: Option<Arc<CacheManager>>,

    #[getset(skip)]
    pub(super) tarfs_manager: Option<Arc<TarfsManager>>,

    #[getset(skip)]
    pub(super) verifier: Arc<dyn SignatureVerifier>,

    #[getset(skip)]
    pub(super) resolver: Arc<dyn ConfigResolver>,

    #[getset(skip)]
    pub(super) shared_daemons: RwLock<HashMap<FsDriver, Arc<Daemon>>>,

    #[getset(skip)]
    pub(super) snapshot_locks: KeyedMutex,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Creates the orchestrator and brings back whatever a previous run left mounted.
    ///
    /// Persisted daemons are recovered, a shared daemon is started when none survived, and
    /// dead daemons are relaunched concurrently. A daemon that cannot be recovered is logged
    /// and skipped.
    pub async fn new(options: FilesystemOptions) -> SnapshotterResult<Arc<Self>> {
        let FilesystemOptions {
            config,
            managers,
            cache_manager,
            tarfs_manager,
            verifier,
            resolver,
            registry,
        } = options;

        let mut by_driver = HashMap::new();
        for manager in managers {
            let driver = *manager.get_fs_driver();
            if by_driver.insert(driver, manager).is_some() {
                return Err(SnapshotterError::InvalidArgument(format!(
                    "more than one manager for fs driver {driver}"
                )));
            }
        }

        let fs = Arc::new(Self {
            daemon_mode: config.effective_daemon_mode(),
            config,
            registry,
            managers: by_driver,
            cache_manager,
            tarfs_manager,
            verifier,
            resolver,
            shared_daemons: RwLock::new(HashMap::new()),
            snapshot_locks: KeyedMutex::new(),
        });

        fs.startup().await?;
        Ok(fs)
    }

    /// Builds every component the configuration asks for, then the orchestrator itself.
    pub async fn from_config(config: SnapshotterConfig) -> SnapshotterResult<Arc<Self>> {
        config.validate()?;
        tokio::fs::create_dir_all(config.snapshots_dir()).await?;

        let store = Arc::new(Store::open(config.database_path()).await?);
        let settings = config.get_daemon();
        let fs_driver = *settings.get_fs_driver();
        let cache_dir = config.cache_dir();
        let supervisor_dir = config.get_root().join(SUPERVISOR_SUBDIR);

        let mut managers = Vec::new();
        if config.effective_daemon_mode() != DaemonMode::None && fs_driver.is_daemon_backed() {
            let daemon_config = DaemonConfig::load(fs_driver, settings.get_config_path())?;
            tracing::debug!(fs_driver = %fs_driver, config = %daemon_config.dump_redacted()?, "loaded daemon config template");

            managers.push(
                Manager::new(
                    ManagerOptions::builder()
                        .fs_driver(fs_driver)
                        .nydusd_path(settings.get_nydusd_path())
                        .cache_dir(&cache_dir)
                        .supervisor_dir(&supervisor_dir)
                        .recover_policy(*settings.get_recover_policy())
                        .daemon_config(daemon_config)
                        .store(store.clone())
                        .build(),
                )
                .await?,
            );
        }

        let tarfs = config.get_experimental().get_tarfs();
        let tarfs_manager = if *tarfs.get_enable_tarfs() {
            managers.push(
                Manager::new(
                    ManagerOptions::builder()
                        .fs_driver(FsDriver::Blockdev)
                        .nydusd_path(settings.get_nydusd_path())
                        .cache_dir(&cache_dir)
                        .supervisor_dir(&supervisor_dir)
                        .store(store.clone())
                        .build(),
                )
                .await?,
            );

            Some(Arc::new(TarfsManager::new(
                TarfsOptions::builder()
                    .snapshots_dir(config.snapshots_dir())
                    .cache_dir(&cache_dir)
                    .fetcher(Arc::new(RegistryFetcher::new(false)))
                    .tool(Arc::new(NydusImageTool::new(settings.get_nydusimage_path())))
                    .check_tarfs_hint(*tarfs.get_tarfs_hint())
                    .max_concurrent_proc(*tarfs.get_max_concurrent_proc())
                    .mount_on_host(*tarfs.get_mount_tarfs_on_host())
                    .export_mode(*tarfs.get_export_mode())
                    .build(),
            )))
        } else {
            None
        };

        let cache_manager = if *config.get_cache_manager().get_disable() {
            None
        } else {
            Some(Arc::new(CacheManager::new(&cache_dir).await?))
        };

        let verifier: Arc<dyn SignatureVerifier> = if *config.get_image().get_validate_signature() {
            Arc::new(DigestVerifier)
        } else {
            Arc::new(NoopVerifier)
        };

        Self::new(
            FilesystemOptions::builder()
                .config(config)
                .managers(managers)
                .cache_manager(cache_manager)
                .tarfs_manager(tarfs_manager)
                .verifier(verifier)
                .build(),
        )
        .await
    }

    /// Whether snapshots are served by daemons at all.
    pub fn daemon_backed(&self) -> bool {
        self.daemon_mode != DaemonMode::None
    }

    /// Where the filesystem of `snapshot_id` is visible on the host.
    ///
    /// Without daemons nothing is mounted, and the root mountpoint stands in for every
    /// snapshot that has no instance.
    pub fn mount_point(&self, snapshot_id: &str) -> SnapshotterResult<PathBuf> {
        if let Some(instance) = self.registry.get(snapshot_id) {
            return Ok(instance.get_mountpoint().clone());
        }

        if !self.daemon_backed() {
            return Ok(self.config.root_mountpoint());
        }

        Err(SnapshotterError::NotFound(format!(
            "instance of snapshot {snapshot_id}"
        )))
    }

    /// Waits until the daemon serving `snapshot_id` is running.
    pub async fn wait_until_ready(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        if !self.daemon_backed() {
            return Ok(());
        }

        let instance = self.registry.get(snapshot_id).ok_or_else(|| {
            SnapshotterError::NotFound(format!("instance of snapshot {snapshot_id}"))
        })?;

        match instance.get_fs_driver() {
            FsDriver::Fusedev | FsDriver::Fscache => {
                let daemon = self.daemon_of(&instance)?;
                daemon.wait_until_state(DaemonState::Running).await
            }
            _ => Ok(()),
        }
    }

    /// Disk usage of the cached blob `blob_digest`, a `sha256:` digest.
    pub async fn cache_usage(&self, blob_digest: &str) -> SnapshotterResult<Usage> {
        let blob_id = utils::blob_id_from_digest(blob_digest)?;
        self.cache()?.cache_usage(&blob_id).await
    }

    /// Drops the cache of the blob `blob_digest`, a `sha256:` digest.
    ///
    /// With fscache the blob is unbound from the shared daemon, which owns the cache files.
    pub async fn remove_cache(&self, blob_digest: &str) -> SnapshotterResult<()> {
        let blob_id = utils::blob_id_from_digest(blob_digest)?;
        tracing::info!(blob_id = %blob_id, "removing blob cache");

        if self.managers.contains_key(&FsDriver::Fscache) {
            let daemon = self.shared_daemon(FsDriver::Fscache).ok_or_else(|| {
                SnapshotterError::NotFound("shared fscache daemon".to_string())
            })?;
            return daemon.client().unbind_blob("", &blob_id).await;
        }

        self.cache()?.remove_blob_cache(&blob_id).await
    }

    /// Unmounts every instance, logging failures.
    pub async fn teardown(&self) {
        let instances = self.registry.list();
        tracing::info!(instances = instances.len(), "tearing down filesystem");

        for instance in instances {
            let snapshot_id = instance.get_snapshot_id();
            if let Err(e) = self.umount(snapshot_id).await {
                tracing::error!(snapshot_id = %snapshot_id, error = %e, "failed to unmount snapshot");
            }
        }
    }

    pub(super) fn get_manager(&self, fs_driver: FsDriver) -> SnapshotterResult<&Arc<Manager>> {
        self.managers.get(&fs_driver).ok_or_else(|| {
            SnapshotterError::NotFound(format!("manager for fs driver {fs_driver}"))
        })
    }

    pub(super) fn tarfs(&self) -> SnapshotterResult<&Arc<TarfsManager>> {
        self.tarfs_manager
            .as_ref()
            .ok_or_else(|| SnapshotterError::InvalidState("tarfs is not enabled".to_string()))
    }

    pub(super) fn cache(&self) -> SnapshotterResult<&Arc<CacheManager>> {
        self.cache_manager.as_ref().ok_or_else(|| {
            SnapshotterError::InvalidState("cache manager is disabled".to_string())
        })
    }

    /// The daemon serving `instance`.
    pub(super) fn daemon_of(&self, instance: &RafsInstance) -> SnapshotterResult<Arc<Daemon>> {
        let manager = self.get_manager(*instance.get_fs_driver())?;
        instance
            .get_daemon_id()
            .as_deref()
            .and_then(|id| manager.get_by_daemon_id(id))
            .ok_or_else(|| {
                SnapshotterError::NotFound(format!(
                    "daemon {:?} of snapshot {}",
                    instance.get_daemon_id(),
                    instance.get_snapshot_id()
                ))
            })
    }

    /// Describes a new daemon with the configured defaults.
    pub(super) fn new_daemon_states(
        &self,
        id: &str,
        fs_driver: FsDriver,
        daemon_mode: DaemonMode,
        mountpoint: Option<PathBuf>,
    ) -> DaemonStates {
        let settings = self.config.get_daemon();
        let threads = match fs_driver {
            FsDriver::Fscache => *settings.get_fscache_threads(),
            _ => *settings.get_threads_number(),
        };

        let builder = DaemonStates::builder()
            .id(id)
            .fs_driver(fs_driver)
            .daemon_mode(daemon_mode)
            .api_socket(self.config.socket_dir().join(id).join(API_SOCKET_FILENAME))
            .config_dir(self.config.config_dir().join(id))
            .log_dir(self.config.log_dir().join(id))
            .log_level(settings.get_log_level())
            .log_rotation_size(settings.get_log_rotation_size().unwrap_or_default())
            .log_to_stdout(*settings.get_log_to_stdout())
            .thread_num(threads.unwrap_or_default());

        match mountpoint {
            Some(mountpoint) => builder.mountpoint(mountpoint).build(),
            None => builder.build(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The id of the dedicated daemon of `snapshot_id`.
///
/// Derived from the snapshot id so that a second daemon for the same snapshot collides.
pub(super) fn dedicated_daemon_id(snapshot_id: &str) -> String {
    utils::fscache_id(snapshot_id)[..32].to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
