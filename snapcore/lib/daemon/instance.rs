use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use typed_builder::TypedBuilder;

use crate::{
    config::FsDriver,
    management::{parse_column, parse_json_column},
    utils::{self, SNAPSHOT_FS_SUBDIR, SNAPSHOT_MNT_SUBDIR},
    SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Annotation holding the fscache domain an instance's blobs are bound to.
pub const ANNOTATION_FSCACHE_DOMAIN_ID: &str = "fscache.domainid";

/// Annotation holding the fscache id of an instance.
pub const ANNOTATION_FSCACHE_ID: &str = "fscache.id";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The mount of one snapshot, served by a daemon or by a kernel mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct RafsInstance {
    /// Persistence order, assigned when the instance is stored.
    #[builder(default)]
    seq: u64,

    /// The image reference the snapshot belongs to.
    #[builder(setter(into))]
    image_id: String,

    /// The serving daemon, if the driver uses one.
    #[builder(default, setter(strip_option, into))]
    daemon_id: Option<String>,

    /// The driver serving the mount.
    fs_driver: FsDriver,

    /// The snapshot id given by the container runtime.
    #[builder(setter(into))]
    snapshot_id: String,

    /// The snapshot's directory.
    #[builder(setter(into))]
    snapshot_dir: PathBuf,

    /// Where the filesystem is visible on the host.
    #[builder(default, setter(into))]
    mountpoint: PathBuf,

    /// Free-form annotations such as block-mode device info.
    #[builder(default)]
    annotations: HashMap<String, String>,
}

/// The process-wide table of mounted instances, keyed by snapshot id.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<String, Arc<RafsInstance>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RafsInstance {
    /// Directory holding the fscache bitmaps and the unpacked metadata.
    pub fn fscache_work_dir(&self) -> PathBuf {
        self.snapshot_dir.join(SNAPSHOT_FS_SUBDIR)
    }

    /// The default kernel mountpoint inside the snapshot directory.
    pub fn snapshot_mountpoint(&self) -> PathBuf {
        self.snapshot_dir.join(SNAPSHOT_MNT_SUBDIR)
    }

    /// The path of this instance inside a shared FUSE filesystem.
    ///
    /// The daemon API requires an absolute path, so this is `/<snapshot_id>`.
    pub fn relative_mountpoint(&self) -> String {
        format!("/{}", self.snapshot_id)
    }

    /// Locates the instance's bootstrap.
    pub fn bootstrap_file(&self) -> SnapshotterResult<PathBuf> {
        utils::find_bootstrap(&self.snapshot_dir)
    }

    /// Sets where the filesystem is visible on the host.
    pub fn set_mountpoint(&mut self, mountpoint: impl AsRef<Path>) {
        self.mountpoint = mountpoint.as_ref().to_path_buf();
    }

    /// Sets the persistence order.
    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Sets the serving daemon.
    pub fn set_daemon_id(&mut self, daemon_id: impl Into<String>) {
        self.daemon_id = Some(daemon_id.into());
    }

    /// Adds an annotation.
    pub fn add_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Returns an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

impl InstanceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance, replacing any previous one for the same snapshot.
    pub fn add(&self, instance: RafsInstance) -> Arc<RafsInstance> {
        let instance = Arc::new(instance);
        self.write()
            .insert(instance.snapshot_id.clone(), instance.clone());
        instance
    }

    /// Removes and returns the instance of `snapshot_id`.
    pub fn remove(&self, snapshot_id: &str) -> Option<Arc<RafsInstance>> {
        self.write().remove(snapshot_id)
    }

    /// Returns the instance of `snapshot_id`.
    pub fn get(&self, snapshot_id: &str) -> Option<Arc<RafsInstance>> {
        self.read().get(snapshot_id).cloned()
    }

    /// Returns `true` if `snapshot_id` has an instance.
    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.read().contains_key(snapshot_id)
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// A snapshot of all instances, ordered by sequence number.
    pub fn list(&self) -> Vec<Arc<RafsInstance>> {
        let mut instances: Vec<_> = self.read().values().cloned().collect();
        instances.sort_by_key(|i| i.seq);
        instances
    }

    /// Instances served by `daemon_id`.
    pub fn list_by_daemon(&self, daemon_id: &str) -> Vec<Arc<RafsInstance>> {
        self.list()
            .into_iter()
            .filter(|i| i.daemon_id.as_deref() == Some(daemon_id))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RafsInstance>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<RafsInstance>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<'r> FromRow<'r, SqliteRow> for RafsInstance {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            seq: row.try_get::<i64, _>("seq")? as u64,
            image_id: row.try_get("image_id")?,
            daemon_id: row.try_get("daemon_id")?,
            fs_driver: parse_column(row, "fs_driver")?,
            snapshot_id: row.try_get("snapshot_id")?,
            snapshot_dir: row.try_get::<String, _>("snapshot_dir")?.into(),
            mountpoint: row.try_get::<String, _>("mountpoint")?.into(),
            annotations: parse_json_column(row, "annotations_json")?.unwrap_or_default(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
