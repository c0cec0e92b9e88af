use std::{
    path::Path,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use sqlx::{sqlite::SqliteRow, FromRow, Pool, Row, Sqlite};

use crate::{
    config::FsDriver,
    daemon::{DaemonStates, RafsInstance},
    management::{get_or_create_db_pool, SNAPSHOTTER_DB_MIGRATOR},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Persistent daemon and instance records.
///
/// Records survive snapshotter restarts and are what recovery is driven from. Instances are
/// numbered with a monotonically increasing sequence so they can be replayed in mount order.
#[derive(Debug)]
pub struct Store {
    pool: Pool<Sqlite>,
    next_seq: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Opens the database at `db_path`, creating it if needed.
    pub async fn open(db_path: impl AsRef<Path>) -> SnapshotterResult<Self> {
        let pool = get_or_create_db_pool(db_path, &SNAPSHOTTER_DB_MIGRATOR).await?;
        Self::with_pool(pool).await
    }

    /// Wraps an already migrated pool.
    pub async fn with_pool(pool: Pool<Sqlite>) -> SnapshotterResult<Self> {
        let record = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM instances")
            .fetch_one(&pool)
            .await?;
        let seq = record.get::<i64, _>("seq");

        Ok(Self {
            pool,
            next_seq: AtomicU64::new(seq.max(0) as u64),
        })
    }

    /// Persists a new daemon record.
    pub async fn add_daemon(&self, states: &DaemonStates) -> SnapshotterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daemons (
                id, fs_driver, daemon_mode, pid,
                api_socket, config_dir, log_dir, mountpoint,
                supervisor_path, log_level, log_rotation_size, log_to_stdout,
                thread_num, fscache_work_dir, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(states.get_id())
        .bind(states.get_fs_driver().as_str())
        .bind(states.get_daemon_mode().as_str())
        .bind(states.get_pid().map(i64::from))
        .bind(states.get_api_socket().display().to_string())
        .bind(states.get_config_dir().display().to_string())
        .bind(states.get_log_dir().display().to_string())
        .bind(optional_path(states.get_mountpoint().as_deref()))
        .bind(optional_path(states.get_supervisor_path().as_deref()))
        .bind(states.get_log_level())
        .bind(states.get_log_rotation_size().map(|n| n as i64))
        .bind(*states.get_log_to_stdout())
        .bind(states.get_thread_num().map(i64::from))
        .bind(optional_path(states.get_fscache_work_dir().as_deref()))
        .bind(version_json(states)?)
        .execute(&self.pool)
        .await
        .map_err(|e| already_exists(e, format!("daemon {}", states.get_id())))?;

        Ok(())
    }

    /// Rewrites an existing daemon record.
    pub async fn update_daemon(&self, states: &DaemonStates) -> SnapshotterResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE daemons SET
                fs_driver = ?, daemon_mode = ?, pid = ?,
                api_socket = ?, config_dir = ?, log_dir = ?, mountpoint = ?,
                supervisor_path = ?, log_level = ?, log_rotation_size = ?, log_to_stdout = ?,
                thread_num = ?, fscache_work_dir = ?, version = ?,
                modified_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(states.get_fs_driver().as_str())
        .bind(states.get_daemon_mode().as_str())
        .bind(states.get_pid().map(i64::from))
        .bind(states.get_api_socket().display().to_string())
        .bind(states.get_config_dir().display().to_string())
        .bind(states.get_log_dir().display().to_string())
        .bind(optional_path(states.get_mountpoint().as_deref()))
        .bind(optional_path(states.get_supervisor_path().as_deref()))
        .bind(states.get_log_level())
        .bind(states.get_log_rotation_size().map(|n| n as i64))
        .bind(*states.get_log_to_stdout())
        .bind(states.get_thread_num().map(i64::from))
        .bind(optional_path(states.get_fscache_work_dir().as_deref()))
        .bind(version_json(states)?)
        .bind(states.get_id())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SnapshotterError::NotFound(format!(
                "daemon {}",
                states.get_id()
            )));
        }

        Ok(())
    }

    /// Deletes a daemon record. Deleting a missing record is not an error.
    pub async fn delete_daemon(&self, daemon_id: &str) -> SnapshotterResult<()> {
        sqlx::query("DELETE FROM daemons WHERE id = ?")
            .bind(daemon_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Returns the daemon records of `fs_driver`, oldest first.
    pub async fn walk_daemons(&self, fs_driver: FsDriver) -> SnapshotterResult<Vec<DaemonStates>> {
        let records = sqlx::query(
            r#"
            SELECT * FROM daemons
            WHERE fs_driver = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(fs_driver.as_str())
        .fetch_all(&self.pool)
        .await?;

        records
            .iter()
            .map(|row| DaemonStates::from_row(row).map_err(SnapshotterError::from))
            .collect()
    }

    /// Persists an instance, assigning it the next sequence number.
    pub async fn add_instance(&self, instance: &mut RafsInstance) -> SnapshotterResult<()> {
        instance.set_seq(self.next_instance_seq());

        sqlx::query(
            r#"
            INSERT INTO instances (
                snapshot_id, seq, image_id, daemon_id,
                fs_driver, snapshot_dir, mountpoint, annotations_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(instance.get_snapshot_id())
        .bind(*instance.get_seq() as i64)
        .bind(instance.get_image_id())
        .bind(instance.get_daemon_id().as_deref())
        .bind(instance.get_fs_driver().as_str())
        .bind(instance.get_snapshot_dir().display().to_string())
        .bind(instance.get_mountpoint().display().to_string())
        .bind(serde_json::to_string(instance.get_annotations())?)
        .execute(&self.pool)
        .await
        .map_err(|e| already_exists(e, format!("instance {}", instance.get_snapshot_id())))?;

        Ok(())
    }

    /// Deletes an instance record. Deleting a missing record is not an error.
    pub async fn delete_instance(&self, snapshot_id: &str) -> SnapshotterResult<()> {
        sqlx::query("DELETE FROM instances WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Returns every instance record ordered by sequence number.
    pub async fn walk_instances(&self) -> SnapshotterResult<Vec<RafsInstance>> {
        let records = sqlx::query("SELECT * FROM instances ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        records
            .iter()
            .map(|row| RafsInstance::from_row(row).map_err(SnapshotterError::from))
            .collect()
    }

    /// Hands out the next instance sequence number.
    pub fn next_instance_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decodes a text column through [`FromStr`].
pub(crate) fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = SnapshotterError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: SnapshotterError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

/// Decodes an optional JSON text column.
pub(crate) fn parse_json_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
}

fn optional_path(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.display().to_string())
}

fn version_json(states: &DaemonStates) -> SnapshotterResult<Option<String>> {
    Ok(states
        .get_version()
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

fn already_exists(error: sqlx::Error, what: String) -> SnapshotterError {
    match &error {
        sqlx::Error::Database(e) if e.is_unique_violation() => SnapshotterError::AlreadyExists(what),
        _ => error.into(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{config::DaemonMode, daemon::BuildTimeInfo};

    use super::*;

    fn daemon(id: &str, driver: FsDriver) -> DaemonStates {
        DaemonStates::builder()
            .id(id)
            .fs_driver(driver)
            .daemon_mode(DaemonMode::Shared)
            .api_socket(format!("/run/snap/{id}/api.sock"))
            .config_dir(format!("/etc/snap/{id}"))
            .log_dir(format!("/var/log/snap/{id}"))
            .mountpoint("/mnt/snap")
            .log_rotation_size(100)
            .build()
    }

    fn instance(sid: &str) -> RafsInstance {
        let mut instance = RafsInstance::builder()
            .image_id("example.com/app:v1")
            .daemon_id("d1")
            .fs_driver(FsDriver::Fusedev)
            .snapshot_id(sid)
            .snapshot_dir(format!("/snapshots/{sid}"))
            .mountpoint(format!("/mnt/snap/{sid}"))
            .build();
        instance.add_annotation("k", "v");
        instance
    }

    #[tokio::test]
    async fn test_daemon_records() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("snapshotter.db")).await?;

        let mut states = daemon("d1", FsDriver::Fusedev);
        store.add_daemon(&states).await?;
        store.add_daemon(&daemon("d2", FsDriver::Fscache)).await?;
        assert!(store.add_daemon(&states).await.unwrap_err().is_already_exists());

        states.set_pid(Some(42));
        states.set_version(BuildTimeInfo {
            package_ver: "v2.2.0".into(),
            ..Default::default()
        });
        store.update_daemon(&states).await?;

        let fusedev = store.walk_daemons(FsDriver::Fusedev).await?;
        assert_eq!(fusedev, vec![states.clone()]);

        store.delete_daemon("d1").await?;
        store.delete_daemon("d1").await?;
        assert!(store.walk_daemons(FsDriver::Fusedev).await?.is_empty());
        assert!(store.update_daemon(&states).await.unwrap_err().is_not_found());

        Ok(())
    }

    #[tokio::test]
    async fn test_instances_replay_in_sequence() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("snapshotter.db");

        {
            let store = Store::open(&db_path).await?;
            for sid in ["c", "a", "b"] {
                store.add_instance(&mut instance(sid)).await?;
            }
            store.delete_instance("a").await?;
        }

        let store = Store::open(&db_path).await?;
        let order: Vec<_> = store
            .walk_instances()
            .await?
            .into_iter()
            .map(|i| (i.get_snapshot_id().clone(), *i.get_seq()))
            .collect();
        assert_eq!(order, vec![("c".to_string(), 1), ("b".to_string(), 3)]);

        let mut next = instance("d");
        store.add_instance(&mut next).await?;
        assert_eq!(*next.get_seq(), 4);

        let restored = store.walk_instances().await?;
        assert_eq!(restored[2].annotation("k"), Some("v"));

        Ok(())
    }
}
