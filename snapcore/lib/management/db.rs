use std::path::Path;

use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio::fs;

use crate::SnapshotterResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the snapshotter database
pub static SNAPSHOTTER_DB_MIGRATOR: Migrator =
    sqlx::migrate!("lib/management/migrations/snapshotter");

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> SnapshotterResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    if !db_path.exists() {
        fs::File::create(&db_path).await?;
    }

    let pool = get_db_pool(db_path).await?;
    migrator.run(&pool).await?;

    Ok(pool)
}

/// Creates a connection pool for the SQLite database at `db_path`, with at most 5 connections.
pub async fn get_db_pool(db_path: impl AsRef<Path>) -> SnapshotterResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    Ok(pool)
}

/// Gets a connection pool, creating the database and running migrations when needed.
///
/// ## Arguments
///
/// * `db_path` - Path to the SQLite database file
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn get_or_create_db_pool(
    db_path: impl AsRef<Path>,
    migrator: &Migrator,
) -> SnapshotterResult<Pool<Sqlite>> {
    init_db(&db_path, migrator).await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use sqlx::Row;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_init_snapshotter_db() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("state/snapshotter.db");

        init_db(&db_path, &SNAPSHOTTER_DB_MIGRATOR).await?;
        let pool = get_db_pool(&db_path).await?;

        let tables = sqlx::query("SELECT name FROM sqlite_master WHERE type='table'")
            .fetch_all(&pool)
            .await?;

        let table_names: Vec<String> = tables
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        assert!(
            table_names.contains(&"daemons".to_string()),
            "daemons table not found"
        );
        assert!(
            table_names.contains(&"instances".to_string()),
            "instances table not found"
        );

        // Running the migrations again is harmless.
        get_or_create_db_pool(&db_path, &SNAPSHOTTER_DB_MIGRATOR).await?;

        Ok(())
    }
}
