use std::path::{Path, PathBuf};

use crate::{SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The file name of a daemon's control socket.
pub const API_SOCKET_FILENAME: &str = "api.sock";

/// The file name of a daemon's configuration.
pub const DAEMON_CONFIG_FILENAME: &str = "config.json";

/// The file name of a daemon's own log.
pub const DAEMON_LOG_FILENAME: &str = "nydusd.log";

/// The file name of the supervisor socket of a daemon.
pub const SUPERVISOR_SOCKET_FILENAME: &str = "supervisor.sock";

/// The file name of the snapshotter database.
pub const SNAPSHOTTER_DB_FILENAME: &str = "snapshotter.db";

/// Sub directory of a snapshot holding the unpacked metadata.
pub const SNAPSHOT_FS_SUBDIR: &str = "fs";

/// Sub directory of a snapshot where its filesystem is mounted.
pub const SNAPSHOT_MNT_SUBDIR: &str = "mnt";

/// File name of the image-level bootstrap.
pub const IMAGE_BOOTSTRAP_FILENAME: &str = "image.boot";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Locates the bootstrap of a snapshot.
///
/// Bootstraps live at `<snapshot>/fs/image/image.boot`, older layouts used
/// `<snapshot>/fs/image.boot`.
pub fn find_bootstrap(snapshot_dir: impl AsRef<Path>) -> SnapshotterResult<PathBuf> {
    let fs_dir = snapshot_dir.as_ref().join(SNAPSHOT_FS_SUBDIR);
    let candidates = [
        fs_dir.join("image").join(IMAGE_BOOTSTRAP_FILENAME),
        fs_dir.join(IMAGE_BOOTSTRAP_FILENAME),
    ];

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| {
            SnapshotterError::NotFound(format!(
                "bootstrap of snapshot {}",
                snapshot_dir.as_ref().display()
            ))
        })
}

/// The socket path used for the `generation`th launch of a daemon.
///
/// Generation 0 is `api.sock`; hot upgrades use `api1.sock`, `api2.sock`, ...
pub fn api_socket_name(generation: u32) -> String {
    match generation {
        0 => API_SOCKET_FILENAME.to_string(),
        n => format!("api{n}.sock"),
    }
}

/// Returns the generation of an api socket path produced by [`api_socket_name`].
pub fn api_socket_generation(path: impl AsRef<Path>) -> Option<u32> {
    let name = path.as_ref().file_name()?.to_str()?;
    let middle = name.strip_prefix("api")?.strip_suffix(".sock")?;
    if middle.is_empty() {
        Some(0)
    } else {
        middle.parse().ok()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
