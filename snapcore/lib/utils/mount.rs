//! Kernel mount helpers.

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::SnapshotterResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filesystem type used for block-mode and fscache mounts.
pub const EROFS_FS_TYPE: &str = "erofs";

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether `path` is a mountpoint according to `/proc/self/mountinfo`.
pub fn is_mounted(path: impl AsRef<Path>) -> bool {
    let Ok(mountinfo) = std::fs::read_to_string(MOUNTINFO_PATH) else {
        return false;
    };

    let target = path.as_ref();
    let found = mount_points(&mountinfo).any(|mp| mp == target);
    found
}

/// Mounts a read-only erofs filesystem.
///
/// ## Arguments
///
/// * `source` - The device or `none` for fscache mounts
/// * `target` - The mountpoint, created if missing
/// * `options` - Comma separated mount data such as `device=/dev/loop1`
pub fn mount_erofs(source: &str, target: impl AsRef<Path>, options: &str) -> SnapshotterResult<()> {
    let target = target.as_ref();
    std::fs::create_dir_all(target)?;

    mount(
        Some(source),
        target,
        Some(EROFS_FS_TYPE),
        MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        Some(options),
    )?;

    tracing::info!(source = source, target = %target.display(), options = options, "mounted erofs");
    Ok(())
}

/// Unmounts `target`. A path that is not mounted is not an error.
pub fn umount(target: impl AsRef<Path>, lazy: bool) -> SnapshotterResult<()> {
    let target = target.as_ref();
    let flags = if lazy {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };

    match umount2(target, flags) {
        Ok(()) => {
            tracing::info!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    // Field 5 is the mountpoint, with spaces and other specials octal-escaped.
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|mp| PathBuf::from(unescape_octal(mp)))
}

fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
