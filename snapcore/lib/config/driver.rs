//! Serving strategies, daemon modes and recovery policies.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::SnapshotterError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a snapshot's filesystem is served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsDriver {
    /// A FUSE daemon serves the filesystem.
    #[default]
    Fusedev,

    /// The kernel erofs-over-fscache path, backed by a shared daemon.
    Fscache,

    /// Loop-device backed erofs mounts built from tar layers, no daemon involved.
    Blockdev,

    /// No daemon. Snapshots are prepared elsewhere.
    Nodev,

    /// Mounts are delegated to an external proxy.
    Proxy,
}

/// How daemons are shared between snapshots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    /// One daemon per snapshot.
    #[default]
    Dedicated,

    /// One daemon serves every snapshot of its driver.
    Shared,

    /// No daemon is started.
    None,
}

/// What to do when a daemon process dies unexpectedly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverPolicy {
    /// Log the death and leave the mounts broken.
    None,

    /// Relaunch the daemon and mount its instances again.
    #[default]
    Restart,

    /// Relaunch the daemon and hand the saved session over through the supervisor.
    Failover,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsDriver {
    /// Every driver that a daemon manager can be created for.
    pub const ALL: [FsDriver; 5] = [
        FsDriver::Fusedev,
        FsDriver::Fscache,
        FsDriver::Blockdev,
        FsDriver::Nodev,
        FsDriver::Proxy,
    ];

    /// Whether snapshots served by this driver need a daemon process.
    pub fn is_daemon_backed(&self) -> bool {
        matches!(self, FsDriver::Fusedev | FsDriver::Fscache)
    }

    /// The wire name of the driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsDriver::Fusedev => "fusedev",
            FsDriver::Fscache => "fscache",
            FsDriver::Blockdev => "blockdev",
            FsDriver::Nodev => "nodev",
            FsDriver::Proxy => "proxy",
        }
    }
}

impl DaemonMode {
    /// The wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonMode::Dedicated => "dedicated",
            DaemonMode::Shared => "shared",
            DaemonMode::None => "none",
        }
    }
}

impl RecoverPolicy {
    /// The wire name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoverPolicy::None => "none",
            RecoverPolicy::Restart => "restart",
            RecoverPolicy::Failover => "failover",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for FsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsDriver {
    type Err = SnapshotterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fusedev" => Ok(FsDriver::Fusedev),
            "fscache" => Ok(FsDriver::Fscache),
            "blockdev" => Ok(FsDriver::Blockdev),
            "nodev" => Ok(FsDriver::Nodev),
            "proxy" => Ok(FsDriver::Proxy),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "unknown fs driver: {s}"
            ))),
        }
    }
}

impl fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DaemonMode {
    type Err = SnapshotterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedicated" | "multiple" => Ok(DaemonMode::Dedicated),
            "shared" => Ok(DaemonMode::Shared),
            "none" => Ok(DaemonMode::None),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "unknown daemon mode: {s}"
            ))),
        }
    }
}

impl fmt::Display for RecoverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoverPolicy {
    type Err = SnapshotterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RecoverPolicy::None),
            "restart" => Ok(RecoverPolicy::Restart),
            "failover" => Ok(RecoverPolicy::Failover),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "unknown recover policy: {s}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
