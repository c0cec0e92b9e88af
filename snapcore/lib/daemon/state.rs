use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::SnapshotterError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state a daemon reports through its control endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonState {
    /// Liveness has not been verified yet.
    #[default]
    Unknown,

    /// The process started but is not serving yet.
    Init,

    /// The process took over its resources and waits to be started.
    Ready,

    /// The process serves requests.
    Running,

    /// The process is gone.
    Died,

    /// The daemon was torn down on purpose.
    Destroyed,
}

/// Build information reported by a daemon binary.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTimeInfo {
    /// Package version.
    #[serde(default)]
    pub package_ver: String,

    /// Git commit the binary was built from.
    #[serde(default)]
    pub git_commit: String,

    /// Build timestamp.
    #[serde(default)]
    pub build_time: String,

    /// Build profile.
    #[serde(default)]
    pub profile: String,

    /// Compiler version.
    #[serde(default)]
    pub rustc: String,
}

/// Response body of the daemon info endpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Daemon id.
    #[serde(default)]
    pub id: String,

    /// Build information of the running binary.
    #[serde(default)]
    pub version: BuildTimeInfo,

    /// Current state.
    #[serde(default)]
    pub state: DaemonState,
}

/// Error body returned by the control endpoint.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    #[serde(default)]
    pub code: String,

    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

/// Body of a mount request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    /// Filesystem type, always `rafs`.
    pub fs_type: String,

    /// Bootstrap path.
    pub source: String,

    /// Serialized instance configuration.
    pub config: String,
}

/// Per-instance filesystem metrics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct FsMetrics {
    pub id: String,
    pub data_read: u64,
    pub block_count_read: Vec<u64>,
    pub fop_hits: Vec<u64>,
    pub fop_errors: Vec<u64>,
    pub nr_opens: u64,
}

/// Blob cache metrics of an instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct CacheMetrics {
    pub id: String,
    pub underlying_files: Vec<String>,
    pub store_path: String,
    pub partial_hits: u64,
    pub whole_hits: u64,
    pub total: u64,
    pub entries_count: u64,
    pub prefetch_data_amount: u64,
    pub buffered_backend_size: u64,
}

/// A request the daemon is still processing.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct InflightOp {
    pub inode: u64,
    pub opcode: u32,
    pub unique: u64,
    pub timestamp_secs: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonState {
    /// The name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Unknown => "UNKNOWN",
            DaemonState::Init => "INIT",
            DaemonState::Ready => "READY",
            DaemonState::Running => "RUNNING",
            DaemonState::Died => "DIED",
            DaemonState::Destroyed => "DESTROYED",
        }
    }
}

impl MountRequest {
    /// Creates a rafs mount request.
    pub fn new(source: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            fs_type: "rafs".to_string(),
            source: source.into(),
            config: config.into(),
        }
    }
}

impl BuildTimeInfo {
    /// Parses the output of `<daemon> --version`.
    ///
    /// Lines look like `Version:   v2.2.0` or `Git Commit: abcdef`.
    pub fn parse_version_output(output: &str) -> Self {
        let mut info = BuildTimeInfo::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "version" => info.package_ver = value,
                "git commit" => info.git_commit = value,
                "build time" => info.build_time = value,
                "profile" => info.profile = value,
                "rustc" => info.rustc = value,
                _ => {}
            }
        }

        info
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DaemonState {
    type Err = SnapshotterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(DaemonState::Unknown),
            "INIT" => Ok(DaemonState::Init),
            "READY" => Ok(DaemonState::Ready),
            "RUNNING" => Ok(DaemonState::Running),
            "DIED" => Ok(DaemonState::Died),
            "DESTROYED" => Ok(DaemonState::Destroyed),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "unknown daemon state {s}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_info_decodes_wire_format() {
        let info: DaemonInfo = serde_json::from_str(
            r#"{"id":"d1","version":{"package_ver":"v2.2.0","git_commit":"abc"},"state":"RUNNING"}"#,
        )
        .unwrap();

        assert_eq!(info.state, DaemonState::Running);
        assert_eq!(info.version.package_ver, "v2.2.0");
        assert_eq!(serde_json::to_string(&DaemonState::Init).unwrap(), r#""INIT""#);
    }

    #[test]
    fn test_parse_version_output() {
        let output = "Version: \tv2.2.4\nGit Commit: \t8f5d3c2\nBuild Time: \t2024-01-01\nProfile: \trelease\nRustc: \trustc 1.72.1\n";
        let info = BuildTimeInfo::parse_version_output(output);
        assert_eq!(info.package_ver, "v2.2.4");
        assert_eq!(info.git_commit, "8f5d3c2");
        assert_eq!(info.profile, "release");
        assert_eq!(info.rustc, "rustc 1.72.1");
    }
}
