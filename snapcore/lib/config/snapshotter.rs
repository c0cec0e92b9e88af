//! Snapshotter configuration types and helpers.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{
        DaemonMode, FsDriver, RecoverPolicy, DEFAULT_DAEMON_CONFIG_PATH, DEFAULT_GC_PERIOD,
        DEFAULT_LOG_LEVEL, DEFAULT_NYDUSD_PATH, DEFAULT_NYDUS_IMAGE_PATH, DEFAULT_ROOT_DIR,
    },
    utils::SNAPSHOTTER_DB_FILENAME,
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The snapshotter configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct SnapshotterConfig {
    /// The state root. Every other default path lives below it.
    #[builder(default = PathBuf::from(DEFAULT_ROOT_DIR), setter(into))]
    root: PathBuf,

    /// Daemon settings.
    #[builder(default)]
    daemon: DaemonSettings,

    /// Blob cache settings.
    #[builder(default)]
    cache_manager: CacheManagerSettings,

    /// Experimental features.
    #[builder(default)]
    experimental: ExperimentalSettings,

    /// Image validation settings.
    #[builder(default)]
    image: ImageSettings,
}

/// How daemons are launched and configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct DaemonSettings {
    /// The daemon binary.
    #[builder(default = PathBuf::from(DEFAULT_NYDUSD_PATH), setter(into))]
    nydusd_path: PathBuf,

    /// The conversion tool binary used by the block-mode manager.
    #[builder(default = PathBuf::from(DEFAULT_NYDUS_IMAGE_PATH), setter(into))]
    nydusimage_path: PathBuf,

    /// The JSON daemon configuration template.
    #[builder(default = PathBuf::from(DEFAULT_DAEMON_CONFIG_PATH), setter(into))]
    config_path: PathBuf,

    /// The filesystem driver.
    #[builder(default)]
    fs_driver: FsDriver,

    /// Whether snapshots get a dedicated daemon or share one.
    #[builder(default)]
    daemon_mode: DaemonMode,

    /// What to do when a daemon dies unexpectedly.
    #[builder(default)]
    recover_policy: RecoverPolicy,

    /// Log level passed to daemons.
    #[builder(default = DEFAULT_LOG_LEVEL.to_string(), setter(into))]
    log_level: String,

    /// Whether daemons write their logs to the snapshotter's stdout.
    #[builder(default)]
    log_to_stdout: bool,

    /// Size in MiB at which a daemon rotates its log file.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    log_rotation_size: Option<u64>,

    /// Worker threads of a fusedev daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    threads_number: Option<u32>,

    /// Worker threads of an fscache daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    fscache_threads: Option<u32>,
}

/// Blob cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct CacheManagerSettings {
    /// Disables the cache manager entirely.
    #[builder(default)]
    disable: bool,

    /// The blob cache directory. Defaults to `<root>/cache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    cache_dir: Option<PathBuf>,

    /// Garbage collection interval, as a duration string such as `24h` or `90m`.
    #[builder(default = DEFAULT_GC_PERIOD.to_string(), setter(into))]
    gc_period: String,
}

/// Experimental features.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ExperimentalSettings {
    /// Block-mode settings.
    #[builder(default)]
    tarfs: TarfsSettings,
}

/// Block-mode (tarfs) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct TarfsSettings {
    /// Enables block-mode conversion of OCI layers.
    #[builder(default)]
    enable_tarfs: bool,

    /// Mounts the merged image with erofs on the host. Otherwise the bootstrap
    /// directory is handed to the runtime.
    #[builder(default)]
    mount_tarfs_on_host: bool,

    /// Only converts images whose manifest carries the tarfs hint annotation.
    #[builder(default)]
    tarfs_hint: bool,

    /// Maximum simultaneous conversions per image reference. `0` means unbounded.
    #[builder(default)]
    max_concurrent_proc: usize,

    /// Which block images to export after conversion.
    #[builder(default)]
    export_mode: ExportMode,
}

/// Image validation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ImageSettings {
    /// Public key used to verify image signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    public_key_file: Option<PathBuf>,

    /// Requires bootstrap validation before exposing a mount.
    #[builder(default)]
    validate_signature: bool,
}

/// Which block disk images are exported for tarfs snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Nothing is exported.
    #[default]
    #[serde(alias = "")]
    None,

    /// Per-layer dm-verity data only.
    LayerVerityOnly,

    /// Whole-image dm-verity data only.
    ImageVerityOnly,

    /// Per-layer block disks.
    LayerBlock,

    /// A whole-image block disk.
    ImageBlock,

    /// Per-layer block disks with dm-verity data.
    LayerBlockWithVerity,

    /// A whole-image block disk with dm-verity data.
    ImageBlockWithVerity,
}

/// Which block images an [`ExportMode`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFlags {
    /// Export covers the merged image rather than single layers.
    pub whole_image: bool,

    /// A block disk is written.
    pub export_disk: bool,

    /// dm-verity data is generated.
    pub with_verity: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotterConfig {
    /// Loads and validates a TOML configuration file.
    pub async fn load(path: impl AsRef<Path>) -> SnapshotterResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML configuration without validating it.
    pub fn from_toml_str(raw: &str) -> SnapshotterResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Checks the configuration for inconsistent settings, reporting every problem found.
    pub fn validate(&self) -> SnapshotterResult<()> {
        let mut errors = Vec::new();

        if self.root.as_os_str().is_empty() {
            errors.push("root directory must not be empty".to_string());
        } else if !self.root.is_absolute() {
            errors.push(format!(
                "root directory {} must be absolute",
                self.root.display()
            ));
        }

        if let Err(e) = parse_duration(&self.cache_manager.gc_period) {
            errors.push(e.to_string());
        }

        if self.image.validate_signature {
            match &self.image.public_key_file {
                None => errors.push(
                    "a public key file is required for signature validation".to_string(),
                ),
                Some(path) if !path.exists() => errors.push(format!(
                    "public key file {} does not exist",
                    path.display()
                )),
                Some(_) => {}
            }
        }

        if self.daemon.threads_number == Some(0) {
            errors.push("threads_number must be greater than zero".to_string());
        }

        if self.daemon.fs_driver == FsDriver::Proxy && self.experimental.tarfs.enable_tarfs {
            errors.push("tarfs cannot be enabled with the proxy driver".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SnapshotterError::ConfigValidation(errors))
        }
    }

    /// Resolves the daemon and conversion tool binaries through `PATH`.
    ///
    /// Nothing is resolved when no daemon is used.
    pub fn resolve_binaries(&mut self) -> SnapshotterResult<()> {
        if self.daemon.daemon_mode == DaemonMode::None {
            return Ok(());
        }

        self.daemon.nydusd_path = resolve_binary(&self.daemon.nydusd_path)?;
        if self.experimental.tarfs.enable_tarfs {
            self.daemon.nydusimage_path = resolve_binary(&self.daemon.nydusimage_path)?;
        }

        Ok(())
    }

    /// The daemon mode actually in effect. The fscache driver only works with a shared daemon.
    pub fn effective_daemon_mode(&self) -> DaemonMode {
        match (self.daemon.fs_driver, self.daemon.daemon_mode) {
            (FsDriver::Fscache, mode) if mode != DaemonMode::Shared => {
                tracing::info!(
                    daemon_mode = %mode,
                    "fscache driver only supports shared mode, overriding daemon mode"
                );
                DaemonMode::Shared
            }
            (FsDriver::Nodev | FsDriver::Proxy, _) => DaemonMode::None,
            (_, mode) => mode,
        }
    }

    /// The blob cache garbage collection interval.
    pub fn gc_period(&self) -> SnapshotterResult<Duration> {
        parse_duration(&self.cache_manager.gc_period)
    }

    /// Directory holding per-snapshot state.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory holding daemon api sockets.
    pub fn socket_dir(&self) -> PathBuf {
        self.root.join("socket")
    }

    /// Directory holding per-daemon configuration files.
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Directory holding daemon logs.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Root mountpoint of a shared fusedev daemon.
    pub fn root_mountpoint(&self) -> PathBuf {
        self.root.join("mnt")
    }

    /// The blob cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_manager
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.root.join("cache"))
    }

    /// The persisted state database.
    pub fn database_path(&self) -> PathBuf {
        self.root.join(SNAPSHOTTER_DB_FILENAME)
    }
}

impl ExportMode {
    /// Breaks the mode down into what needs to be exported.
    pub fn flags(&self) -> ExportFlags {
        let (whole_image, export_disk, with_verity) = match self {
            ExportMode::None => (false, false, false),
            ExportMode::LayerVerityOnly => (false, false, true),
            ExportMode::ImageVerityOnly => (true, false, true),
            ExportMode::LayerBlock => (false, true, false),
            ExportMode::ImageBlock => (true, true, false),
            ExportMode::LayerBlockWithVerity => (false, true, true),
            ExportMode::ImageBlockWithVerity => (true, true, true),
        };

        ExportFlags {
            whole_image,
            export_disk,
            with_verity,
        }
    }

    /// The configuration name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportMode::None => "none",
            ExportMode::LayerVerityOnly => "layer_verity_only",
            ExportMode::ImageVerityOnly => "image_verity_only",
            ExportMode::LayerBlock => "layer_block",
            ExportMode::ImageBlock => "image_block",
            ExportMode::LayerBlockWithVerity => "layer_block_with_verity",
            ExportMode::ImageBlockWithVerity => "image_block_with_verity",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses durations such as `24h`, `90m`, `30s` or `1h30m`.
pub fn parse_duration(value: &str) -> SnapshotterResult<Duration> {
    let invalid = || SnapshotterError::InvalidArgument(format!("invalid duration '{value}'"));

    let value = value.trim();
    if value.is_empty() {
        return Err(invalid());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let amount: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        total = total
            .checked_add(amount.checked_mul(unit).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

fn resolve_binary(path: &Path) -> SnapshotterResult<PathBuf> {
    which::which(path).map_err(|e| {
        SnapshotterError::NotFound(format!("binary {}: {e}", path.display()))
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for CacheManagerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportMode {
    type Err = SnapshotterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(ExportMode::None),
            "layer_verity_only" => Ok(ExportMode::LayerVerityOnly),
            "image_verity_only" => Ok(ExportMode::ImageVerityOnly),
            "layer_block" => Ok(ExportMode::LayerBlock),
            "image_block" => Ok(ExportMode::ImageBlock),
            "layer_block_with_verity" => Ok(ExportMode::LayerBlockWithVerity),
            "image_block_with_verity" => Ok(ExportMode::ImageBlockWithVerity),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "invalid tarfs export mode {s}"
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
    fn test_config_defaults_and_derived_paths() {
        let config = SnapshotterConfig::from_toml_str("").unwrap();
        assert_eq!(config.get_root(), &PathBuf::from(DEFAULT_ROOT_DIR));
        assert_eq!(config.get_daemon().get_fs_driver(), &FsDriver::Fusedev);
        assert_eq!(config.get_daemon().get_log_level(), DEFAULT_LOG_LEVEL);
        assert_eq!(config.gc_period().unwrap(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(
            config.snapshots_dir(),
            PathBuf::from("/var/lib/containerd-nydus/snapshots")
        );
        assert_eq!(
            config.cache_dir(),
            PathBuf::from("/var/lib/containerd-nydus/cache")
        );
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/containerd-nydus/snapshotter.db")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_config_parses_sections() {
        let config = SnapshotterConfig::from_toml_str(
            r#"
            root = "/srv/snap"

            [daemon]
            fs_driver = "fscache"
            daemon_mode = "dedicated"
            recover_policy = "failover"
            threads_number = 4

            [cache_manager]
            cache_dir = "/srv/cache"
            gc_period = "1h30m"

            [experimental.tarfs]
            enable_tarfs = true
            max_concurrent_proc = 2
            export_mode = "image_block_with_verity"
            "#,
        )
        .unwrap();

        assert_eq!(config.get_daemon().get_recover_policy(), &RecoverPolicy::Failover);
        assert_eq!(config.effective_daemon_mode(), DaemonMode::Shared);
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/cache"));
        assert_eq!(config.gc_period().unwrap(), Duration::from_secs(5400));

        let tarfs = config.get_experimental().get_tarfs();
        assert!(*tarfs.get_enable_tarfs());
        assert_eq!(*tarfs.get_max_concurrent_proc(), 2);
        assert_eq!(
            tarfs.get_export_mode().flags(),
            ExportFlags {
                whole_image: true,
                export_disk: true,
                with_verity: true,
            }
        );
    }

    #[test]
    fn test_config_validation_collects_errors() {
        let config = SnapshotterConfig::builder()
            .root("relative/root")
            .cache_manager(CacheManagerSettings::builder().gc_period("soon").build())
            .image(ImageSettings::builder().validate_signature(true).build())
            .build();

        match config.validate() {
            Err(SnapshotterError::ConfigValidation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected validation result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("3d").is_err());
    }
}
