//! Daemon configuration templates and per-instance supplementing.
//!
//! A daemon configuration is loaded once per driver as a template. Every mount works on its
//! own clone of that template, fills in the image-specific backend, cache and credential
//! fields, and writes the result next to the daemon.

use std::{
    collections::HashMap,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{config::FsDriver, utils, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Backend type that fetches blobs from an OCI registry.
pub const BACKEND_TYPE_REGISTRY: &str = "registry";

/// Backend type that reads blobs from a local directory.
pub const BACKEND_TYPE_LOCALFS: &str = "localfs";

/// Backend type that reads blobs from an object store.
pub const BACKEND_TYPE_OSS: &str = "oss";

/// Backend type that reads blobs from S3.
pub const BACKEND_TYPE_S3: &str = "s3";

/// Configuration keys that carry credentials and must never be logged.
const SECRET_KEYS: [&str; 4] = [
    "auth",
    "registry_token",
    "access_key_id",
    "access_key_secret",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A daemon configuration for one of the daemon-backed drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaemonConfig {
    /// Configuration consumed by a FUSE daemon.
    Fuse(FuseDaemonConfig),

    /// Configuration consumed by a fscache daemon when binding a blob.
    Fscache(FscacheDaemonConfig),
}

/// FUSE daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuseDaemonConfig {
    /// Backend and cache of the mounted image.
    pub device: DeviceConfig,

    /// Metadata mode, usually `direct`.
    #[serde(default)]
    pub mode: String,

    /// Whether chunk digests are validated on read.
    #[serde(default)]
    pub digest_validate: bool,

    /// Whether per-file IO statistics are collected.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub iostats_files: bool,

    /// Whether extended attributes are served.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_xattr: bool,

    /// Filesystem level prefetch.
    #[serde(default)]
    pub fs_prefetch: FsPrefetchConfig,

    /// Fields this crate does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The backend and cache sections of a FUSE configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Where blobs are fetched from.
    pub backend: BackendSection,

    /// Where fetched chunks are cached.
    pub cache: CacheSection,
}

/// Typed backend section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSection {
    /// Backend type, see the `BACKEND_TYPE_*` constants.
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Backend specific settings.
    pub config: BackendConfig,
}

/// Typed cache section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Cache type, e.g. `blobcache`.
    #[serde(rename = "type", default)]
    pub cache_type: String,

    /// Whether cached data stays compressed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,

    /// Cache settings.
    #[serde(default)]
    pub config: CacheConfig,
}

/// Cache settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding cached blob data.
    #[serde(default)]
    pub work_dir: String,

    /// Disables the indexed chunk map.
    #[serde(default)]
    pub disable_indexed_map: bool,
}

/// Settings of a storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Local directory for the `localfs` backend.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,

    /// Registry host.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// Registry repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Base64 encoded `user:password`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,

    /// Registry bearer token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_token: String,

    /// `http` or `https`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,

    /// Skips TLS verification.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_verify: bool,

    /// Object store endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Object store access key id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,

    /// Object store access key secret.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_secret: String,

    /// Object store bucket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_name: String,

    /// Object store key prefix.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_prefix: String,

    /// Registry mirrors tried before the registry itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<MirrorConfig>,

    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,

    /// Connect timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u32>,

    /// Number of retries for a failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,

    /// Fields this crate does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A registry mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Mirror host, including the scheme.
    pub host: String,

    /// Extra request headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Seconds between health checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u32>,

    /// Failures before the mirror is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_limit: Option<u8>,
}

/// Filesystem level prefetch settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsPrefetchConfig {
    /// Whether prefetch is enabled.
    #[serde(default)]
    pub enable: bool,

    /// Whether every file is prefetched.
    #[serde(default)]
    pub prefetch_all: bool,

    /// Number of prefetch threads.
    #[serde(default)]
    pub threads_count: u32,

    /// Request merging size in bytes.
    #[serde(default)]
    pub merging_size: u64,

    /// Bandwidth limit in bytes per second.
    #[serde(default)]
    pub bandwidth_rate: u64,
}

/// Fscache daemon configuration, sent with every blob bind request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FscacheDaemonConfig {
    /// Configuration type, `bootstrap` for image metadata.
    #[serde(rename = "type")]
    pub config_type: String,

    /// Fscache id of the image.
    #[serde(default)]
    pub id: String,

    /// Fscache domain. Snapshots in the same domain share cached blobs.
    #[serde(default)]
    pub domain_id: String,

    /// Backend, cache and metadata of the image.
    pub config: FscacheInstanceConfig,
}

/// The instance section of a fscache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FscacheInstanceConfig {
    /// Fscache id of the image.
    #[serde(default)]
    pub id: String,

    /// Backend type, see the `BACKEND_TYPE_*` constants.
    pub backend_type: String,

    /// Backend settings.
    pub backend_config: BackendConfig,

    /// Cache type, `fscache`.
    #[serde(default)]
    pub cache_type: String,

    /// Cache settings.
    #[serde(default)]
    pub cache_config: CacheConfig,

    /// Path of the image bootstrap.
    #[serde(default)]
    pub metadata_path: String,

    /// Fields this crate does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image-specific values merged into a cloned template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupplementParams {
    /// Registry host serving the image.
    pub host: Option<String>,

    /// Repository of the image.
    pub repo: Option<String>,

    /// The snapshot being mounted.
    pub snapshot_id: String,

    /// Blob cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Work directory of the snapshot.
    pub work_dir: Option<PathBuf>,

    /// Image bootstrap.
    pub bootstrap: Option<PathBuf>,
}

/// Registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The user name. Empty for token based authentication.
    pub username: String,

    /// The password or token.
    pub secret: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonConfig {
    /// Loads the template for `driver` from a JSON file.
    pub fn load(driver: FsDriver, path: impl AsRef<Path>) -> SnapshotterResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        Self::from_slice(driver, &raw).map_err(|e| {
            SnapshotterError::InvalidArgument(format!(
                "invalid {driver} daemon configuration {}: {e}",
                path.display()
            ))
        })
    }

    /// Parses a template for `driver`.
    pub fn from_slice(driver: FsDriver, raw: &[u8]) -> SnapshotterResult<Self> {
        match driver {
            FsDriver::Fusedev => Ok(DaemonConfig::Fuse(serde_json::from_slice(raw)?)),
            FsDriver::Fscache => Ok(DaemonConfig::Fscache(serde_json::from_slice(raw)?)),
            _ => Err(SnapshotterError::InvalidArgument(format!(
                "fs driver {driver} has no daemon configuration"
            ))),
        }
    }

    /// The driver this configuration belongs to.
    pub fn fs_driver(&self) -> FsDriver {
        match self {
            DaemonConfig::Fuse(_) => FsDriver::Fusedev,
            DaemonConfig::Fscache(_) => FsDriver::Fscache,
        }
    }

    /// The backend type and its settings.
    pub fn storage_backend(&self) -> (&str, &BackendConfig) {
        match self {
            DaemonConfig::Fuse(c) => (&c.device.backend.backend_type, &c.device.backend.config),
            DaemonConfig::Fscache(c) => (&c.config.backend_type, &c.config.backend_config),
        }
    }

    fn backend_mut(&mut self) -> &mut BackendConfig {
        match self {
            DaemonConfig::Fuse(c) => &mut c.device.backend.config,
            DaemonConfig::Fscache(c) => &mut c.config.backend_config,
        }
    }

    /// Fills in the image-specific fields.
    ///
    /// Registry location is only applied to registry backends. Fscache configurations also get
    /// an id and domain derived from the snapshot id.
    pub fn supplement(&mut self, params: &SupplementParams) -> SnapshotterResult<()> {
        let backend_type = self.storage_backend().0.to_string();
        match backend_type.as_str() {
            BACKEND_TYPE_REGISTRY => {
                let backend = self.backend_mut();
                if let Some(host) = params.host.as_ref().filter(|h| !h.is_empty()) {
                    backend.host = host.clone();
                }
                if let Some(repo) = params.repo.as_ref().filter(|r| !r.is_empty()) {
                    backend.repo = repo.clone();
                }
            }
            BACKEND_TYPE_LOCALFS | BACKEND_TYPE_OSS | BACKEND_TYPE_S3 => {}
            other => {
                return Err(SnapshotterError::InvalidArgument(format!(
                    "unknown backend type {other}"
                )))
            }
        }

        match self {
            DaemonConfig::Fuse(c) => {
                if let Some(cache_dir) = &params.cache_dir {
                    c.device.cache.config.work_dir = cache_dir.display().to_string();
                }
            }
            DaemonConfig::Fscache(c) => {
                let fscache_id = utils::fscache_id(&params.snapshot_id);
                c.id = fscache_id.clone();
                if c.domain_id.is_empty() {
                    c.domain_id = fscache_id.clone();
                } else {
                    tracing::warn!(domain_id = %c.domain_id, "shared fscache domain in use, requires kernel 6.1 or newer");
                }
                c.config.id = fscache_id;
                if let Some(work_dir) = &params.work_dir {
                    c.config.cache_config.work_dir = work_dir.display().to_string();
                }
                if let Some(bootstrap) = &params.bootstrap {
                    c.config.metadata_path = bootstrap.display().to_string();
                }
            }
        }

        Ok(())
    }

    /// Applies registry credentials. Token-only credentials go to `registry_token`.
    pub fn fill_auth(&mut self, credentials: Option<&Credentials>) {
        let Some(credentials) = credentials else {
            return;
        };

        let backend = self.backend_mut();
        if credentials.username.is_empty() {
            backend.registry_token = credentials.secret.clone();
        } else {
            backend.auth = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", credentials.username, credentials.secret));
        }
    }

    /// Replaces the mirror list, unless `mirrors` is empty.
    pub fn update_mirrors(&mut self, mirrors: Vec<MirrorConfig>) {
        if !mirrors.is_empty() {
            self.backend_mut().mirrors = mirrors;
        }
    }

    /// Serializes the configuration.
    pub fn dump_string(&self) -> SnapshotterResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serializes the configuration without any credential fields.
    pub fn dump_redacted(&self) -> SnapshotterResult<String> {
        let mut value = serde_json::to_value(self)?;
        strip_secrets(&mut value);
        Ok(serde_json::to_string(&value)?)
    }

    /// Writes the configuration to `path` with mode `0600`.
    ///
    /// Fails with `AlreadyExists` if the file is already there.
    pub fn dump_file(&self, path: impl AsRef<Path>) -> SnapshotterResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    SnapshotterError::AlreadyExists(path.display().to_string())
                }
                _ => e.into(),
            })?;
        file.write_all(self.dump_string()?.as_bytes())?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn strip_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in SECRET_KEYS {
                map.remove(key);
            }
            map.values_mut().for_each(strip_secrets);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_secrets),
        _ => {}
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
