use std::{
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use crate::SnapshotterResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Suffix of the chunk bitmap of a cached blob.
pub const CHUNK_MAP_FILE_SUFFIX: &str = ".chunk_map";

/// Suffix of the unpacked metadata of a cached blob.
pub const META_FILE_SUFFIX: &str = ".blob.meta";

/// Suffix of the data file of a cached blob, used by newer daemons.
pub const DATA_FILE_SUFFIX: &str = ".blob.data";

const BLOCK_SIZE: u64 = 512;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Disk space taken by a snapshot or a cached blob.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// Number of inodes.
    pub inodes: u64,

    /// Bytes allocated on disk.
    pub size: u64,
}

/// The local blob cache shared by all daemons.
#[derive(Debug, Clone)]
pub struct CacheManager {
    cache_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Usage {
    /// Adds `other` to this usage.
    pub fn add(&mut self, other: Usage) {
        self.inodes += other.inodes;
        self.size += other.size;
    }
}

impl CacheManager {
    /// Creates a manager for `cache_dir`, creating the directory if needed.
    pub async fn new(cache_dir: impl Into<PathBuf>) -> SnapshotterResult<Self> {
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir).await?;
        Ok(Self { cache_dir })
    }

    /// The cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Disk usage of the cache files of `blob_id`. Missing files count as empty.
    pub async fn cache_usage(&self, blob_id: &str) -> SnapshotterResult<Usage> {
        let mut usage = Usage::default();

        for path in [
            self.cache_dir.join(blob_id),
            self.blob_file(blob_id, CHUNK_MAP_FILE_SUFFIX),
            self.blob_file(blob_id, META_FILE_SUFFIX),
        ] {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) => usage.add(Usage {
                    inodes: 1,
                    size: metadata.blocks() * BLOCK_SIZE,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "cache file does not exist");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(usage)
    }

    /// Removes the cache files of `blob_id`. Missing files are skipped.
    pub async fn remove_blob_cache(&self, blob_id: &str) -> SnapshotterResult<()> {
        // The chunk map goes before the data it describes.
        for path in [
            self.blob_file(blob_id, CHUNK_MAP_FILE_SUFFIX),
            self.blob_file(blob_id, META_FILE_SUFFIX),
            self.cache_dir.join(blob_id),
            self.blob_file(blob_id, DATA_FILE_SUFFIX),
        ] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "removed cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(blob_id = blob_id, "removed blob cache");
        Ok(())
    }

    fn blob_file(&self, blob_id: &str, suffix: &str) -> PathBuf {
        self.cache_dir.join(format!("{blob_id}{suffix}"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
