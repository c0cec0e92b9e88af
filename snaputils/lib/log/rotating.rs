//! Size-bounded log files for captured child process output.
//!
//! When the current file would grow past its maximum size it is renamed to `<name>.old`,
//! replacing any previous generation, and writing continues in a fresh file.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};

use crate::UtilsResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default maximum size of a log file before it is rotated.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// The suffix given to the previous log generation.
pub const ROTATED_LOG_SUFFIX: &str = "old";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An append-only log file that keeps at most one older generation.
#[derive(Debug)]
pub struct RotatingLog {
    file: File,
    path: PathBuf,
    max_size: u64,
    current_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Opens (or creates) the log file with [`DEFAULT_LOG_MAX_SIZE`].
    pub async fn new(path: impl AsRef<Path>) -> UtilsResult<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Opens (or creates) the log file, rotating once it reaches `max_size` bytes.
    ///
    /// ## Arguments
    ///
    /// * `path` - Path to the log file
    /// * `max_size` - Size in bytes after which the file is rotated
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> UtilsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = open_append(&path).await?;
        let current_size = file.metadata().await?.len();

        Ok(Self {
            file,
            path,
            max_size: max_size.max(1),
            current_size,
        })
    }

    /// Path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `buf`, rotating first if it would not fit.
    pub async fn write(&mut self, buf: &[u8]) -> UtilsResult<()> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.rotate().await?;
        }

        self.file.write_all(buf).await?;
        self.current_size += buf.len() as u64;
        Ok(())
    }

    /// Copies everything from `reader` into the log until EOF.
    pub async fn copy_from<R>(&mut self, mut reader: R) -> UtilsResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 8192];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }

        self.file.flush().await?;
        Ok(total)
    }

    async fn rotate(&mut self) -> UtilsResult<()> {
        self.file.flush().await?;

        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".");
        rotated.push(ROTATED_LOG_SUFFIX);
        fs::rename(&self.path, PathBuf::from(rotated)).await?;

        self.file = open_append(&self.path).await?;
        self.current_size = 0;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
