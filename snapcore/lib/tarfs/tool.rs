use std::{
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `nydus-image` binary.
#[derive(Debug, Clone)]
pub struct NydusImageTool {
    path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Builds and inspects block-mode filesystem metadata.
#[async_trait]
pub trait ConversionTool: Send + Sync {
    /// Reads a tar stream from `source` and writes the layer metadata to `bootstrap`.
    ///
    /// `source` is a named pipe. The tool must read it to the end.
    async fn create_layer(
        &self,
        source: &Path,
        bootstrap: &Path,
        blob_id: &str,
        blob_dir: &Path,
    ) -> SnapshotterResult<()>;

    /// Merges layer metadata, lowest layer first, into `output`.
    async fn merge(&self, bootstraps: &[PathBuf], output: &Path) -> SnapshotterResult<()>;

    /// Exports `bootstrap` and its blobs as a block disk at `output`. Returns the tool's
    /// standard output, which carries the dm-verity parameters when `with_verity` is set.
    async fn export_block(
        &self,
        bootstrap: &Path,
        blob_dir: &Path,
        output: &Path,
        with_verity: bool,
    ) -> SnapshotterResult<String>;

    /// Lists the blobs referenced by `bootstrap`, as JSON.
    async fn inspect_blobs(&self, bootstrap: &Path) -> SnapshotterResult<String>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NydusImageTool {
    /// Creates a tool running the binary at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn run(&self, args: Vec<String>) -> SnapshotterResult<Output> {
        tracing::debug!(tool = %self.path.display(), args = ?args, "running conversion tool");
        let output = Command::new(&self.path).args(&args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            tracing::warn!(tool = %self.path.display(), stderr = %stderr, "conversion tool failed");
            return Err(SnapshotterError::CommandFailed {
                command: format!("{} {}", self.path.display(), args.join(" ")),
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(output)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ConversionTool for NydusImageTool {
    async fn create_layer(
        &self,
        source: &Path,
        bootstrap: &Path,
        blob_id: &str,
        blob_dir: &Path,
    ) -> SnapshotterResult<()> {
        self.run(vec![
            "create".to_string(),
            "--type".to_string(),
            "tar-tarfs".to_string(),
            "--bootstrap".to_string(),
            bootstrap.display().to_string(),
            "--blob-id".to_string(),
            blob_id.to_string(),
            "--blob-dir".to_string(),
            blob_dir.display().to_string(),
            source.display().to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn merge(&self, bootstraps: &[PathBuf], output: &Path) -> SnapshotterResult<()> {
        let mut args = vec![
            "merge".to_string(),
            "--bootstrap".to_string(),
            output.display().to_string(),
        ];
        args.extend(bootstraps.iter().map(|b| b.display().to_string()));

        self.run(args).await?;
        Ok(())
    }

    async fn export_block(
        &self,
        bootstrap: &Path,
        blob_dir: &Path,
        output: &Path,
        with_verity: bool,
    ) -> SnapshotterResult<String> {
        let mut args = vec![
            "export".to_string(),
            "--block".to_string(),
            "--localfs-dir".to_string(),
            blob_dir.display().to_string(),
            "--bootstrap".to_string(),
            bootstrap.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
        ];
        if with_verity {
            args.push("--verity".to_string());
        }

        let output = self.run(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn inspect_blobs(&self, bootstrap: &Path) -> SnapshotterResult<String> {
        let output = self
            .run(vec![
                "inspect".to_string(),
                "-R".to_string(),
                "blobs".to_string(),
                bootstrap.display().to_string(),
            ])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// A stand-in binary that records its arguments and prints a fixed line.
    fn recording_tool(dir: &Path) -> (NydusImageTool, PathBuf) {
        let log = dir.join("args.log");
        let script = dir.join("nydus-image");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" > {}\necho 'blob list'\n[ \"$1\" != fail ]\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (NydusImageTool::new(script), log)
    }

    #[tokio::test]
    async fn test_merge_passes_layers_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (tool, log) = recording_tool(dir.path());

        tool.merge(
            &[PathBuf::from("/l/1.boot"), PathBuf::from("/l/2.boot")],
            Path::new("/out.boot"),
        )
        .await?;

        assert_eq!(
            std::fs::read_to_string(log)?.trim(),
            "merge --bootstrap /out.boot /l/1.boot /l/2.boot"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_export_and_inspect_return_stdout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (tool, log) = recording_tool(dir.path());

        let stdout = tool
            .export_block(Path::new("/b"), Path::new("/cache"), Path::new("/disk"), true)
            .await?;
        assert_eq!(stdout.trim(), "blob list");
        assert_eq!(
            std::fs::read_to_string(&log)?.trim(),
            "export --block --localfs-dir /cache --bootstrap /b --output /disk --verity"
        );

        tool.inspect_blobs(Path::new("/b")).await?;
        assert_eq!(std::fs::read_to_string(&log)?.trim(), "inspect -R blobs /b");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (tool, _) = recording_tool(dir.path());

        let err = tool.run(vec!["fail".to_string()]).await.unwrap_err();
        assert!(matches!(err, SnapshotterError::CommandFailed { .. }));
        Ok(())
    }
}
