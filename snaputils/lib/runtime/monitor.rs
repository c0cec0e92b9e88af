use std::{path::PathBuf, process::ExitStatus};

use async_trait::async_trait;
use tokio::process::{ChildStderr, ChildStdout};

use crate::UtilsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A trait for monitoring supervised processes
#[async_trait]
pub trait ProcessMonitor {
    /// Start monitoring a process.
    ///
    /// `stdout` and `stderr` are `None` when the child inherits the parent's streams.
    async fn start(
        &mut self,
        pid: u32,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        log_path: PathBuf,
    ) -> UtilsResult<()>;

    /// Stop monitoring. Called once the process has exited, with its exit status if known.
    async fn stop(&mut self, status: Option<ExitStatus>) -> UtilsResult<()>;
}
