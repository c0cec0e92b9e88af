use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use tokio::{fs::create_dir_all, process::Command, sync::watch, task::JoinHandle};

use crate::{ProcessMonitor, UtilsError, UtilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filename that captured child output is written to.
pub const CHILD_OUTPUT_LOG_FILENAME: &str = "stdout.log";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A supervisor that launches a child process, hands its output to a monitor and reaps it.
pub struct Supervisor<M>
where
    M: ProcessMonitor + Send + 'static,
{
    /// Path to the child executable
    child_exe: PathBuf,

    /// Arguments to pass to the child executable
    child_args: Vec<String>,

    /// Environment variables for the child process
    child_envs: Vec<(String, String)>,

    /// Name of the child process, used in logs
    child_name: String,

    /// Directory the captured child output is written to
    log_dir: PathBuf,

    /// Whether the child writes straight to our stdout/stderr
    forward_output: bool,

    /// The process monitor
    process_monitor: M,
}

/// A running child started by a [`Supervisor`].
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    reaper: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<M> Supervisor<M>
where
    M: ProcessMonitor + Send + 'static,
{
    /// Creates a new supervisor instance.
    ///
    /// ## Arguments
    ///
    /// * `child_exe` - Path to the child executable
    /// * `child_args` - Arguments to pass to the child executable
    /// * `child_envs` - Environment variables for the child process
    /// * `child_name` - Name of the child process
    /// * `log_dir` - Directory for captured child output
    /// * `process_monitor` - The process monitor to use
    pub fn new(
        child_exe: impl AsRef<Path>,
        child_args: impl IntoIterator<Item = impl Into<String>>,
        child_envs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        child_name: impl Into<String>,
        log_dir: impl AsRef<Path>,
        process_monitor: M,
    ) -> Self {
        Self {
            child_exe: child_exe.as_ref().to_path_buf(),
            child_args: child_args.into_iter().map(Into::into).collect(),
            child_envs: child_envs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            child_name: child_name.into(),
            log_dir: log_dir.as_ref().to_path_buf(),
            forward_output: false,
            process_monitor,
        }
    }

    /// Makes the child inherit our stdout/stderr instead of having them captured.
    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Spawns the child process.
    ///
    /// This method:
    /// 1. Creates the log directory if it doesn't exist
    /// 2. Starts the child process
    /// 3. Passes stdout/stderr to the process monitor
    /// 4. Reaps the child in the background and notifies the monitor when it exits
    pub async fn spawn(self) -> UtilsResult<SupervisedProcess> {
        let Self {
            child_exe,
            child_args,
            child_envs,
            child_name,
            log_dir,
            forward_output,
            mut process_monitor,
        } = self;

        create_dir_all(&log_dir).await?;

        let (stdout, stderr) = if forward_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::piped(), Stdio::piped())
        };

        let mut child = Command::new(&child_exe)
            .args(&child_args)
            .envs(child_envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    UtilsError::BinaryNotFound(child_exe.display().to_string(), e.to_string())
                }
                _ => UtilsError::IoError(e),
            })?;

        let Some(pid) = child.id() else {
            return Err(UtilsError::ProcessVanished(child_name));
        };

        tracing::info!(child = %child_name, pid = pid, "spawned child process");

        if let Err(e) = process_monitor
            .start(
                pid,
                child.stdout.take(),
                child.stderr.take(),
                log_dir.join(CHILD_OUTPUT_LOG_FILENAME),
            )
            .await
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let reaper = tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        tracing::info!(child = %child_name, pid = pid, "child process exited successfully");
                    } else {
                        tracing::warn!(child = %child_name, pid = pid, %status, "child process exited");
                    }
                    Some(status)
                }
                Err(e) => {
                    tracing::error!(child = %child_name, pid = pid, error = %e, "failed to wait for child process");
                    None
                }
            };

            let _ = exit_tx.send(status);
            if let Err(e) = process_monitor.stop(status).await {
                tracing::error!(child = %child_name, pid = pid, error = %e, "failed to stop process monitor");
            }
        });

        Ok(SupervisedProcess {
            pid,
            exit_rx,
            reaper,
        })
    }
}

impl SupervisedProcess {
    /// The pid of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` once the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.reaper.is_finished() || self.exit_rx.borrow().is_some()
    }

    /// Waits for the child to be reaped and returns its exit status if it could be read.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        let _ = self.exit_rx.wait_for(Option::is_some).await;
        *self.exit_rx.borrow()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::process::{ChildStderr, ChildStdout};

    use super::*;
    use crate::RotatingLog;

    #[derive(Default, Clone)]
    struct RecordingMonitor {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProcessMonitor for RecordingMonitor {
        async fn start(
            &mut self,
            pid: u32,
            stdout: Option<ChildStdout>,
            _stderr: Option<ChildStderr>,
            log_path: PathBuf,
        ) -> UtilsResult<()> {
            self.events.lock().unwrap().push(format!("start {pid}"));
            if let Some(stdout) = stdout {
                let mut log = RotatingLog::new(log_path).await?;
                tokio::spawn(async move {
                    let _ = log.copy_from(stdout).await;
                });
            }
            Ok(())
        }

        async fn stop(&mut self, status: Option<ExitStatus>) -> UtilsResult<()> {
            let code = status.and_then(|s| s.code()).unwrap_or(-1);
            self.events.lock().unwrap().push(format!("stop {code}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_supervisor_spawns_and_reaps_child() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let monitor = RecordingMonitor::default();
        let supervisor = Supervisor::new(
            "sh",
            ["-c", "echo ready; exit 3"],
            Vec::<(String, String)>::new(),
            "test-child",
            temp_dir.path(),
            monitor.clone(),
        );

        let mut process = supervisor.spawn().await?;
        let status = process.wait().await.expect("exit status");
        assert_eq!(status.code(), Some(3));

        // The monitor is stopped right after the exit status is published
        for _ in 0..50 {
            if monitor.events.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let events = monitor.events.lock().unwrap().clone();
        assert_eq!(events, vec![format!("start {}", process.pid()), "stop 3".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_supervisor_reports_missing_binary() {
        let temp_dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(
            "/nonexistent/daemon",
            Vec::<String>::new(),
            Vec::<(String, String)>::new(),
            "missing",
            temp_dir.path(),
            RecordingMonitor::default(),
        );

        let result = supervisor.spawn().await;
        assert!(matches!(result, Err(UtilsError::BinaryNotFound(_, _))));
    }
}
