use std::{
    collections::HashMap,
    path::PathBuf,
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use snaputils::{ProcessMonitor, RotatingLog, UtilsResult};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{ChildStderr, ChildStdout},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often adopted daemon processes are checked.
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Emitted when a subscribed daemon process goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathEvent {
    /// The daemon that died.
    pub daemon_id: String,

    /// Its process id.
    pub pid: u32,
}

/// Watches daemon processes and reports the ones that die.
///
/// Children spawned by the snapshotter report their own exit through [`DaemonMonitor`].
/// Processes adopted after a restart are polled instead.
#[derive(Debug)]
pub struct LivenessMonitor {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    events: mpsc::UnboundedSender<DeathEvent>,
}

#[derive(Debug)]
struct Subscription {
    pid: u32,
    poller: Option<CancellationToken>,
}

/// Captures the output of one daemon child and reports its exit to a [`LivenessMonitor`].
pub struct DaemonMonitor {
    daemon_id: String,
    liveness: Arc<LivenessMonitor>,
    pid: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LivenessMonitor {
    /// Creates a monitor and the receiving end of its death events.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeathEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let monitor = Arc::new(Self {
            subscriptions: Mutex::new(HashMap::new()),
            events,
        });

        (monitor, receiver)
    }

    /// Starts watching `pid` on behalf of `daemon_id`.
    ///
    /// With `adopted` set the pid is polled, otherwise its exit is expected through
    /// [`DaemonMonitor`]. A previous subscription of the daemon is replaced.
    pub fn subscribe(self: &Arc<Self>, daemon_id: &str, pid: u32, adopted: bool) {
        let poller = adopted.then(|| {
            let token = CancellationToken::new();
            tokio::spawn(self.clone().poll(daemon_id.to_string(), pid, token.clone()));
            token
        });

        let previous = self
            .lock()
            .insert(daemon_id.to_string(), Subscription { pid, poller });
        if let Some(previous) = previous {
            previous.cancel();
        }

        tracing::debug!(daemon_id = daemon_id, pid = pid, adopted = adopted, "subscribed daemon to liveness monitor");
    }

    /// Stops watching `daemon_id`. Its death is no longer reported.
    pub fn unsubscribe(&self, daemon_id: &str) {
        if let Some(subscription) = self.lock().remove(daemon_id) {
            subscription.cancel();
            tracing::debug!(daemon_id = daemon_id, pid = subscription.pid, "unsubscribed daemon from liveness monitor");
        }
    }

    /// Returns `true` if `daemon_id` is watched.
    pub fn is_subscribed(&self, daemon_id: &str) -> bool {
        self.lock().contains_key(daemon_id)
    }

    /// Reports that `pid` exited, if it is still the watched process of `daemon_id`.
    pub fn notify_exit(&self, daemon_id: &str, pid: u32) {
        let removed = {
            let mut subscriptions = self.lock();
            match subscriptions.get(daemon_id) {
                Some(s) if s.pid == pid => subscriptions.remove(daemon_id),
                _ => None,
            }
        };

        if let Some(subscription) = removed {
            subscription.cancel();
            tracing::warn!(daemon_id = daemon_id, pid = pid, "daemon process died");
            let _ = self.events.send(DeathEvent {
                daemon_id: daemon_id.to_string(),
                pid,
            });
        }
    }

    async fn poll(self: Arc<Self>, daemon_id: String, pid: u32, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(LIVENESS_POLL_INTERVAL) => {}
            }

            if !snaputils::is_process_alive(pid) {
                self.notify_exit(&daemon_id, pid);
                return;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Subscription {
    fn cancel(&self) {
        if let Some(poller) = &self.poller {
            poller.cancel();
        }
    }
}

impl DaemonMonitor {
    /// Creates a monitor for the daemon `daemon_id`.
    pub fn new(daemon_id: impl Into<String>, liveness: Arc<LivenessMonitor>) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            liveness,
            pid: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProcessMonitor for DaemonMonitor {
    async fn start(
        &mut self,
        pid: u32,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        log_path: PathBuf,
    ) -> UtilsResult<()> {
        self.pid = Some(pid);

        if stdout.is_none() && stderr.is_none() {
            return Ok(());
        }

        let log = Arc::new(tokio::sync::Mutex::new(RotatingLog::new(&log_path).await?));
        if let Some(stdout) = stdout {
            tokio::spawn(capture(stdout, log.clone(), pid));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(capture(stderr, log, pid));
        }

        Ok(())
    }

    async fn stop(&mut self, status: Option<ExitStatus>) -> UtilsResult<()> {
        if let Some(pid) = self.pid {
            tracing::info!(daemon_id = %self.daemon_id, pid = pid, status = ?status, "daemon process exited");
            self.liveness.notify_exit(&self.daemon_id, pid);
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn capture<R>(mut reader: R, log: Arc<tokio::sync::Mutex<RotatingLog>>, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];

    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            break;
        }
        if let Err(e) = log.lock().await.write(&buf[..n]).await {
            tracing::error!(pid = pid, error = %e, "failed to write daemon output log");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_reported_only_while_subscribed() {
        let (monitor, mut events) = LivenessMonitor::new();

        monitor.subscribe("d1", 100, false);
        monitor.notify_exit("d1", 999);
        assert!(monitor.is_subscribed("d1"));

        monitor.notify_exit("d1", 100);
        assert_eq!(
            events.recv().await,
            Some(DeathEvent {
                daemon_id: "d1".into(),
                pid: 100
            })
        );
        assert!(!monitor.is_subscribed("d1"));

        monitor.subscribe("d2", 200, false);
        monitor.unsubscribe("d2");
        monitor.notify_exit("d2", 200);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_adopted_process_is_polled() -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("true").spawn()?;
        let pid = child.id().unwrap();
        child.wait().await?;

        let (monitor, mut events) = LivenessMonitor::new();
        monitor.subscribe("d1", pid, true);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await?;
        assert_eq!(event.map(|e| e.daemon_id), Some("d1".to_string()));

        Ok(())
    }
}
