use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixListener,
};

use crate::{daemon::DaemonApi, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Holds the runtime states of a daemon so that a replacement process can take them over.
///
/// The state payload is opaque to the snapshotter. A daemon pushes it to
/// [`socket_path`](Supervisor::socket_path) when asked to through its control API, and a daemon
/// started with `--upgrade` pulls it back from the same socket.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// The id of the supervised daemon.
    fn id(&self) -> &str;

    /// The socket daemons exchange states over.
    fn socket_path(&self) -> &Path;

    /// Asks the daemon behind `api` to push its states and stores them.
    async fn save_states(&self, api: &dyn DaemonApi) -> SnapshotterResult<()>;

    /// Serves the stored states to the next process that connects within `timeout`.
    ///
    /// Returns as soon as the socket is listening.
    async fn handoff(&self, timeout: Duration) -> SnapshotterResult<()>;

    /// Drops the stored states and releases the socket.
    async fn detach(&self) -> SnapshotterResult<()>;

    /// Returns `true` if states have been saved.
    fn has_states(&self) -> bool;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`Supervisor`] that exchanges states over a unix socket.
#[derive(Debug)]
pub struct UnixSocketSupervisor {
    id: String,
    socket_path: PathBuf,
    states: Arc<Mutex<Option<Vec<u8>>>>,
    busy: tokio::sync::Mutex<()>,
}

/// The supervisors of one manager, keyed by daemon id.
#[derive(Debug)]
pub struct SupervisorSet {
    root: PathBuf,
    supervisors: Mutex<HashMap<String, Arc<UnixSocketSupervisor>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnixSocketSupervisor {
    /// Creates a supervisor listening at `socket_path` when needed.
    pub fn new(id: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            socket_path: socket_path.into(),
            states: Arc::new(Mutex::new(None)),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    fn listen(&self) -> SnapshotterResult<UnixListener> {
        remove_socket(&self.socket_path)?;
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    fn stored(&self) -> Option<Vec<u8>> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SupervisorSet {
    /// Creates a set whose sockets live under `root`.
    pub async fn new(root: impl Into<PathBuf>) -> SnapshotterResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            supervisors: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the supervisor of `daemon_id`, creating it at `<root>/<daemon_id>.sock`.
    pub fn attach(&self, daemon_id: &str) -> Arc<dyn Supervisor> {
        let mut supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        let supervisor = supervisors
            .entry(daemon_id.to_string())
            .or_insert_with(|| {
                let socket = self.root.join(format!("{daemon_id}.sock"));
                Arc::new(UnixSocketSupervisor::new(daemon_id, socket))
            })
            .clone();

        supervisor
    }

    /// Returns the supervisor of `daemon_id`, if attached.
    pub fn get(&self, daemon_id: &str) -> Option<Arc<dyn Supervisor>> {
        self.supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(daemon_id)
            .cloned()
            .map(|s| s as Arc<dyn Supervisor>)
    }

    /// Detaches and forgets the supervisor of `daemon_id`.
    pub async fn detach(&self, daemon_id: &str) -> SnapshotterResult<()> {
        let supervisor = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(daemon_id)
            .ok_or_else(|| SnapshotterError::NotFound(format!("supervisor of {daemon_id}")))?;

        supervisor.detach().await
    }

    /// The directory holding the supervisor sockets.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Supervisor for UnixSocketSupervisor {
    fn id(&self) -> &str {
        &self.id
    }

    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn save_states(&self, api: &dyn DaemonApi) -> SnapshotterResult<()> {
        let _busy = self.busy.lock().await;
        let listener = self.listen()?;

        let receive = async {
            let (mut stream, _) = listener.accept().await?;
            let mut states = Vec::new();
            stream.read_to_end(&mut states).await?;
            Ok::<_, SnapshotterError>(states)
        };

        let (_, states) = tokio::try_join!(api.send_fd(), receive)?;
        tracing::info!(daemon_id = %self.id, size = states.len(), "saved daemon states");

        *self.states.lock().unwrap_or_else(|e| e.into_inner()) = Some(states);
        remove_socket(&self.socket_path)?;

        Ok(())
    }

    async fn handoff(&self, timeout: Duration) -> SnapshotterResult<()> {
        let states = self.stored().ok_or_else(|| {
            SnapshotterError::InvalidState(format!("no states saved for daemon {}", self.id))
        })?;

        let listener = self.listen()?;
        let id = self.id.clone();
        let socket_path = self.socket_path.clone();

        tokio::spawn(async move {
            let send = async {
                let (mut stream, _) = listener.accept().await?;
                stream.write_all(&states).await?;
                stream.shutdown().await?;
                Ok::<_, std::io::Error>(())
            };

            match tokio::time::timeout(timeout, send).await {
                Ok(Ok(())) => tracing::info!(daemon_id = %id, "handed states over"),
                Ok(Err(e)) => tracing::error!(daemon_id = %id, error = %e, "failed to hand states over"),
                Err(_) => tracing::warn!(daemon_id = %id, "no process took the states over in time"),
            }

            if let Err(e) = remove_socket(&socket_path) {
                tracing::warn!(daemon_id = %id, error = %e, "failed to remove supervisor socket");
            }
        });

        Ok(())
    }

    async fn detach(&self) -> SnapshotterResult<()> {
        let _busy = self.busy.lock().await;
        self.states.lock().unwrap_or_else(|e| e.into_inner()).take();
        remove_socket(&self.socket_path)
    }

    fn has_states(&self) -> bool {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn remove_socket(path: &Path) -> SnapshotterResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::net::UnixStream;

    use crate::daemon::FakeDaemonApi;

    use super::*;

    #[tokio::test]
    async fn test_save_and_handoff_states() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let set = SupervisorSet::new(dir.path()).await?;
        let supervisor = set.attach("d1");
        assert_eq!(supervisor.socket_path(), dir.path().join("d1.sock"));

        let api = FakeDaemonApi::default().with_states(supervisor.socket_path(), b"opaque");
        supervisor.save_states(&api).await?;
        assert!(supervisor.has_states());

        supervisor.handoff(Duration::from_secs(5)).await?;
        let mut stream = UnixStream::connect(supervisor.socket_path()).await?;
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await?;
        assert_eq!(received, b"opaque");

        set.detach("d1").await?;
        assert!(set.get("d1").is_none());
        assert!(set.detach("d1").await.unwrap_err().is_not_found());

        Ok(())
    }

    #[tokio::test]
    async fn test_handoff_without_states_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let supervisor = UnixSocketSupervisor::new("d2", dir.path().join("d2.sock"));
        assert!(supervisor.handoff(Duration::from_secs(1)).await.is_err());
        Ok(())
    }
}
