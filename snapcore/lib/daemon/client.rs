use std::{
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{client::conn::http1, header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use crate::{
    config::{DAEMON_SOCKET_WAIT_ATTEMPTS, DAEMON_STATE_WAIT_INTERVAL},
    daemon::{CacheMetrics, DaemonInfo, ErrorMessage, FsMetrics, InflightOp, MountRequest},
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const ENDPOINT_DAEMON_INFO: &str = "/api/v1/daemon";
const ENDPOINT_MOUNT: &str = "/api/v1/mount";
const ENDPOINT_METRICS: &str = "/api/v1/metrics";
const ENDPOINT_CACHE_METRICS: &str = "/api/v1/metrics/blobcache";
const ENDPOINT_INFLIGHT_METRICS: &str = "/api/v1/metrics/inflight";
const ENDPOINT_TAKE_OVER: &str = "/api/v1/daemon/fuse/takeover";
const ENDPOINT_SEND_FD: &str = "/api/v1/daemon/fuse/sendfd";
const ENDPOINT_START: &str = "/api/v1/daemon/start";
const ENDPOINT_EXIT: &str = "/api/v1/daemon/exit";
const ENDPOINT_BLOBS: &str = "/api/v2/blobs";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The control endpoint of a running daemon.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    /// Queries the daemon id, version and state.
    async fn get_daemon_info(&self) -> SnapshotterResult<DaemonInfo>;

    /// Mounts a rafs instance at `mountpoint` inside the daemon's filesystem.
    async fn mount(&self, mountpoint: &str, bootstrap: &str, config: &str)
        -> SnapshotterResult<()>;

    /// Unmounts the rafs instance at `mountpoint`.
    async fn umount(&self, mountpoint: &str) -> SnapshotterResult<()>;

    /// Binds the blobs described by `config` to the fscache domain.
    async fn bind_blob(&self, config: &str) -> SnapshotterResult<()>;

    /// Unbinds a blob, or a whole domain when `blob_id` equals `domain_id`.
    async fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> SnapshotterResult<()>;

    /// Fetches filesystem metrics, of one instance if `snapshot_id` is given.
    async fn get_fs_metrics(&self, snapshot_id: Option<&str>) -> SnapshotterResult<FsMetrics>;

    /// Fetches blob cache metrics.
    async fn get_cache_metrics(&self, snapshot_id: Option<&str>)
        -> SnapshotterResult<CacheMetrics>;

    /// Fetches requests the daemon is still processing.
    async fn get_inflight_metrics(&self) -> SnapshotterResult<Vec<InflightOp>>;

    /// Asks the daemon to restore its states from the supervisor.
    async fn take_over(&self) -> SnapshotterResult<()>;

    /// Asks the daemon to send its states to the supervisor.
    async fn send_fd(&self) -> SnapshotterResult<()>;

    /// Asks the daemon to start serving.
    async fn start(&self) -> SnapshotterResult<()>;

    /// Asks the daemon to exit without unmounting.
    async fn exit(&self) -> SnapshotterResult<()>;
}

/// Creates [`DaemonApi`] clients for control sockets.
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    /// Returns a client talking to the daemon behind `api_socket`.
    fn connect(&self, api_socket: &Path) -> Arc<dyn DaemonApi>;

    /// Waits until `api_socket` shows up, giving up early when `pid` dies.
    async fn wait_for_socket(&self, api_socket: &Path, pid: Option<u32>) -> SnapshotterResult<()> {
        wait_until_socket_exists(api_socket, pid).await
    }
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`DaemonApi`] speaking HTTP/1.1 over the daemon's unix socket.
#[derive(Debug, Clone)]
pub struct HttpDaemonClient {
    socket: PathBuf,
    timeout: Duration,
}

/// Connects to daemons through [`HttpDaemonClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpDaemonClient {
    /// Creates a client for the socket at `socket`. No connection is made until the first request.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> SnapshotterResult<Bytes> {
        let uri = build_uri(path, query)?;
        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "daemon connection closed");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(header::HOST, "localhost");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder.body(Full::new(body.unwrap_or_default()))?;

        let response = tokio::time::timeout(self.timeout, sender.send_request(request))
            .await
            .map_err(|_| {
                SnapshotterError::Timeout(format!(
                    "request {uri} on {}",
                    self.socket.display()
                ))
            })??;

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            return Ok(body);
        }

        let message = serde_json::from_slice::<ErrorMessage>(&body).unwrap_or_else(|_| {
            ErrorMessage {
                code: status.as_u16().to_string(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }
        });

        Err(SnapshotterError::DaemonApi {
            code: message.code,
            message: message.message,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> SnapshotterResult<T> {
        let body = self.request(Method::GET, path, query, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn put(&self, path: &str) -> SnapshotterResult<()> {
        self.request(Method::PUT, path, &[], None).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn build_uri(path: &str, query: &[(&str, &str)]) -> SnapshotterResult<String> {
    let mut url = Url::parse("http://localhost").map_err(SnapshotterError::custom)?;
    url.set_path(path);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter().copied());
    }

    Ok(match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    })
}

/// Polls until a unix socket exists at `path`.
///
/// Gives up after [`DAEMON_SOCKET_WAIT_ATTEMPTS`] polls, or as soon as `pid` is no longer alive.
pub async fn wait_until_socket_exists(path: &Path, pid: Option<u32>) -> SnapshotterResult<()> {
    for _ in 0..DAEMON_SOCKET_WAIT_ATTEMPTS {
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            if metadata.file_type().is_socket() {
                return Ok(());
            }
            return Err(SnapshotterError::InvalidState(format!(
                "{} is not a socket",
                path.display()
            )));
        }

        if let Some(pid) = pid {
            if !snaputils::is_process_alive(pid) {
                return Err(SnapshotterError::InvalidState(format!(
                    "process {pid} exited before creating {}",
                    path.display()
                )));
            }
        }

        tokio::time::sleep(DAEMON_STATE_WAIT_INTERVAL).await;
    }

    Err(SnapshotterError::Timeout(format!(
        "socket {} never appeared",
        path.display()
    )))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl DaemonApi for HttpDaemonClient {
    async fn get_daemon_info(&self) -> SnapshotterResult<DaemonInfo> {
        self.get(ENDPOINT_DAEMON_INFO, &[]).await
    }

    async fn mount(
        &self,
        mountpoint: &str,
        bootstrap: &str,
        config: &str,
    ) -> SnapshotterResult<()> {
        let body = serde_json::to_vec(&MountRequest::new(bootstrap, config))?;
        self.request(
            Method::POST,
            ENDPOINT_MOUNT,
            &[("mountpoint", mountpoint)],
            Some(Bytes::from(body)),
        )
        .await?;
        Ok(())
    }

    async fn umount(&self, mountpoint: &str) -> SnapshotterResult<()> {
        self.request(
            Method::DELETE,
            ENDPOINT_MOUNT,
            &[("mountpoint", mountpoint)],
            None,
        )
        .await?;
        Ok(())
    }

    async fn bind_blob(&self, config: &str) -> SnapshotterResult<()> {
        self.request(
            Method::PUT,
            ENDPOINT_BLOBS,
            &[],
            Some(Bytes::copy_from_slice(config.as_bytes())),
        )
        .await?;
        Ok(())
    }

    async fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> SnapshotterResult<()> {
        let mut query = Vec::new();
        if !domain_id.is_empty() {
            query.push(("domain_id", domain_id));
            if domain_id != blob_id {
                query.push(("blob_id", blob_id));
            }
        } else {
            query.push(("blob_id", blob_id));
        }

        self.request(Method::DELETE, ENDPOINT_BLOBS, &query, None)
            .await?;
        Ok(())
    }

    async fn get_fs_metrics(&self, snapshot_id: Option<&str>) -> SnapshotterResult<FsMetrics> {
        let id = snapshot_id.map(|sid| format!("/{sid}"));
        let query: Vec<(&str, &str)> = id.iter().map(|id| ("id", id.as_str())).collect();
        self.get(ENDPOINT_METRICS, &query).await
    }

    async fn get_cache_metrics(
        &self,
        snapshot_id: Option<&str>,
    ) -> SnapshotterResult<CacheMetrics> {
        let id = snapshot_id.map(|sid| format!("/{sid}"));
        let query: Vec<(&str, &str)> = id.iter().map(|id| ("id", id.as_str())).collect();
        self.get(ENDPOINT_CACHE_METRICS, &query).await
    }

    async fn get_inflight_metrics(&self) -> SnapshotterResult<Vec<InflightOp>> {
        let body = self
            .request(Method::GET, ENDPOINT_INFLIGHT_METRICS, &[], None)
            .await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_slice(&body)?)
    }

    async fn take_over(&self) -> SnapshotterResult<()> {
        self.put(ENDPOINT_TAKE_OVER).await
    }

    async fn send_fd(&self) -> SnapshotterResult<()> {
        self.put(ENDPOINT_SEND_FD).await
    }

    async fn start(&self) -> SnapshotterResult<()> {
        self.put(ENDPOINT_START).await
    }

    async fn exit(&self) -> SnapshotterResult<()> {
        self.put(ENDPOINT_EXIT).await
    }
}

#[async_trait]
impl DaemonConnector for HttpConnector {
    fn connect(&self, api_socket: &Path) -> Arc<dyn DaemonApi> {
        Arc::new(HttpDaemonClient::new(api_socket))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
