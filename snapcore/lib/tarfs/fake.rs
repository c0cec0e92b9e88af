use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;

use crate::{
    oci::{BlobFetcher, FetchedBlob, Reference},
    tarfs::ConversionTool,
    SnapshotterError, SnapshotterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Serves manifests and blobs from memory.
#[derive(Debug, Default)]
pub(crate) struct MemoryFetcher {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifest_fetches: AtomicUsize,
}

/// A conversion tool that drains the pipe and writes empty metadata.
#[derive(Debug, Default)]
pub(crate) struct FakeTool {
    calls: Mutex<Vec<String>>,
    merged: Mutex<Vec<Vec<PathBuf>>>,
    blob_list: Mutex<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryFetcher {
    /// Stores `content` and returns its digest.
    pub(crate) fn add(&self, content: Vec<u8>) -> Digest {
        let digest = sha256_digest(&content);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), content);
        digest
    }

    /// Drops a stored blob.
    pub(crate) fn remove(&self, digest: &Digest) {
        self.blobs.lock().unwrap().remove(&digest.to_string());
    }

    /// Number of manifest requests served.
    pub(crate) fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    /// Stores an image with the given uncompressed layers. Layers are stored as-is.
    ///
    /// Returns the manifest digest and the layer digests.
    pub(crate) fn add_image(&self, layers: &[Vec<u8>], tarfs_hint: bool) -> (Digest, Vec<Digest>) {
        let diff_ids: Vec<String> = layers.iter().map(|l| sha256_digest(l).to_string()).collect();
        let layer_digests: Vec<Digest> = layers.iter().map(|l| self.add(l.clone())).collect();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });
        let config = serde_json::to_vec(&config).unwrap();
        let config_size = config.len();
        let config_digest = self.add(config);

        let mut manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest.to_string(),
                "size": config_size,
            },
            "layers": layer_digests.iter().zip(layers).map(|(d, l)| serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": d.to_string(),
                "size": l.len(),
            })).collect::<Vec<_>>(),
        });
        if tarfs_hint {
            let mut annotations = serde_json::Map::new();
            annotations.insert(crate::label::TARFS_HINT.to_string(), "true".into());
            manifest["annotations"] = serde_json::Value::Object(annotations);
        }

        let manifest_digest = self.add(serde_json::to_vec(&manifest).unwrap());
        (manifest_digest, layer_digests)
    }

    fn get(&self, digest: &Digest) -> SnapshotterResult<FetchedBlob> {
        let content = self
            .blobs
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| SnapshotterError::NotFound(format!("blob {digest}")))?;

        Ok(FetchedBlob {
            size: Some(content.len() as u64),
            stream: futures::stream::iter(vec![Ok(Bytes::from(content))]).boxed(),
        })
    }
}

impl FakeTool {
    /// Commands run so far.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Inputs of every merge, in order.
    pub(crate) fn merged(&self) -> Vec<Vec<PathBuf>> {
        self.merged.lock().unwrap().clone()
    }

    /// Sets what `inspect_blobs` reports.
    pub(crate) fn set_blob_list(&self, blob_ids: &[&str]) {
        let list: Vec<_> = blob_ids
            .iter()
            .map(|id| serde_json::json!({ "blob_id": id }))
            .collect();
        *self.blob_list.lock().unwrap() = serde_json::to_string(&list).unwrap();
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobFetcher for MemoryFetcher {
    async fn fetch_manifest(
        &self,
        _reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to pile up.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.get(digest)
    }

    async fn fetch_blob(
        &self,
        _reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob> {
        self.get(digest)
    }
}

#[async_trait]
impl ConversionTool for FakeTool {
    async fn create_layer(
        &self,
        source: &Path,
        bootstrap: &Path,
        _blob_id: &str,
        _blob_dir: &Path,
    ) -> SnapshotterResult<()> {
        self.record("create");
        let mut content = Vec::new();
        tokio::fs::File::open(source)
            .await?
            .read_to_end(&mut content)
            .await?;
        tokio::fs::write(bootstrap, b"").await?;
        Ok(())
    }

    async fn merge(&self, bootstraps: &[PathBuf], output: &Path) -> SnapshotterResult<()> {
        self.record("merge");
        self.merged.lock().unwrap().push(bootstraps.to_vec());
        tokio::fs::write(output, b"merged").await?;
        Ok(())
    }

    async fn export_block(
        &self,
        _bootstrap: &Path,
        _blob_dir: &Path,
        output: &Path,
        with_verity: bool,
    ) -> SnapshotterResult<String> {
        self.record("export");
        tokio::fs::write(output, b"disk").await?;
        Ok(if with_verity {
            "dm-verity options: --no-superblock --format=1 -s \"\" --hash=sha256 \
             --data-block-size=512 --hash-block-size=4096 --data-blocks 8 --hash-offset 4096 \
             0123abcd\n"
                .to_string()
        } else {
            String::new()
        })
    }

    async fn inspect_blobs(&self, _bootstrap: &Path) -> SnapshotterResult<String> {
        self.record("inspect");
        Ok(self.blob_list.lock().unwrap().clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The `sha256:` digest of `content`.
pub(crate) fn sha256_digest(content: &[u8]) -> Digest {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
        .parse()
        .unwrap()
}
