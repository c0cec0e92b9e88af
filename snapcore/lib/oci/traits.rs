use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::Digest;

use crate::{oci::Reference, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stream of blob content.
pub type BlobStream = BoxStream<'static, SnapshotterResult<Bytes>>;

/// Content fetched from a registry.
pub struct FetchedBlob {
    /// The size advertised by the registry, if any.
    pub size: Option<u64>,

    /// The content.
    pub stream: BlobStream,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Fetches content-addressed image data by digest.
#[async_trait::async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Fetches an image manifest.
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob>;

    /// Fetches a blob, either an image config or a layer.
    async fn fetch_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> SnapshotterResult<FetchedBlob>;
}
