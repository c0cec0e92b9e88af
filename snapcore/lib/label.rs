//! Snapshot labels and instance annotations understood by the snapshotter.

use std::collections::HashMap;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The image reference a snapshot belongs to, set by the CRI plugin.
pub const CRI_IMAGE_REF: &str = "containerd.io/snapshot/cri.image-ref";

/// Image reference label used by builders that do not set [`CRI_IMAGE_REF`].
pub const STARGZ_REFERENCE: &str = "containerd.io/snapshot/remote/stargz.reference";

/// The digest of the compressed layer a snapshot is built from.
pub const CRI_LAYER_DIGEST: &str = "containerd.io/snapshot/cri.layer-digest";

/// The digest of the image manifest a snapshot belongs to.
pub const CRI_MANIFEST_DIGEST: &str = "containerd.io/snapshot/cri.manifest-digest";

/// Marks a layer as block-mode. The value is the layer's blob id.
pub const NYDUS_TARFS_LAYER: &str = "containerd.io/snapshot/nydus-tarfs";

/// The block-mode layers whose data devices back a mounted image, nearest layer last.
pub const NYDUS_TARFS_PARENTS: &str = "containerd.io/snapshot/nydus-tarfs-parent-snapshot-list";

/// Blob ids of the layers in [`NYDUS_TARFS_PARENTS`], in the same order.
pub const NYDUS_TARFS_PARENT_BLOBS: &str = "containerd.io/snapshot/nydus-tarfs-parent-blob-list";

/// dm-verity info of an exported whole-image block disk.
pub const NYDUS_IMAGE_BLOCK_INFO: &str = "containerd.io/snapshot/nydus-image-block";

/// dm-verity info of an exported layer block disk.
pub const NYDUS_LAYER_BLOCK_INFO: &str = "containerd.io/snapshot/nydus-layer-block";

/// Registry user name for pulling the image.
pub const PULL_USERNAME: &str = "containerd.io/snapshot/pull-username";

/// Registry secret for pulling the image.
pub const PULL_SECRET: &str = "containerd.io/snapshot/pull-secret";

/// The expected sha256 digest of the bootstrap, checked when signature validation is on.
pub const NYDUS_BOOTSTRAP_DIGEST: &str = "containerd.io/snapshot/nydus-bootstrap-digest";

/// Manifest annotation telling that an image is suitable for block-mode conversion.
pub const TARFS_HINT: &str = "containerd.io/snapshot/tarfs-hint";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The image reference of a snapshot, falling back to the stargz label.
pub fn image_reference(labels: &HashMap<String, String>) -> Option<&str> {
    labels
        .get(CRI_IMAGE_REF)
        .or_else(|| labels.get(STARGZ_REFERENCE))
        .map(String::as_str)
}

/// Whether the layer of these labels is to be served in block mode.
pub fn is_tarfs_layer(labels: &HashMap<String, String>) -> bool {
    labels.contains_key(NYDUS_TARFS_LAYER)
}

/// Whether manifest annotations carry an affirmative tarfs hint.
pub fn has_tarfs_hint(annotations: Option<&HashMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(TARFS_HINT))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
