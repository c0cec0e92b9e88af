use std::{path::Path, str::FromStr};

use oci_spec::image::{Digest as OciDigest, DigestAlgorithm};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Gets the hash of a file.
pub async fn get_file_hash(path: &Path, algorithm: &DigestAlgorithm) -> SnapshotterResult<Vec<u8>> {
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];

    macro_rules! hash_with {
        ($hasher:ty) => {{
            let mut hasher = <$hasher>::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hasher.finalize().to_vec()
        }};
    }

    let hash = match algorithm {
        DigestAlgorithm::Sha256 => hash_with!(Sha256),
        DigestAlgorithm::Sha384 => hash_with!(Sha384),
        DigestAlgorithm::Sha512 => hash_with!(Sha512),
        _ => {
            return Err(SnapshotterError::InvalidArgument(format!(
                "unsupported digest algorithm: {algorithm}"
            )));
        }
    };

    Ok(hash)
}

/// Parses a `sha256:<hex>` digest, rejecting other algorithms.
pub fn parse_sha256_digest(digest: &str) -> SnapshotterResult<OciDigest> {
    let parsed = OciDigest::from_str(digest)
        .map_err(|e| SnapshotterError::InvalidArgument(format!("invalid digest {digest}: {e}")))?;

    if *parsed.algorithm() != DigestAlgorithm::Sha256 {
        return Err(SnapshotterError::InvalidArgument(format!(
            "unsupported digest algorithm in {digest}"
        )));
    }

    Ok(parsed)
}

/// The blob id of a layer is the hex part of its digest.
pub fn blob_id_from_digest(digest: &str) -> SnapshotterResult<String> {
    Ok(parse_sha256_digest(digest)?.digest().to_string())
}

/// The fscache id of a snapshot is the hex sha256 of its snapshot id.
pub fn fscache_id(snapshot_id: &str) -> String {
    hex::encode(Sha256::digest(snapshot_id.as_bytes()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
