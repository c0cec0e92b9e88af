//! Fan-out of a layer blob into the tar file and the conversion tool.
//!
//! The compressed blob is decompressed once. The decompressed bytes are hashed and written
//! both to the layer tar file and to a named pipe read by the conversion tool.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
    time::Duration,
};

use flate2::read::MultiGzDecoder;
use futures::TryStreamExt;
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::stat::Mode,
    unistd::mkfifo,
};
use sha2::{Digest, Sha256};
use tokio_util::{
    io::{StreamReader, SyncIoBridge},
    sync::CancellationToken,
};

use crate::{oci::BlobStream, SnapshotterError, SnapshotterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Attempts to open the pipe before its reader shows up. Attempt `n` sleeps `10n` ms.
const FIFO_OPEN_ATTEMPTS: u64 = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Compression of a layer blob, detected from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// A plain tar stream.
    Uncompressed,

    /// gzip, possibly multi-member.
    Gzip,

    /// zstd, possibly multi-frame.
    Zstd,
}

/// Writes everything to two writers.
///
/// A failure of either writer fails the write, so a conversion tool that exits early stops
/// the whole copy.
#[derive(Debug)]
pub struct TeeWriter<A, B> {
    primary: A,
    secondary: B,
}

/// What was streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// `sha256:<hex>` of the decompressed content.
    pub digest: String,

    /// Size of the decompressed content.
    pub size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<A, B> TeeWriter<A, B> {
    /// Creates a writer feeding `primary` then `secondary`.
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }

    /// Returns the two writers.
    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.secondary)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Detects the compression of a blob from its leading bytes.
pub fn detect_compression(header: &[u8]) -> Compression {
    if header.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if header.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::Uncompressed
    }
}

/// Wraps `reader` so that it yields the decompressed content.
pub fn decompress<R>(mut reader: R) -> SnapshotterResult<Box<dyn Read + Send>>
where
    R: BufRead + Send + 'static,
{
    let compression = detect_compression(reader.fill_buf()?);
    tracing::debug!(compression = ?compression, "detected layer compression");

    match compression {
        Compression::Gzip => Ok(Box::new(MultiGzDecoder::new(reader))),
        Compression::Uncompressed => Ok(Box::new(reader)),
        Compression::Zstd => Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?)),
    }
}

/// Creates the named pipe the conversion tool reads the layer from.
pub fn create_fifo(path: impl AsRef<Path>) -> SnapshotterResult<()> {
    mkfifo(path.as_ref(), Mode::from_bits_truncate(0o640))?;
    Ok(())
}

/// Opens the write end of a named pipe once its reader has opened it.
///
/// The open is non-blocking so that a reader that never shows up cannot hang the caller.
/// Retrying stops early when `reader_gone` is cancelled. The returned file is switched back
/// to blocking writes.
pub fn open_fifo_writer(
    path: impl AsRef<Path>,
    reader_gone: &CancellationToken,
) -> SnapshotterResult<File> {
    let path = path.as_ref();
    for attempt in 1..=FIFO_OPEN_ATTEMPTS {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))?;
                return Ok(file);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if reader_gone.is_cancelled() {
                    return Err(SnapshotterError::InvalidState(format!(
                        "reader of {} exited before opening it",
                        path.display()
                    )));
                }
                std::thread::sleep(Duration::from_millis(10 * attempt));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(SnapshotterError::Timeout(format!(
        "no reader opened {}",
        path.display()
    )))
}

/// Copies `reader` into `writer` while hashing it.
pub fn copy_hashed<R, W>(mut reader: R, mut writer: W) -> SnapshotterResult<StreamOutcome>
where
    R: Read,
    W: Write,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
        size += n as u64;
    }
    writer.flush()?;

    Ok(StreamOutcome {
        digest: format!("sha256:{}", hex::encode(hasher.finalize())),
        size,
    })
}

/// Streams a layer blob into `tar_path` and the named pipe at `fifo_path`.
///
/// The pipe is closed when this returns, which is the end-of-stream for the tool.
/// `reader_gone` must be cancelled once the tool has exited.
pub async fn stream_layer(
    blob: BlobStream,
    tar_path: PathBuf,
    fifo_path: PathBuf,
    reader_gone: CancellationToken,
) -> SnapshotterResult<StreamOutcome> {
    let reader = StreamReader::new(blob.map_err(|e| io::Error::other(e.to_string())));
    let reader = SyncIoBridge::new(reader);

    tokio::task::spawn_blocking(move || {
        let decoded = decompress(BufReader::with_capacity(COPY_BUFFER_SIZE, reader))?;
        let tar_file = BufWriter::new(File::create(&tar_path)?);
        let fifo = open_fifo_writer(&fifo_path, &reader_gone)?;
        copy_hashed(decoded, TeeWriter::new(tar_file, fifo))
    })
    .await?
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use flate2::{write::GzEncoder, Compression as GzLevel};
    use futures::StreamExt;

    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn blob_stream(data: Vec<u8>) -> BlobStream {
        let chunks: Vec<SnapshotterResult<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(detect_compression(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(detect_compression(&ZSTD_MAGIC), Compression::Zstd);
        assert_eq!(detect_compression(b"ustar"), Compression::Uncompressed);
        assert_eq!(detect_compression(&[]), Compression::Uncompressed);
    }

    #[test]
    fn test_decompress_gzip_and_passthrough() -> anyhow::Result<()> {
        let mut out = String::new();
        decompress(io::Cursor::new(gzip(b"layer content")))?.read_to_string(&mut out)?;
        assert_eq!(out, "layer content");

        out.clear();
        decompress(io::Cursor::new(b"plain".to_vec()))?.read_to_string(&mut out)?;
        assert_eq!(out, "plain");
        Ok(())
    }

    #[test]
    fn test_decompress_zstd() -> anyhow::Result<()> {
        let mut frames = zstd::encode_all(&b"first "[..], 0)?;
        frames.extend(zstd::encode_all(&b"second"[..], 3)?);

        let mut out = String::new();
        decompress(io::Cursor::new(frames))?.read_to_string(&mut out)?;
        assert_eq!(out, "first second");

        // A bare header is not a frame.
        let mut truncated = decompress(io::Cursor::new(ZSTD_MAGIC.to_vec()))?;
        assert!(truncated.read_to_end(&mut Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_copy_hashed_feeds_both_writers() -> anyhow::Result<()> {
        let mut tee = TeeWriter::new(Vec::new(), Vec::new());
        let outcome = copy_hashed(io::Cursor::new(b"abc".to_vec()), &mut tee)?;

        assert_eq!(
            outcome.digest,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(outcome.size, 3);
        let (a, b) = tee.into_inner();
        assert_eq!(a, b"abc");
        assert_eq!(b, b"abc");
        Ok(())
    }

    #[test]
    fn test_open_fifo_writer_gives_up_without_reader() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = dir.path().join("layer.fifo");
        create_fifo(&fifo)?;

        let gone = CancellationToken::new();
        gone.cancel();
        assert!(open_fifo_writer(&fifo, &gone).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_layer_tees_decompressed_content() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = dir.path().join("layer.fifo");
        let tar = dir.path().join("layer.tar");
        create_fifo(&fifo)?;

        let reader = tokio::task::spawn_blocking({
            let fifo = fifo.clone();
            move || -> io::Result<Vec<u8>> {
                let mut content = Vec::new();
                File::open(fifo)?.read_to_end(&mut content)?;
                Ok(content)
            }
        });

        let content = b"0123456789abcdefghijklmnopqrstuvwxyz".repeat(100);
        let outcome = stream_layer(
            blob_stream(gzip(&content)),
            tar.clone(),
            fifo,
            CancellationToken::new(),
        )
        .await?;

        assert_eq!(reader.await??, content);
        assert_eq!(std::fs::read(&tar)?, content);
        assert_eq!(outcome.size, content.len() as u64);
        assert_eq!(
            outcome.digest,
            format!("sha256:{}", hex::encode(Sha256::digest(&content)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_layer_of_zstd_blob() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = dir.path().join("layer.fifo");
        let tar = dir.path().join("layer.tar");
        create_fifo(&fifo)?;

        let reader = tokio::task::spawn_blocking({
            let fifo = fifo.clone();
            move || -> io::Result<Vec<u8>> {
                let mut content = Vec::new();
                File::open(fifo)?.read_to_end(&mut content)?;
                Ok(content)
            }
        });

        let content = b"zstd layer ".repeat(500);
        let outcome = stream_layer(
            blob_stream(zstd::encode_all(&content[..], 0)?),
            tar.clone(),
            fifo,
            CancellationToken::new(),
        )
        .await?;

        assert_eq!(reader.await??, content);
        assert_eq!(std::fs::read(&tar)?, content);
        assert_eq!(
            outcome.digest,
            format!("sha256:{}", hex::encode(Sha256::digest(&content)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_layer_of_empty_blob() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = dir.path().join("layer.fifo");
        create_fifo(&fifo)?;

        let reader = tokio::task::spawn_blocking({
            let fifo = fifo.clone();
            move || -> io::Result<usize> { File::open(fifo)?.read_to_end(&mut Vec::new()) }
        });

        let outcome = stream_layer(
            blob_stream(Vec::new()),
            dir.path().join("layer.tar"),
            fifo,
            CancellationToken::new(),
        )
        .await?;

        assert_eq!(reader.await??, 0);
        assert_eq!(outcome.digest, EMPTY_SHA256);
        Ok(())
    }
}
