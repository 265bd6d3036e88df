//! Streaming layer digests
//!
//! A compressed layer has two identities: the blob digest of its gzip bytes
//! and the diff ID of the tar stream inside. Both are computed in one pass
//! while the bytes are forwarded to their destination. The compressed side
//! is hashed where the bytes flow; a second thread decompresses a copy fed
//! through a bounded pipe, hashes the tar stream and tracks the newest
//! entry modification time.

use crate::error::{RegistryError, Result};
use crate::image::digest::Digest;
use crate::registry::BlobStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use futures_util::StreamExt;
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, mpsc};
use tokio::io::AsyncReadExt;

/// Chunks buffered between the copying side and the decompressing side
const PIPE_DEPTH: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCopyResult {
    /// Digest of the uncompressed tar stream (diff ID)
    pub layer_digest: Digest,
    /// Digest of the bytes as copied
    pub blob_digest: Digest,
    /// Newest modification time of any tar entry
    pub mod_time: Option<DateTime<Utc>>,
    /// Compressed bytes copied
    pub size: u64,
}

/// Reader over chunks arriving on a channel; EOF once every sender is gone
struct PipeReader<C> {
    chunks: C,
    current: Bytes,
}

trait ChunkSource {
    fn next_chunk(&mut self) -> Option<Bytes>;
}

impl ChunkSource for mpsc::Receiver<Bytes> {
    fn next_chunk(&mut self) -> Option<Bytes> {
        self.recv().ok()
    }
}

impl ChunkSource for tokio::sync::mpsc::Receiver<Bytes> {
    fn next_chunk(&mut self) -> Option<Bytes> {
        self.blocking_recv()
    }
}

impl<C: ChunkSource> Read for PipeReader<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.chunks.next_chunk() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// Counts and hashes everything read through it
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Decompress `compressed`, returning the diff ID and newest entry mtime
fn diff_id<R: Read>(compressed: R) -> Result<(Digest, Option<DateTime<Utc>>)> {
    let mut reader = HashingReader {
        inner: MultiGzDecoder::new(compressed),
        hasher: Sha256::new(),
    };
    let mut newest: Option<u64> = None;
    {
        let mut archive = tar::Archive::new(&mut reader);
        let entries = archive
            .entries()
            .map_err(|e| RegistryError::Parse(format!("layer is not a tar archive: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::Parse(format!("invalid tar entry: {}", e)))?;
            if let Ok(mtime) = entry.header().mtime() {
                newest = Some(newest.map_or(mtime, |n| n.max(mtime)));
            }
        }
    }
    // Trailing padding after the end-of-archive marker is part of the diff ID
    io::copy(&mut reader, &mut io::sink())?;

    let mod_time = newest
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    Ok((Digest::from_hasher(reader.hasher), mod_time))
}

/// Copy a gzipped layer from `src` into `dst`, computing both digests.
///
/// Blocking; async callers use [`digest_stream`] or run this on
/// `spawn_blocking`.
pub fn digest_copy<W: Write, R: Read>(dst: &mut W, mut src: R) -> Result<DigestCopyResult> {
    let (tx, rx) = mpsc::sync_channel::<Bytes>(PIPE_DEPTH);
    let decoder = std::thread::spawn(move || {
        diff_id(PipeReader {
            chunks: rx,
            current: Bytes::new(),
        })
    });

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let copied: Result<()> = (|| {
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            hasher.update(&chunk);
            dst.write_all(&chunk)?;
            size += n as u64;
            // A closed pipe means decoding already failed; the error is
            // reported once the decoder is joined
            let _ = tx.send(chunk);
        }
    })();
    drop(tx);

    let decoded = decoder
        .join()
        .map_err(|_| RegistryError::Io("layer decoder thread panicked".to_string()))?;
    copied?;
    let (layer_digest, mod_time) = decoded?;
    Ok(DigestCopyResult {
        layer_digest,
        blob_digest: Digest::from_hasher(hasher),
        mod_time,
        size,
    })
}

#[derive(Default)]
struct BlobState {
    hasher: Sha256,
    size: u64,
}

/// Digests of a stream returned by [`digest_stream`], available once the
/// stream has been consumed and dropped
pub struct PendingDigest {
    blob: Arc<Mutex<BlobState>>,
    decoder: tokio::task::JoinHandle<Result<(Digest, Option<DateTime<Utc>>)>>,
}

impl PendingDigest {
    pub async fn finish(self) -> Result<DigestCopyResult> {
        let (layer_digest, mod_time) = self.decoder.await??;
        let state = std::mem::take(
            &mut *self
                .blob
                .lock()
                .map_err(|_| RegistryError::Io("digest state lock poisoned".to_string()))?,
        );
        Ok(DigestCopyResult {
            layer_digest,
            blob_digest: Digest::from_hasher(state.hasher),
            mod_time,
            size: state.size,
        })
    }
}

/// Wrap `stream` so every chunk passing through is digested. Forward the
/// returned stream to a blob writer, then call [`PendingDigest::finish`].
pub fn digest_stream(stream: BlobStream) -> (BlobStream, PendingDigest) {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(PIPE_DEPTH);
    let decoder = tokio::task::spawn_blocking(move || {
        diff_id(PipeReader {
            chunks: rx,
            current: Bytes::new(),
        })
    });
    let blob = Arc::new(Mutex::new(BlobState::default()));

    let state = blob.clone();
    let tee = stream.then(move |chunk| {
        let tx = tx.clone();
        let state = state.clone();
        async move {
            if let Ok(bytes) = &chunk {
                if let Ok(mut state) = state.lock() {
                    state.hasher.update(bytes);
                    state.size += bytes.len() as u64;
                }
                let _ = tx.send(bytes.clone()).await;
            }
            chunk
        }
    });
    (Box::pin(tee), PendingDigest { blob, decoder })
}

/// Read `reader` to the end as a blob stream
pub fn reader_stream<R>(reader: R) -> BlobStream
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    Box::pin(futures::stream::try_unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), reader)))
    }))
}

pub fn file_stream(file: tokio::fs::File) -> BlobStream {
    reader_stream(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::digest::{EMPTY_LAYER_DIFF_ID, GZIPPED_EMPTY_LAYER, GZIPPED_EMPTY_LAYER_DIGEST};
    use crate::registry::{read_stream, stream_from_bytes};
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn layer(files: &[(&str, &[u8], u64)]) -> (Vec<u8>, Vec<u8>) {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content, mtime) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(*mtime);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        (tar, encoder.finish().unwrap())
    }

    #[test]
    fn digests_match_raw_and_decompressed_content() {
        let big = vec![b'x'; 300 * 1024];
        let (tar, gz) = layer(&[("etc/motd", b"hello", 1_600_000_000), ("data.bin", &big, 1_700_000_000)]);

        let mut copy = Vec::new();
        let result = digest_copy(&mut copy, gz.as_slice()).unwrap();
        assert_eq!(copy, gz);
        assert_eq!(result.blob_digest, Digest::from_bytes(&gz));
        assert_eq!(result.layer_digest, Digest::from_bytes(&tar));
        assert_eq!(result.size, gz.len() as u64);
        assert_eq!(result.mod_time.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn empty_layer_has_known_digests() {
        let result = digest_copy(&mut io::sink(), GZIPPED_EMPTY_LAYER).unwrap();
        assert_eq!(result.blob_digest.as_str(), GZIPPED_EMPTY_LAYER_DIGEST);
        assert_eq!(result.layer_digest.as_str(), EMPTY_LAYER_DIFF_ID);
    }

    #[test]
    fn diff_id_covers_every_gzip_member() {
        let (tar, _) = layer(&[("first.txt", b"one", 10), ("second.txt", b"two", 20)]);
        let (head, tail) = tar.split_at(1024);
        let mut gz = Vec::new();
        for part in [head, tail] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(part).unwrap();
            gz.extend(encoder.finish().unwrap());
        }

        let result = digest_copy(&mut io::sink(), gz.as_slice()).unwrap();
        assert_eq!(result.blob_digest, Digest::from_bytes(&gz));
        assert_eq!(result.layer_digest, Digest::from_bytes(&tar));
        assert_eq!(result.mod_time.map(|t| t.timestamp()), Some(20));
    }

    #[test]
    fn rejects_content_that_is_not_gzip() {
        assert!(digest_copy(&mut io::sink(), &b"plain text, not a layer"[..]).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_digests_match_blocking_copy() {
        let (tar, gz) = layer(&[("a.txt", b"streamed", 42)]);
        let (stream, pending) = digest_stream(stream_from_bytes(Bytes::from(gz.clone())));
        let forwarded = read_stream(stream).await.unwrap();
        let result = pending.finish().await.unwrap();

        assert_eq!(forwarded.as_ref(), gz.as_slice());
        assert_eq!(result.blob_digest, Digest::from_bytes(&gz));
        assert_eq!(result.layer_digest, Digest::from_bytes(&tar));
    }
}
