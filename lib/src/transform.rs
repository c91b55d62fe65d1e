//! Primitives for stream transformations: decompression, digest hashing,
//! and digest verification on the fly.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use bytes::Bytes;
use futures_lite::Stream;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWrite;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{error::Error, mediatype::Compression, Digest};

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// Decompress the stream using gzip.
pub fn gzip(stream: impl Stream<Item = Chunk> + Send + 'static) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = GzipDecoder::new(reader);
    ReaderStream::new(inner)
}

/// Decompress the stream using zstd.
pub fn zstd(stream: impl Stream<Item = Chunk> + Send + 'static) -> impl Stream<Item = Chunk> + Send {
    let reader = StreamReader::new(stream);
    let inner = ZstdDecoder::new(reader);
    ReaderStream::new(inner)
}

/// Buffer the contents of a byte stream, resurfacing typed engine errors.
pub async fn collect(mut stream: impl Stream<Item = Chunk> + Unpin) -> color_eyre::Result<Vec<u8>> {
    use futures_lite::StreamExt;
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.map_err(crate::error::restore_io)?);
    }
    Ok(bytes)
}

/// Undo a layer's compression based on its media type.
pub fn decompress(
    stream: impl Stream<Item = Chunk> + Send + 'static,
    compression: Compression,
) -> Pin<Box<dyn Stream<Item = Chunk> + Send>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip | Compression::GzipFastest => Box::pin(gzip(stream)),
        Compression::Zstd => Box::pin(zstd(stream)),
    }
}

/// An [`AsyncWrite`] adapter that hashes every byte it forwards.
///
/// Used to compute layer diff-IDs (over the uncompressed tar) while the same
/// bytes continue into a compressor.
#[derive(Debug)]
pub struct HashWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W> HashWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Finish hashing, returning the digest and the inner writer.
    pub fn finish(self) -> (Digest, W) {
        (Digest::from_hash(self.hasher.finalize().to_vec()), self.inner)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.hasher.update(&buf[..written]);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A stream adapter that verifies bytes against an expected digest and size.
///
/// Bytes pass through untouched; when the inner stream ends, a mismatch in
/// either digest or byte count surfaces as one final error item. This is how
/// tampered blobs are caught at end of stream rather than buffered up front.
#[derive(Debug)]
pub struct VerifyStream<S> {
    inner: S,
    hasher: Option<Sha256>,
    expected: Digest,
    expected_size: i64,
    seen: u64,
    done: bool,
}

impl<S> VerifyStream<S> {
    pub fn new(inner: S, expected: Digest, expected_size: i64) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected,
            expected_size,
            seen: 0,
            done: false,
        }
    }

    fn verdict(&mut self) -> Option<io::Error> {
        let hasher = self.hasher.take()?;
        let actual = Digest::from_hash(hasher.finalize().to_vec());
        if actual != self.expected {
            return Some(
                Error::Integrity(format!(
                    "digest mismatch: expected {}, got {actual}",
                    self.expected
                ))
                .into_io(),
            );
        }
        if self.seen != self.expected_size as u64 {
            return Some(
                Error::Integrity(format!(
                    "size mismatch: expected {} bytes, got {}",
                    self.expected_size, self.seen
                ))
                .into_io(),
            );
        }
        None
    }
}

impl<S: Stream<Item = Chunk> + Unpin> Stream for VerifyStream<S> {
    type Item = Chunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&bytes);
                }
                this.seen += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                match this.verdict() {
                    Some(err) => Poll::Ready(Some(Err(err))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
