//! Incremental sha1 plumbing for uploads.

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use sha1::{Digest, Sha1};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use super::ByteStream;

/// The sha1 of `data` as 40 lowercase hex digits.
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

/// An in-memory accumulator for one part of a large file upload.
///
/// Bytes are appended up to the configured capacity while a running sha1 keeps pace,
/// so sealing a full buffer is free of a second pass over the data.
pub(crate) struct PartBuffer {
    buf: BytesMut,
    capacity: usize,
    hasher: Sha1,
}

impl PartBuffer {
    pub(crate) fn new(capacity: usize) -> PartBuffer {
        PartBuffer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            hasher: Sha1::new(),
        }
    }
    /// Move bytes from the front of `chunk` into the buffer until either the buffer is
    /// full or the chunk is empty.
    pub(crate) fn fill(&mut self, chunk: &mut Bytes) {
        let take = chunk.len().min(self.capacity - self.buf.len());
        let taken = chunk.split_to(take);
        self.hasher.update(&taken);
        self.buf.extend_from_slice(&taken);
    }
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }
    /// The buffered bytes and their hex digest.
    pub(crate) fn seal(self) -> (Bytes, String) {
        let digest = format!("{:x}", self.hasher.finalize());
        (self.buf.freeze(), digest)
    }
}

/// A stream adapter that forwards chunks unchanged while hashing them, then appends
/// the 40 hex digit sha1 as a final chunk.
///
/// This is the body of a `hex_digits_at_end` upload: b2 strips the trailer and
/// verifies it against the preceding bytes, so the stored file has the digest of the
/// content alone. The digest is memoized once the source is exhausted.
pub struct HashingReader<S> {
    inner: S,
    hasher: Sha1,
    digest: Option<String>,
    trailer_sent: bool,
}

impl<S> HashingReader<S> {
    pub fn new(inner: S) -> HashingReader<S> {
        HashingReader {
            inner,
            hasher: Sha1::new(),
            digest: None,
            trailer_sent: false,
        }
    }
    /// The digest of everything read so far, available once the source reached the
    /// end. Calling this after the end keeps returning the same digest.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl<S> Stream for HashingReader<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.trailer_sent {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.hasher.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                if this.digest.is_none() {
                    let computed = format!("{:x}", std::mem::take(&mut this.hasher).finalize());
                    this.digest = Some(computed);
                }
                let digest = this.digest.as_ref().unwrap().clone();
                this.trailer_sent = true;
                Poll::Ready(Some(Ok(Bytes::from(digest.into_bytes()))))
            }
        }
    }
}

/// Turn an [`AsyncRead`] into a stream of `Bytes` chunks.
///
/// [`AsyncRead`]: https://docs.rs/tokio/1/tokio/io/trait.AsyncRead.html
pub(crate) fn chunked<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(Chunked {
        reader,
        buf: BytesMut::with_capacity(CHUNK_SIZE),
    })
}

const CHUNK_SIZE: usize = 16 * 1024;

struct Chunked<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Stream for Chunked<R> {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.buf.capacity() == 0 {
            this.buf.reserve(CHUNK_SIZE);
        }
        this.buf.resize(CHUNK_SIZE, 0);
        let mut read_buf = ReadBuf::new(&mut this.buf[..]);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    Poll::Ready(None)
                } else {
                    let chunk = this.buf.split_to(n).freeze();
                    this.buf.clear();
                    Poll::Ready(Some(Ok(chunk)))
                }
            }
        }
    }
}
