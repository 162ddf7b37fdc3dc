//! Uploading files to backblaze.
//!
//! Uploads go through the [`Bucket`] handle. A byte buffer or a stream whose length is
//! at most the part size is stored with a single `b2_upload_file` call; anything larger
//! is split into a [large file upload] whose parts are uploaded through a pool of
//! per-file upload urls. The split is decided as bytes arrive, so a stream of unknown
//! length that turns out small is still stored with a single call.
//!
//! [`Bucket`]: ../buckets/struct.Bucket.html
//! [large file upload]: https://www.backblaze.com/b2/docs/large_files.html

use bytes::Bytes;
use futures::stream::Stream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buckets::Bucket;
use crate::files::File;
use crate::B2Error;

pub(crate) mod engine;
pub(crate) mod hashing;
pub(crate) mod part;
pub(crate) mod pool;
pub(crate) mod single;

pub use self::hashing::HashingReader;

/// A stream of byte chunks fed into an upload.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static>>;

/// Percent-encoding for `X-Bz-File-Name` and download paths: everything except the
/// unreserved characters is escaped, but `/` is kept so file names keep their folder
/// structure.
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Percent-encoding for `X-Bz-Info-*` values and query parameters.
const VALUE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_SET).to_string()
}

pub(crate) fn encode_value(value: &str) -> String {
    utf8_percent_encode(value, VALUE_SET).to_string()
}

/// The maximum number of `X-Bz-Info-*` pairs b2 accepts on one file.
const MAX_FILE_INFO_PAIRS: usize = 10;

/// Options for a file upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// The content type stored with the file. Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// A precomputed sha1 of the content as 40 lowercase hex digits. When absent the
    /// digest is computed while the content is read.
    pub content_sha1: Option<String>,
    /// Custom `X-Bz-Info-*` pairs, keyed without the header prefix. At most ten pairs;
    /// keys are limited to `[A-Za-z0-9_-]`. Values are percent-encoded on the wire.
    pub file_info: HashMap<String, String>,
    /// The part size for large uploads. Defaults to the server's recommended part
    /// size; values below the server's absolute minimum are raised to it.
    pub part_size: Option<usize>,
    /// How many parts may be in flight at once. Defaults to 1.
    pub max_parallel_parts: usize,
}

impl Default for UploadOptions {
    fn default() -> UploadOptions {
        UploadOptions {
            content_type: None,
            content_sha1: None,
            file_info: HashMap::new(),
            part_size: None,
            max_parallel_parts: 1,
        }
    }
}

impl UploadOptions {
    /// Set the `src_last_modified_millis` info pair b2 uses to preserve modification
    /// times.
    pub fn last_modified_millis(mut self, millis: u64) -> UploadOptions {
        self.file_info
            .insert("src_last_modified_millis".to_string(), millis.to_string());
        self
    }
}

/// The validated header set of one upload, shared by the single-part and large-file
/// paths. The stored name and info values are raw; encoding happens when they are
/// placed in headers, since the json body of `b2_start_large_file` wants them raw.
#[derive(Debug, Clone)]
pub(crate) struct UploadTarget {
    pub(crate) file_name: String,
    pub(crate) content_type: String,
    pub(crate) file_info: Vec<(String, String)>,
}

impl UploadTarget {
    pub(crate) fn new(file_name: &str, options: &UploadOptions) -> Result<UploadTarget, B2Error> {
        if file_name.is_empty() {
            return Err(B2Error::usage("file names must not be empty"));
        }
        if options.file_info.len() > MAX_FILE_INFO_PAIRS {
            return Err(B2Error::usage(format!(
                "at most {} X-Bz-Info pairs are allowed",
                MAX_FILE_INFO_PAIRS
            )));
        }
        if let Some(sha1) = &options.content_sha1 {
            if sha1.len() != 40 || !sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(B2Error::usage("content_sha1 must be 40 hex digits"));
            }
        }
        let mut file_info: Vec<(String, String)> = Vec::with_capacity(options.file_info.len());
        for (key, value) in &options.file_info {
            let valid_key = !key.is_empty()
                && key
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
            if !valid_key {
                return Err(B2Error::usage(format!(
                    "invalid X-Bz-Info key {:?}: keys are limited to [A-Za-z0-9_-]",
                    key
                )));
            }
            file_info.push((key.clone(), value.clone()));
        }
        // A stable order keeps the request reproducible.
        file_info.sort();
        Ok(UploadTarget {
            file_name: file_name.to_string(),
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            file_info,
        })
    }

    pub(crate) fn encoded_file_name(&self) -> String {
        encode_file_name(&self.file_name)
    }

    /// The `X-Bz-Info-*` headers, values percent-encoded.
    pub(crate) fn info_headers(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.file_info
            .iter()
            .map(|(key, value)| (format!("X-Bz-Info-{}", key), encode_value(value)))
    }

    /// The `fileInfo` map for `b2_start_large_file`, values raw.
    pub(crate) fn info_map(&self) -> HashMap<&str, &str> {
        self.file_info
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }
}

/// The source of the bytes of an upload.
///
/// The variant decides the upload strategy up front: a buffer of at most the part size
/// is uploaded with a single call, while streams are consumed incrementally and only
/// commit to a large file once they outgrow one part.
pub enum UploadSource {
    /// A fully buffered source.
    Bytes(Bytes),
    /// A streaming source, with its length if known in advance.
    Stream {
        stream: ByteStream,
        content_length: Option<u64>,
    },
}

impl UploadSource {
    /// A source reading from a byte buffer.
    pub fn bytes(data: impl Into<Bytes>) -> UploadSource {
        UploadSource::Bytes(data.into())
    }
    /// A source reading from a stream of chunks.
    pub fn stream(
        stream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
        content_length: Option<u64>,
    ) -> UploadSource {
        UploadSource::Stream {
            stream: Box::pin(stream),
            content_length,
        }
    }
    /// A source reading from an [`AsyncRead`], e.g. a [`tokio::fs::File`].
    ///
    /// [`AsyncRead`]: https://docs.rs/tokio/1/tokio/io/trait.AsyncRead.html
    /// [`tokio::fs::File`]: https://docs.rs/tokio/1/tokio/fs/struct.File.html
    pub fn reader(
        reader: impl AsyncRead + Send + Unpin + 'static,
        content_length: Option<u64>,
    ) -> UploadSource {
        UploadSource::Stream {
            stream: hashing::chunked(reader),
            content_length,
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(data: Bytes) -> UploadSource {
        UploadSource::Bytes(data)
    }
}
impl From<Vec<u8>> for UploadSource {
    fn from(data: Vec<u8>) -> UploadSource {
        UploadSource::Bytes(data.into())
    }
}

/// A writable sink that uploads everything written to it.
///
/// Created by [`Bucket::upload_stream`]. The upload runs on a background task fed
/// through a bounded channel, so [`write`] naturally suspends while the engine is
/// waiting for upload capacity. Call [`finish`] to close the stream and wait for the
/// stored file's metadata; dropping the sink without finishing aborts the upload.
///
/// [`Bucket::upload_stream`]: ../buckets/struct.Bucket.html#method.upload_stream
/// [`write`]: #method.write
/// [`finish`]: #method.finish
pub struct UploadStream {
    tx: Option<mpsc::Sender<Bytes>>,
    task: JoinHandle<Result<File, B2Error>>,
}

impl UploadStream {
    pub(crate) fn spawn(
        bucket: Bucket,
        file_name: &str,
        options: UploadOptions,
    ) -> Result<UploadStream, B2Error> {
        let target = UploadTarget::new(file_name, &options)?;
        let (tx, rx) = mpsc::channel(4);
        let source: ByteStream = Box::pin(ChannelSource { rx });
        let task =
            tokio::spawn(engine::upload_prepared(bucket, target, options, source, None));
        Ok(UploadStream {
            tx: Some(tx),
            task,
        })
    }

    /// Append a chunk to the upload. Suspends while the engine has no buffer space,
    /// which is the backpressure that keeps memory use bounded.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), B2Error> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| B2Error::usage("write on a finished upload stream"))?;
        if tx.send(chunk).await.is_err() {
            // The engine is gone; its error is the interesting one.
            return Err(self.task_error().await);
        }
        Ok(())
    }

    /// Close the stream and wait for the upload to complete, returning the stored
    /// file's metadata.
    pub async fn finish(mut self) -> Result<File, B2Error> {
        self.tx.take();
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(B2Error::Cancelled),
            Err(err) => Err(B2Error::ApiInconsistency(format!(
                "upload task failed: {}",
                err
            ))),
        }
    }

    /// Abandon the upload. Any large file started on the server is cancelled
    /// best-effort.
    pub fn abort(mut self) {
        self.tx.take();
        self.task.abort();
    }

    async fn task_error(&mut self) -> B2Error {
        match (&mut self.task).await {
            Ok(Ok(_)) => B2Error::usage("upload completed before the stream was closed"),
            Ok(Err(err)) => err,
            Err(_) => B2Error::Cancelled,
        }
    }
}

impl Drop for UploadStream {
    fn drop(&mut self) {
        // An unfinished stream means the caller bailed out; do not commit a partial
        // upload.
        if self.tx.is_some() {
            self.task.abort();
        }
    }
}

struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for ChannelSource {
    type Item = Result<Bytes, std::io::Error>;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}
