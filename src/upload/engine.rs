//! The streaming upload engine.
//!
//! The engine ingests a stream of byte chunks and decides, as the bytes arrive, how
//! they are stored. Everything up to one part size is buffered; the first byte beyond
//! it starts a large file on the server, seals the buffer as part 1, and from then on
//! every filled buffer is uploaded as the next part. A source that ends within the
//! first buffer never touches the large file api at all, including a source of exactly
//! one part size.
//!
//! Parts are numbered in input order as buffers seal, uploads of sealed parts run
//! concurrently up to the configured limit, and the sha1 array handed to
//! `b2_finish_large_file` is assembled by part number regardless of completion order.

use bytes::Bytes;
use futures::stream::{self, FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use super::hashing::{self, PartBuffer};
use super::part::{self, MAX_PART_NUMBER};
use super::pool::{PoolKind, UploadUrlPool};
use super::single;
use super::{ByteStream, UploadOptions, UploadSource, UploadTarget};
use crate::auth::B2Authorization;
use crate::buckets::Bucket;
use crate::client::B2Client;
use crate::files::File;
use crate::{B2Error, BytesString};

impl UploadOptions {
    /// The part size in effect: the caller's choice clamped to the server's absolute
    /// minimum, or the server's recommended size.
    pub(crate) fn resolved_part_size(&self, auth: &B2Authorization) -> usize {
        match self.part_size {
            Some(size) => size.max(auth.absolute_minimum_part_size),
            None => auth.recommended_part_size,
        }
    }
}

/// Upload from any source, deciding single-part versus large file at entry.
pub(crate) async fn upload(
    bucket: Bucket,
    file_name: &str,
    source: UploadSource,
    options: UploadOptions,
) -> Result<File, B2Error> {
    let target = UploadTarget::new(file_name, &options)?;
    match source {
        UploadSource::Bytes(bytes) => {
            let auth = bucket.client().authorization();
            let part_size = options.resolved_part_size(&auth);
            if bytes.len() <= part_size {
                let sha1 = options
                    .content_sha1
                    .clone()
                    .unwrap_or_else(|| hashing::sha1_hex(&bytes));
                let bucket_id = bucket.bucket_id().await?;
                return single::upload_buffer(
                    bucket.client(),
                    bucket.pool(),
                    &bucket_id,
                    &target,
                    bytes,
                    &sha1,
                )
                .await;
            }
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(bytes)];
            let source: ByteStream = Box::pin(stream::iter(chunks));
            upload_prepared(bucket, target, options, source, None).await
        }
        UploadSource::Stream {
            stream,
            content_length,
        } => upload_prepared(bucket, target, options, stream, content_length).await,
    }
}

/// Upload a stream with a validated header set.
///
/// A sized stream that fits one part skips the engine and streams straight into a
/// single `b2_upload_file` call, in deferred-hash mode when no sha1 was supplied.
pub(crate) async fn upload_prepared(
    bucket: Bucket,
    target: UploadTarget,
    options: UploadOptions,
    source: ByteStream,
    content_length: Option<u64>,
) -> Result<File, B2Error> {
    let auth = bucket.client().authorization();
    let part_size = options.resolved_part_size(&auth);
    if let Some(length) = content_length {
        if length <= part_size as u64 {
            let bucket_id = bucket.bucket_id().await?;
            return single::upload_stream_body(
                bucket.client(),
                bucket.pool(),
                &bucket_id,
                &target,
                source,
                length,
                options.content_sha1.clone(),
            )
            .await;
        }
    }
    Engine::new(bucket, target, options, source, part_size).run().await
}

type PartFuture =
    Pin<Box<dyn Future<Output = Result<(usize, String), B2Error>> + Send + 'static>>;

struct Engine {
    bucket: Bucket,
    client: B2Client,
    target: UploadTarget,
    part_size: usize,
    max_parallel: usize,
    precomputed_sha1: Option<String>,
    source: ByteStream,
    buffer: PartBuffer,
    large: Option<Arc<LargeFileContext>>,
    inflight: FuturesUnordered<PartFuture>,
    part_sha1s: Vec<Option<String>>,
    next_part: usize,
}

impl Engine {
    fn new(
        bucket: Bucket,
        target: UploadTarget,
        options: UploadOptions,
        source: ByteStream,
        part_size: usize,
    ) -> Engine {
        let client = bucket.client().clone();
        Engine {
            bucket,
            client,
            target,
            part_size,
            max_parallel: options.max_parallel_parts.max(1),
            precomputed_sha1: options.content_sha1,
            source,
            buffer: PartBuffer::new(part_size),
            large: None,
            inflight: FuturesUnordered::new(),
            part_sha1s: Vec::new(),
            next_part: 1,
        }
    }

    async fn run(mut self) -> Result<File, B2Error> {
        match self.drive().await {
            Ok(file) => Ok(file),
            Err(err) => {
                // Dispatched parts may still be in flight on the server side; drop
                // them and cancel the large file best-effort.
                self.inflight.clear();
                if let Some(ctx) = self.large.clone() {
                    warn!(file_id = %ctx.file_id, error = %err, "upload failed, cancelling large file");
                    if let Err(cancel_err) = ctx.cancel(&self.client).await {
                        warn!(error = %cancel_err, "b2_cancel_large_file failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<File, B2Error> {
        loop {
            tokio::select! {
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => {
                    let (number, sha1) = done?;
                    self.record(number, sha1);
                }
                chunk = self.source.next() => match chunk {
                    Some(chunk) => self.feed(chunk?).await?,
                    None => break,
                },
            }
        }

        if self.large.is_none() {
            // The whole source fit in the first buffer: stay single-part.
            let buffer = mem::replace(&mut self.buffer, PartBuffer::new(1));
            let (bytes, digest) = buffer.seal();
            let sha1 = self.precomputed_sha1.take().unwrap_or(digest);
            let bucket_id = self.bucket.bucket_id().await?;
            return single::upload_buffer(
                &self.client,
                self.bucket.pool(),
                &bucket_id,
                &self.target,
                bytes,
                &sha1,
            )
            .await;
        }

        // An input length that is an exact multiple of the part size leaves an empty
        // final buffer behind; there is no such part.
        if !self.buffer.is_empty() {
            self.dispatch_sealed().await?;
        }
        while let Some(done) = self.inflight.next().await {
            let (number, sha1) = done?;
            self.record(number, sha1);
        }

        let ctx = self.large.clone().unwrap();
        let mut part_sha1_array = Vec::with_capacity(self.part_sha1s.len());
        for (index, sha1) in self.part_sha1s.drain(..).enumerate() {
            match sha1 {
                Some(sha1) => part_sha1_array.push(sha1),
                None => {
                    return Err(B2Error::ApiInconsistency(format!(
                        "no sha1 recorded for part {}",
                        index + 1
                    )))
                }
            }
        }
        debug!(file_id = %ctx.file_id, parts = part_sha1_array.len(), "finishing large file");
        ctx.finish(&self.client, &part_sha1_array).await
    }

    /// Append a chunk, sealing and dispatching the buffer whenever it is full and
    /// more input exists. Dispatch is deliberately lazy: a buffer that fills on the
    /// final byte of the source is never dispatched here, which keeps an input of
    /// exactly one part size on the single-part path.
    async fn feed(&mut self, mut chunk: Bytes) -> Result<(), B2Error> {
        while !chunk.is_empty() {
            if self.buffer.is_full() {
                self.dispatch_sealed().await?;
            }
            self.buffer.fill(&mut chunk);
        }
        Ok(())
    }

    /// Seal the current buffer as the next part and start uploading it, waiting for
    /// an upload slot first. The wait is the backpressure that stalls the producer.
    async fn dispatch_sealed(&mut self) -> Result<(), B2Error> {
        while self.inflight.len() >= self.max_parallel {
            match self.inflight.next().await {
                Some(done) => {
                    let (number, sha1) = done?;
                    self.record(number, sha1);
                }
                None => break,
            }
        }
        if self.large.is_none() {
            let bucket_id = self.bucket.bucket_id().await?;
            let ctx = LargeFileContext::start(
                &self.client,
                &bucket_id,
                &self.target,
                self.precomputed_sha1.as_deref(),
            )
            .await?;
            debug!(file_id = %ctx.file_id, file_name = %self.target.file_name, "started large file");
            self.large = Some(Arc::new(ctx));
        }

        let number = self.next_part;
        if number > MAX_PART_NUMBER {
            return Err(B2Error::usage(format!(
                "upload needs more than {} parts; raise part_size",
                MAX_PART_NUMBER
            )));
        }
        self.next_part += 1;

        let buffer = mem::replace(&mut self.buffer, PartBuffer::new(self.part_size));
        let (bytes, sha1) = buffer.seal();
        let client = self.client.clone();
        let ctx = self.large.clone().unwrap();
        self.inflight.push(Box::pin(async move {
            part::upload_part(&client, &ctx.pool, &ctx.file_id, number, bytes, &sha1)
                .await?;
            Ok((number, sha1))
        }));
        Ok(())
    }

    fn record(&mut self, number: usize, sha1: String) {
        if self.part_sha1s.len() < number {
            self.part_sha1s.resize(number, None);
        }
        self.part_sha1s[number - 1] = Some(sha1);
    }
}

/// A large file being assembled on the server, together with the pool of part upload
/// urls scoped to it. Lives from `b2_start_large_file` until finish or cancel.
pub(crate) struct LargeFileContext {
    pub(crate) file_id: BytesString,
    pub(crate) pool: UploadUrlPool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
    file_info: HashMap<&'a str, &'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelLargeFileRequest<'a> {
    file_id: &'a str,
}

/// The response of `b2_cancel_large_file`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelLargeFileResponse {
    pub file_id: String,
    pub file_name: String,
    pub bucket_id: String,
    pub account_id: String,
}

impl LargeFileContext {
    /// `b2_start_large_file`. A caller-supplied whole-file sha1 rides along as the
    /// conventional `large_file_sha1` info pair.
    pub(crate) async fn start(
        client: &B2Client,
        bucket_id: &BytesString,
        target: &UploadTarget,
        large_file_sha1: Option<&str>,
    ) -> Result<LargeFileContext, B2Error> {
        let mut file_info = target.info_map();
        if let Some(sha1) = large_file_sha1 {
            file_info.insert("large_file_sha1", sha1);
        }
        let file: File = client
            .api_call(
                "b2_start_large_file",
                &StartLargeFileRequest {
                    bucket_id: bucket_id.as_str(),
                    file_name: &target.file_name,
                    content_type: &target.content_type,
                    file_info,
                },
            )
            .await?;
        Ok(LargeFileContext {
            file_id: BytesString::from(file.file_id),
            pool: UploadUrlPool::new(PoolKind::Part),
        })
    }

    /// `b2_finish_large_file`. The sha1 array must be in part-number order.
    pub(crate) async fn finish(
        &self,
        client: &B2Client,
        part_sha1_array: &[String],
    ) -> Result<File, B2Error> {
        client
            .api_call(
                "b2_finish_large_file",
                &FinishLargeFileRequest {
                    file_id: self.file_id.as_str(),
                    part_sha1_array,
                },
            )
            .await
    }

    /// `b2_cancel_large_file`.
    pub(crate) async fn cancel(
        &self,
        client: &B2Client,
    ) -> Result<CancelLargeFileResponse, B2Error> {
        client
            .api_call(
                "b2_cancel_large_file",
                &CancelLargeFileRequest {
                    file_id: self.file_id.as_str(),
                },
            )
            .await
    }
}
