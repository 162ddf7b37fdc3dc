//! Access to files on backblaze.
//!
//! A [`FileHandle`] names a file in a bucket by file name, by file id, or by a full
//! metadata record; whichever half is missing is resolved lazily with one api call the
//! first time it is needed. [`Files`] walks a bucket listing page by page.
//!
//! [`FileHandle`]: struct.FileHandle.html
//! [`Files`]: struct.Files.html

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::buckets::Bucket;
use crate::upload::{UploadOptions, UploadStream};
use crate::{B2Error, BytesString};

mod action;
pub mod download;
pub use self::action::Action;
pub use self::download::DownloadStream;

/// Describes a file on backblaze.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct File {
    pub account_id: Option<BytesString>,
    pub action: Action,
    pub bucket_id: String,
    pub content_length: u64,
    /// `None` for large files; their whole-file digest, when known, lives in the
    /// `large_file_sha1` info pair instead.
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub file_id: String,
    #[serde(default)]
    pub file_info: HashMap<String, String>,
    pub file_name: String,
    pub upload_timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetFileInfoRequest<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListFileNamesRequest<'a> {
    pub bucket_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<&'a str>,
}

/// One page of a file listing.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListFileNamesResponse {
    pub files: Vec<File>,
    /// The name to continue from, or `None` when the listing is exhausted.
    pub next_file_name: Option<String>,
}

/// Options for listing the files of a bucket.
#[derive(Debug, Clone)]
pub struct ListFilesOptions {
    /// Only files whose names start with this prefix are returned.
    pub prefix: Option<String>,
    /// Folder-style listing delimiter, usually `"/"`.
    pub delimiter: Option<String>,
    /// The name to start from.
    pub start_file_name: Option<String>,
    /// How many files to fetch per api call. B2 bills requests above 1000 files as
    /// multiple transactions.
    pub batch_size: usize,
}

impl Default for ListFilesOptions {
    fn default() -> ListFilesOptions {
        ListFilesOptions {
            prefix: None,
            delimiter: None,
            start_file_name: None,
            batch_size: 1000,
        }
    }
}

/// A lazy walk over the files of a bucket, in name order.
///
/// Created by [`Bucket::files`]. Pages of `b2_list_file_names` are fetched as the walk
/// progresses; the sequence is finite and cannot be restarted.
///
/// [`Bucket::files`]: ../buckets/struct.Bucket.html#method.files
pub struct Files {
    bucket: Bucket,
    options: ListFilesOptions,
    buffer: VecDeque<File>,
    cursor: Option<String>,
    exhausted: bool,
}

impl Files {
    pub(crate) fn new(bucket: Bucket, options: ListFilesOptions) -> Files {
        Files {
            cursor: options.start_file_name.clone(),
            bucket,
            options,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The next file, or `None` once the bucket is exhausted. An error ends the walk.
    pub async fn next(&mut self) -> Option<Result<FileHandle, B2Error>> {
        loop {
            if let Some(file) = self.buffer.pop_front() {
                return Some(Ok(FileHandle::from_metadata(self.bucket.clone(), file)));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_page().await {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<(), B2Error> {
        let bucket_id = self.bucket.bucket_id().await?;
        let response: ListFileNamesResponse = self
            .bucket
            .client()
            .api_call(
                "b2_list_file_names",
                &ListFileNamesRequest {
                    bucket_id: bucket_id.as_str(),
                    start_file_name: self.cursor.as_deref(),
                    max_file_count: Some(self.options.batch_size),
                    prefix: self.options.prefix.as_deref(),
                    delimiter: self.options.delimiter.as_deref(),
                },
            )
            .await?;
        self.buffer.extend(response.files);
        match response.next_file_name {
            Some(next) => self.cursor = Some(next),
            None => self.exhausted = true,
        }
        Ok(())
    }
}

/// A file in a bucket, identified by name, by id, or by a full metadata record.
///
/// Missing identity is resolved lazily: a handle created from a name looks up its file
/// id with a single-item `b2_list_file_names` the first time [`stat`] or an id-based
/// operation needs it. The handle is caller-owned and not meant to be shared across
/// tasks.
///
/// [`stat`]: #method.stat
pub struct FileHandle {
    bucket: Bucket,
    file_name: Option<String>,
    file_id: Option<BytesString>,
    metadata: Option<File>,
}

impl FileHandle {
    pub(crate) fn from_name(bucket: Bucket, file_name: &str) -> FileHandle {
        FileHandle {
            bucket,
            file_name: Some(file_name.to_string()),
            file_id: None,
            metadata: None,
        }
    }
    pub(crate) fn from_id(bucket: Bucket, file_id: &str) -> FileHandle {
        FileHandle {
            bucket,
            file_name: None,
            file_id: Some(BytesString::from(file_id)),
            metadata: None,
        }
    }
    pub(crate) fn from_metadata(bucket: Bucket, metadata: File) -> FileHandle {
        FileHandle {
            bucket,
            file_name: Some(metadata.file_name.clone()),
            file_id: Some(BytesString::from(metadata.file_id.clone())),
            metadata: Some(metadata),
        }
    }

    /// The file name, if this handle knows it without an api call.
    pub fn name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// The file's metadata, fetched on first use.
    pub async fn stat(&mut self) -> Result<&File, B2Error> {
        if self.metadata.is_none() {
            let metadata = match (&self.file_id, &self.file_name) {
                (Some(id), _) => self.get_file_info(id.clone()).await?,
                (None, Some(name)) => self.resolve_by_name(name.clone()).await?,
                (None, None) => {
                    return Err(B2Error::usage("file handle has neither name nor id"))
                }
            };
            self.file_name = Some(metadata.file_name.clone());
            self.file_id = Some(BytesString::from(metadata.file_id.clone()));
            self.metadata = Some(metadata);
        }
        Ok(self.metadata.as_ref().unwrap())
    }

    /// The file id, resolving it from the name if necessary.
    pub async fn file_id(&mut self) -> Result<BytesString, B2Error> {
        if let Some(id) = &self.file_id {
            return Ok(id.clone());
        }
        self.stat().await?;
        Ok(self.file_id.clone().unwrap())
    }

    /// Download the file's content as a stream of chunks.
    pub async fn read_stream(&mut self) -> Result<DownloadStream, B2Error> {
        self.read(None).await
    }

    /// Download the byte range `start..=end` of the file.
    pub async fn read_range(
        &mut self,
        start: u64,
        end: u64,
    ) -> Result<DownloadStream, B2Error> {
        self.read(Some((start, end))).await
    }

    async fn read(&mut self, range: Option<(u64, u64)>) -> Result<DownloadStream, B2Error> {
        let client = self.bucket.client().clone();
        match (&self.file_id, &self.file_name) {
            (Some(id), _) => download::by_id(&client, id.as_str(), range).await,
            (None, Some(name)) => {
                let bucket_name = self.bucket.bucket_name().await?;
                download::by_name(&client, bucket_name.as_str(), name, range).await
            }
            (None, None) => Err(B2Error::usage("file handle has neither name nor id")),
        }
    }

    /// Open a writable sink that stores whatever is written to it under this handle's
    /// name. Requires a handle created from a name.
    pub fn write_stream(&self, options: UploadOptions) -> Result<UploadStream, B2Error> {
        match &self.file_name {
            Some(name) => self.bucket.upload_stream(name, options),
            None => Err(B2Error::usage(
                "writing requires a file handle created from a name",
            )),
        }
    }

    async fn get_file_info(&self, file_id: BytesString) -> Result<File, B2Error> {
        self.bucket
            .client()
            .api_call(
                "b2_get_file_info",
                &GetFileInfoRequest {
                    file_id: file_id.as_str(),
                },
            )
            .await
    }

    /// Resolve a name to its newest file record with a single-item listing. The list
    /// api returns the lexicographically next name when the exact one is absent, so
    /// the returned record is checked against the requested name.
    async fn resolve_by_name(&self, name: String) -> Result<File, B2Error> {
        let bucket_id = self.bucket.bucket_id().await?;
        let response: ListFileNamesResponse = self
            .bucket
            .client()
            .api_call(
                "b2_list_file_names",
                &ListFileNamesRequest {
                    bucket_id: bucket_id.as_str(),
                    start_file_name: Some(&name),
                    max_file_count: Some(1),
                    prefix: None,
                    delimiter: None,
                },
            )
            .await?;
        match response.files.into_iter().next() {
            Some(file) if file.file_name == name => Ok(file),
            _ => Err(B2Error::FileNotFound(name)),
        }
    }
}
