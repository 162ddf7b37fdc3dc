//! Buckets and the operations hanging off them.
//!
//! A [`Bucket`] is a cheap handle created from either a bucket name or a bucket id;
//! the missing half is resolved with one `b2_list_buckets` call the first time it is
//! needed and remembered for the lifetime of the handle. The handle also owns the pool
//! of single-part upload urls for the bucket, so sequential uploads reuse urls instead
//! of minting one per call.
//!
//! [`Bucket`]: struct.Bucket.html

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::client::B2Client;
use crate::files::{download, DownloadStream, File, FileHandle, Files, ListFilesOptions};
use crate::upload::engine;
use crate::upload::pool::{PoolKind, UploadUrlPool};
use crate::upload::{UploadOptions, UploadSource, UploadStream};
use crate::{B2Error, BytesString};

/// The type of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BucketType {
    Public,
    Private,
    Snapshot,
    /// A type this crate does not know, kept for forward compatibility.
    Other,
}

impl BucketType {
    /// The string the b2 api uses for this bucket type.
    pub fn as_str(self) -> &'static str {
        match self {
            BucketType::Public => "allPublic",
            BucketType::Private => "allPrivate",
            BucketType::Snapshot => "snapshot",
            BucketType::Other => "other",
        }
    }
    fn from_api_str(s: &str) -> BucketType {
        match s {
            "allPublic" => BucketType::Public,
            "allPrivate" => BucketType::Private,
            "snapshot" => BucketType::Snapshot,
            _ => BucketType::Other,
        }
    }
}

impl Serialize for BucketType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BucketType {
    fn deserialize<D>(deserializer: D) -> Result<BucketType, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(BucketType::from_api_str(&s))
    }
}

/// The metadata record of a bucket, as returned by [`b2_list_buckets`].
///
/// [`b2_list_buckets`]: https://www.backblaze.com/b2/docs/b2_list_buckets.html
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BucketInfo {
    pub account_id: BytesString,
    pub bucket_id: BytesString,
    pub bucket_name: BytesString,
    pub bucket_type: BucketType,
    #[serde(default)]
    pub bucket_info: HashMap<String, String>,
    #[serde(default)]
    pub revision: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsRequest<'a> {
    account_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_name: Option<&'a str>,
}

#[derive(Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

/// List the buckets of the account, optionally filtered to one bucket id or name.
pub async fn list_buckets(client: &B2Client) -> Result<Vec<BucketInfo>, B2Error> {
    list_buckets_filtered(client, None, None).await
}

async fn list_buckets_filtered(
    client: &B2Client,
    bucket_id: Option<&str>,
    bucket_name: Option<&str>,
) -> Result<Vec<BucketInfo>, B2Error> {
    let auth = client.authorization();
    let response: ListBucketsResponse = client
        .api_call(
            "b2_list_buckets",
            &ListBucketsRequest {
                account_id: auth.account_id.as_str(),
                bucket_id,
                bucket_name,
            },
        )
        .await?;
    Ok(response.buckets)
}

struct BucketShared {
    bucket_id: OnceCell<BytesString>,
    bucket_name: OnceCell<BytesString>,
    pool: UploadUrlPool,
}

/// A handle to a bucket. Cloning is cheap; clones share the resolved identity and the
/// upload url pool.
#[derive(Clone)]
pub struct Bucket {
    client: B2Client,
    shared: Arc<BucketShared>,
}

impl Bucket {
    pub(crate) fn with_name(client: B2Client, name: &str) -> Bucket {
        Bucket {
            client,
            shared: Arc::new(BucketShared {
                bucket_id: OnceCell::new(),
                bucket_name: OnceCell::new_with(Some(BytesString::from(name))),
                pool: UploadUrlPool::new(PoolKind::SinglePart),
            }),
        }
    }
    pub(crate) fn with_id(client: B2Client, id: &str) -> Bucket {
        Bucket {
            client,
            shared: Arc::new(BucketShared {
                bucket_id: OnceCell::new_with(Some(BytesString::from(id))),
                bucket_name: OnceCell::new(),
                pool: UploadUrlPool::new(PoolKind::SinglePart),
            }),
        }
    }

    pub(crate) fn client(&self) -> &B2Client {
        &self.client
    }
    pub(crate) fn pool(&self) -> &UploadUrlPool {
        &self.shared.pool
    }

    /// The bucket id, resolved through `b2_list_buckets` on first use.
    pub async fn bucket_id(&self) -> Result<BytesString, B2Error> {
        let id = self
            .shared
            .bucket_id
            .get_or_try_init(|| async {
                let info = self.fetch_info().await?;
                let _ = self.shared.bucket_name.set(info.bucket_name.clone());
                Ok::<_, B2Error>(info.bucket_id)
            })
            .await?;
        Ok(id.clone())
    }

    /// The bucket name, resolved through `b2_list_buckets` on first use.
    pub async fn bucket_name(&self) -> Result<BytesString, B2Error> {
        let name = self
            .shared
            .bucket_name
            .get_or_try_init(|| async {
                let info = self.fetch_info().await?;
                let _ = self.shared.bucket_id.set(info.bucket_id.clone());
                Ok::<_, B2Error>(info.bucket_name)
            })
            .await?;
        Ok(name.clone())
    }

    /// The full metadata record of this bucket.
    pub async fn info(&self) -> Result<BucketInfo, B2Error> {
        self.fetch_info().await
    }

    async fn fetch_info(&self) -> Result<BucketInfo, B2Error> {
        let id = self.shared.bucket_id.get();
        let name = self.shared.bucket_name.get();
        let buckets = list_buckets_filtered(
            &self.client,
            id.map(BytesString::as_str),
            // The filters are mutually exclusive on the server side.
            if id.is_none() {
                name.map(BytesString::as_str)
            } else {
                None
            },
        )
        .await?;
        buckets.into_iter().next().ok_or_else(|| {
            let wanted = name
                .or(id)
                .map(|b| b.as_str().to_string())
                .unwrap_or_default();
            B2Error::FileNotFound(format!("bucket {}", wanted))
        })
    }

    /// Store a byte buffer under `file_name`.
    ///
    /// Buffers of at most the part size are stored with one `b2_upload_file` call;
    /// larger buffers become a large file upload.
    pub async fn upload(
        &self,
        file_name: &str,
        data: impl Into<Bytes>,
        options: UploadOptions,
    ) -> Result<File, B2Error> {
        engine::upload(self.clone(), file_name, UploadSource::Bytes(data.into()), options)
            .await
    }

    /// Store the content of an [`UploadSource`] under `file_name`.
    ///
    /// [`UploadSource`]: ../upload/enum.UploadSource.html
    pub async fn upload_source(
        &self,
        file_name: &str,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<File, B2Error> {
        engine::upload(self.clone(), file_name, source, options).await
    }

    /// Open a writable sink that stores whatever is written to it under `file_name`.
    ///
    /// The upload runs on a spawned task, so this must be called in the context of a
    /// tokio runtime.
    pub fn upload_stream(
        &self,
        file_name: &str,
        options: UploadOptions,
    ) -> Result<UploadStream, B2Error> {
        UploadStream::spawn(self.clone(), file_name, options)
    }

    /// Download the file named `file_name` from this bucket.
    pub async fn download(&self, file_name: &str) -> Result<DownloadStream, B2Error> {
        let bucket_name = self.bucket_name().await?;
        download::by_name(&self.client, bucket_name.as_str(), file_name, None).await
    }

    /// A handle to the file named `file_name`.
    pub fn file(&self, file_name: &str) -> FileHandle {
        FileHandle::from_name(self.clone(), file_name)
    }

    /// A handle to the file with the given id.
    pub fn file_by_id(&self, file_id: &str) -> FileHandle {
        FileHandle::from_id(self.clone(), file_id)
    }

    /// Walk the files of this bucket in name order.
    pub fn files(&self, options: ListFilesOptions) -> Files {
        Files::new(self.clone(), options)
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("bucket_id", &self.shared.bucket_id.get())
            .field("bucket_name", &self.shared.bucket_name.get())
            .finish()
    }
}
