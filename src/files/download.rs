//! Downloading files from backblaze.
//!
//! Both download entry points go through the executor's retry policy until the status
//! line is good, then hand back a [`DownloadStream`] that yields the body chunk by
//! chunk. A failure while the body is streaming is surfaced directly; at that point
//! part of the content has already been observed, so retrying is the caller's call.
//!
//! [`DownloadStream`]: struct.DownloadStream.html

use bytes::Bytes;
use futures::stream::Stream;
use http::header::{HeaderMap, AUTHORIZATION, RANGE, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use hyper::Body;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::client::B2Client;
use crate::upload::{encode_file_name, encode_value};
use crate::B2Error;

/// A file being downloaded.
///
/// The headers carry the file metadata b2 attaches to downloads (`X-Bz-File-Id`,
/// `X-Bz-Content-Sha1`, the `X-Bz-Info-*` pairs). The content arrives by polling this
/// as a [`Stream`] of [`Bytes`], or in one piece through [`collect`].
///
/// [`Stream`]: https://docs.rs/futures/0.3/futures/stream/trait.Stream.html
/// [`Bytes`]: https://docs.rs/bytes/1/bytes/struct.Bytes.html
/// [`collect`]: #method.collect
pub struct DownloadStream {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl DownloadStream {
    pub(crate) fn new(response: hyper::Response<Body>) -> DownloadStream {
        let (parts, body) = response.into_parts();
        DownloadStream {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    /// The response status: 200, or 206 for a ranged download.
    pub fn status(&self) -> StatusCode {
        self.status
    }
    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    /// The length of the content being delivered.
    pub fn content_length(&self) -> Option<u64> {
        self.header_str("Content-Length")?.parse().ok()
    }
    pub fn content_type(&self) -> Option<&str> {
        self.header_str("Content-Type")
    }
    /// The stored sha1 of the file, from `X-Bz-Content-Sha1`.
    pub fn content_sha1(&self) -> Option<&str> {
        self.header_str("X-Bz-Content-Sha1")
    }
    /// The file id, from `X-Bz-File-Id`.
    pub fn file_id(&self) -> Option<&str> {
        self.header_str("X-Bz-File-Id")
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Read the remaining content into one buffer.
    pub async fn collect(self) -> Result<Vec<u8>, B2Error> {
        let bytes = hyper::body::to_bytes(self.body).await?;
        Ok(bytes.to_vec())
    }
}

impl Stream for DownloadStream {
    type Item = Result<Bytes, B2Error>;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().body)
            .poll_next(cx)
            .map(|chunk| chunk.map(|result| result.map_err(B2Error::from)))
    }
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("status", &self.status)
            .field("content_length", &self.content_length())
            .finish()
    }
}

/// `GET {downloadUrl}/file/{bucketName}/{fileName}`.
pub(crate) async fn by_name(
    client: &B2Client,
    bucket_name: &str,
    file_name: &str,
    range: Option<(u64, u64)>,
) -> Result<DownloadStream, B2Error> {
    let path = format!(
        "/file/{}/{}",
        encode_value(bucket_name),
        encode_file_name(file_name)
    );
    let user_agent = client.user_agent();
    let response = client
        .download_request(|auth| {
            let uri: Uri = format!("{}{}", auth.download_url, path).parse()?;
            build(uri, auth.auth_token(), user_agent.clone(), range)
        })
        .await?;
    Ok(DownloadStream::new(response))
}

/// `GET {downloadUrl}/b2api/v2/b2_download_file_by_id?fileId=...`.
pub(crate) async fn by_id(
    client: &B2Client,
    file_id: &str,
    range: Option<(u64, u64)>,
) -> Result<DownloadStream, B2Error> {
    let query = format!("?fileId={}", encode_value(file_id));
    let user_agent = client.user_agent();
    let response = client
        .download_request(|auth| {
            let uri: Uri = format!(
                "{}/b2api/v2/b2_download_file_by_id{}",
                auth.download_url, query
            )
            .parse()?;
            build(uri, auth.auth_token(), user_agent.clone(), range)
        })
        .await?;
    Ok(DownloadStream::new(response))
}

fn build(
    uri: Uri,
    token: http::header::HeaderValue,
    user_agent: http::header::HeaderValue,
    range: Option<(u64, u64)>,
) -> Result<Request<Body>, B2Error> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(AUTHORIZATION, token)
        .header(USER_AGENT, user_agent);
    if let Some((start, end)) = range {
        builder = builder.header(RANGE, format!("bytes={}-{}", start, end));
    }
    Ok(builder.body(Body::empty())?)
}
