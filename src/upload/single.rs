//! Uploading a whole file with one `b2_upload_file` call.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use hyper::Body;
use tracing::warn;

use super::hashing::HashingReader;
use super::part::Ladder;
use super::pool::{UploadLease, UploadUrlPool};
use super::{ByteStream, UploadTarget};
use crate::client::{server_error, B2Client};
use crate::files::File;
use crate::{B2Error, B2ErrorMessage, BytesString};

fn single_ladder(status: StatusCode, message: Option<&B2ErrorMessage>) -> Ladder {
    match status.as_u16() {
        401 => match message.map(|m| m.code.as_str()) {
            Some("bad_auth_token") | Some("expired_auth_token") => Ladder::TokenRejected,
            // A 401 that is not about the upload token is a real permission problem.
            _ => Ladder::Fatal,
        },
        // Only 401 (token), 503, and transport failures poison a lease; a 500 is a
        // generic retry and the url stays good.
        503 => Ladder::DropLease,
        408 | 429 | 500 => Ladder::KeepLease,
        405 => Ladder::MethodNotAllowed,
        _ => Ladder::Fatal,
    }
}

/// Upload a buffered body. The body is replayable, so this gets the full retry
/// ladder: token rejections and 503 swap to a fresh upload url, 408/429/500 back off
/// on the same one.
pub(crate) async fn upload_buffer(
    client: &B2Client,
    pool: &UploadUrlPool,
    bucket_id: &BytesString,
    target: &UploadTarget,
    body: Bytes,
    sha1: &str,
) -> Result<File, B2Error> {
    let retry = client.retry().clone();
    let mut attempt: u32 = 0;
    let mut held: Option<UploadLease> = None;
    loop {
        let lease = match held.take() {
            Some(lease) => lease,
            None => pool.acquire(client, bucket_id).await?,
        };
        let request = single_request(
            client,
            &lease,
            target,
            Body::from(body.clone()),
            body.len() as u64,
            sha1,
        )?;
        let err = match client.roundtrip(request).await {
            Ok((status, bytes)) if status.is_success() => {
                pool.release(lease, true);
                return Ok(serde_json::from_slice(&bytes)?);
            }
            Ok((status, bytes)) => {
                let err = server_error(status, &bytes);
                let message = match &err {
                    B2Error::B2Error(_, msg) => Some(msg),
                    _ => None,
                };
                match single_ladder(status, message) {
                    Ladder::TokenRejected => {
                        pool.release(lease, false);
                        if attempt >= retry.max_retries {
                            return Err(err);
                        }
                        warn!(
                            file_name = %target.file_name,
                            error = %err,
                            "upload token rejected, acquiring a fresh upload url"
                        );
                        attempt += 1;
                        continue;
                    }
                    Ladder::DropLease => {
                        pool.release(lease, false);
                        err
                    }
                    Ladder::KeepLease => {
                        held = Some(lease);
                        err
                    }
                    Ladder::MethodNotAllowed => {
                        pool.release(lease, false);
                        return Err(B2Error::ApiInconsistency(
                            "upload url rejected POST".to_string(),
                        ));
                    }
                    Ladder::Fatal => {
                        pool.release(lease, false);
                        return Err(err);
                    }
                }
            }
            Err(transport) => {
                pool.release(lease, false);
                transport
            }
        };
        if attempt >= retry.max_retries {
            return Err(err);
        }
        let delay = retry.delay(attempt);
        warn!(
            file_name = %target.file_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying upload"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Upload a sized stream in one call without buffering it.
///
/// With a precomputed sha1 the stream is sent as-is; without one it is wrapped in a
/// [`HashingReader`] and announced as `hex_digits_at_end`, which adds the 40 trailer
/// bytes to the declared length. Either way the body cannot be replayed, so this
/// performs a single attempt; any failure invalidates the lease and is surfaced.
///
/// [`HashingReader`]: struct.HashingReader.html
pub(crate) async fn upload_stream_body(
    client: &B2Client,
    pool: &UploadUrlPool,
    bucket_id: &BytesString,
    target: &UploadTarget,
    stream: ByteStream,
    content_length: u64,
    sha1: Option<String>,
) -> Result<File, B2Error> {
    let lease = pool.acquire(client, bucket_id).await?;
    let (body, declared_length, sha1_header) = match sha1 {
        Some(digest) => (Body::wrap_stream(stream), content_length, digest),
        None => (
            Body::wrap_stream(HashingReader::new(stream)),
            content_length + 40,
            "hex_digits_at_end".to_string(),
        ),
    };
    let request =
        single_request(client, &lease, target, body, declared_length, &sha1_header)?;
    match client.roundtrip(request).await {
        Ok((status, bytes)) if status.is_success() => {
            pool.release(lease, true);
            Ok(serde_json::from_slice(&bytes)?)
        }
        Ok((status, bytes)) => {
            pool.release(lease, false);
            Err(server_error(status, &bytes))
        }
        Err(transport) => {
            pool.release(lease, false);
            Err(transport)
        }
    }
}

fn single_request(
    client: &B2Client,
    lease: &UploadLease,
    target: &UploadTarget,
    body: Body,
    content_length: u64,
    sha1: &str,
) -> Result<Request<Body>, B2Error> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(lease.upload_url())
        .header(AUTHORIZATION, lease.token())
        .header(USER_AGENT, client.user_agent())
        .header("X-Bz-File-Name", target.encoded_file_name())
        .header(CONTENT_TYPE, target.content_type.as_str())
        .header(CONTENT_LENGTH, content_length)
        .header("X-Bz-Content-Sha1", sha1);
    for (key, value) in target.info_headers() {
        builder = builder.header(key.as_str(), value.as_str());
    }
    Ok(builder.body(body)?)
}
