//! Uploading one part of a large file.
//!
//! Part uploads go to mint-issued per-file endpoints carrying their own tokens, so
//! they do not pass through the general executor; this module owns their retry ladder.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, USER_AGENT};
use http::{Method, Request, StatusCode};
use hyper::Body;
use serde::Deserialize;
use tracing::{debug, warn};

use super::pool::{UploadLease, UploadUrlPool};
use crate::client::{server_error, B2Client};
use crate::{B2Error, BytesString};

/// Part numbers run from 1 to 10000.
pub(crate) const MAX_PART_NUMBER: usize = 10_000;

/// The response of `b2_upload_part`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadPartResponse {
    pub file_id: String,
    pub part_number: usize,
    pub content_length: u64,
    pub content_sha1: String,
}

/// What an upload-endpoint status means for the lease and the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ladder {
    /// The per-upload token was rejected. Drop the lease and retry immediately with a
    /// fresh one.
    TokenRejected,
    /// Transient server condition tied to this endpoint. Drop the lease and retry
    /// against a fresh one after backing off.
    DropLease,
    /// Transient condition not tied to the endpoint. Back off and retry against the
    /// same lease.
    KeepLease,
    /// The endpoint rejected the method, which means this library built the request
    /// wrong.
    MethodNotAllowed,
    Fatal,
}

fn part_ladder(status: StatusCode) -> Ladder {
    match status.as_u16() {
        401 => Ladder::TokenRejected,
        503 => Ladder::DropLease,
        408 => Ladder::KeepLease,
        405 => Ladder::MethodNotAllowed,
        // Part endpoints retry 200/401/503/408 only; everything else, 429
        // included, is terminal here.
        _ => Ladder::Fatal,
    }
}

/// Upload one part under the ladder above. On success the lease that carried it goes
/// back to the pool for the next part.
pub(crate) async fn upload_part(
    client: &B2Client,
    pool: &UploadUrlPool,
    file_id: &BytesString,
    part_number: usize,
    body: Bytes,
    sha1: &str,
) -> Result<UploadPartResponse, B2Error> {
    debug_assert!((1..=MAX_PART_NUMBER).contains(&part_number));
    let retry = client.retry().clone();
    let mut attempt: u32 = 0;
    let mut held: Option<UploadLease> = None;
    loop {
        let lease = match held.take() {
            Some(lease) => lease,
            None => pool.acquire(client, file_id).await?,
        };
        let request = part_request(client, &lease, part_number, body.clone(), sha1)?;
        let err = match client.roundtrip(request).await {
            Ok((status, bytes)) if status.is_success() => {
                pool.release(lease, true);
                let response: UploadPartResponse = serde_json::from_slice(&bytes)?;
                debug!(part_number, content_sha1 = sha1, "part stored");
                return Ok(response);
            }
            Ok((status, bytes)) => {
                let err = server_error(status, &bytes);
                match part_ladder(status) {
                    Ladder::TokenRejected => {
                        pool.release(lease, false);
                        if attempt >= retry.max_retries {
                            return Err(err);
                        }
                        warn!(
                            part_number,
                            error = %err,
                            "part upload token rejected, acquiring a fresh upload url"
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
                            "part upload url rejected POST".to_string(),
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
            part_number,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying part upload"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn part_request(
    client: &B2Client,
    lease: &UploadLease,
    part_number: usize,
    body: Bytes,
    sha1: &str,
) -> Result<Request<Body>, B2Error> {
    let content_length = body.len() as u64;
    Ok(Request::builder()
        .method(Method::POST)
        .uri(lease.upload_url())
        .header(AUTHORIZATION, lease.token())
        .header(USER_AGENT, client.user_agent())
        .header("X-Bz-Part-Number", part_number as u64)
        .header("X-Bz-Content-Sha1", sha1)
        .header(CONTENT_LENGTH, content_length)
        .body(Body::from(body))?)
}
