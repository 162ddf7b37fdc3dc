//! Pooling of upload urls.
//!
//! B2 hands out upload urls through `b2_get_upload_url` (one scope per bucket) and
//! `b2_get_upload_part_url` (one scope per large file). An upload url must not be used
//! by two uploads at once, but it stays valid across sequential uploads until the
//! server rejects it. The pool hands out exclusive leases and takes them back when the
//! upload finished cleanly; a lease whose upload failed in any way is dropped, and the
//! next acquire mints a fresh one.

use http::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

use crate::client::B2Client;
use crate::{B2Error, BytesString};

/// Which minting call the pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKind {
    /// `b2_get_upload_url`, scoped to a bucket id.
    SinglePart,
    /// `b2_get_upload_part_url`, scoped to a large file id.
    Part,
}

/// An upload url and the token that authorizes uploads to it.
///
/// Exclusivity is enforced by ownership: a lease exists either in the pool's free list
/// or in the hands of exactly one upload.
#[derive(Debug)]
pub(crate) struct UploadLease {
    upload_url: BytesString,
    token: HeaderValue,
}

impl UploadLease {
    pub(crate) fn upload_url(&self) -> &str {
        self.upload_url.as_str()
    }
    pub(crate) fn token(&self) -> HeaderValue {
        self.token.clone()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintResponse {
    upload_url: BytesString,
    authorization_token: BytesString,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadUrlRequest<'a> {
    bucket_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadPartUrlRequest<'a> {
    file_id: &'a str,
}

/// A pool of upload url leases within one scope.
pub(crate) struct UploadUrlPool {
    kind: PoolKind,
    free: Mutex<Vec<UploadLease>>,
}

impl UploadUrlPool {
    pub(crate) fn new(kind: PoolKind) -> UploadUrlPool {
        UploadUrlPool {
            kind,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a free lease, or mint a new one through the executor. Concurrent callers
    /// that find the pool empty mint in parallel; the pool grows to the natural
    /// concurrency of its users.
    pub(crate) async fn acquire(
        &self,
        client: &B2Client,
        scope: &BytesString,
    ) -> Result<UploadLease, B2Error> {
        if let Some(lease) = self.free.lock().unwrap().pop() {
            return Ok(lease);
        }
        let minted: MintResponse = match self.kind {
            PoolKind::SinglePart => {
                client
                    .api_call(
                        "b2_get_upload_url",
                        &GetUploadUrlRequest {
                            bucket_id: scope.as_str(),
                        },
                    )
                    .await?
            }
            PoolKind::Part => {
                client
                    .api_call(
                        "b2_get_upload_part_url",
                        &GetUploadPartUrlRequest {
                            file_id: scope.as_str(),
                        },
                    )
                    .await?
            }
        };
        debug!(scope = %scope, url = %minted.upload_url, "minted upload url");
        Ok(UploadLease {
            token: minted.authorization_token.as_header()?,
            upload_url: minted.upload_url,
        })
    }

    /// Return a lease after use. A lease whose upload did not end in a clean 200 is
    /// dropped so no later upload inherits a poisoned url.
    pub(crate) fn release(&self, lease: UploadLease, valid: bool) {
        if valid {
            self.free.lock().unwrap().push(lease);
        } else {
            debug!(url = lease.upload_url(), "dropping invalidated upload url");
        }
    }
}
