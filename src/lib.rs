//! An async client library for the [Backblaze B2] cloud storage api.
//!
//! The entry point of this crate is the [`B2Client`], which is created from a set of
//! [`B2Credentials`] and performs every api call with the resulting authorization.
//! Buckets are accessed through the [`Bucket`] handle, which can upload byte buffers or
//! streams of unknown length; uploads larger than the configured part size are
//! transparently split into a [large file upload] with concurrent part uploads.
//!
//! ```no_run
//! use blaze_b2::auth::B2Credentials;
//! use blaze_b2::client::B2Client;
//! use blaze_b2::upload::UploadOptions;
//! use blaze_b2::B2Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), B2Error> {
//!     let creds = B2Credentials::from_env()?;
//!     let client = B2Client::authorize(creds).await?;
//!
//!     let bucket = client.bucket_by_name("my-bucket");
//!     let file = bucket
//!         .upload("hello.txt", "hello world", UploadOptions::default())
//!         .await?;
//!     println!("stored {} ({} bytes)", file.file_name, file.content_length);
//!     Ok(())
//! }
//! ```
//!
//! [Backblaze B2]: https://www.backblaze.com/b2/docs/
//! [`B2Client`]: client/struct.B2Client.html
//! [`B2Credentials`]: auth/struct.B2Credentials.html
//! [`Bucket`]: buckets/struct.Bucket.html
//! [large file upload]: https://www.backblaze.com/b2/docs/large_files.html

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod auth;
pub mod buckets;
pub mod client;
pub mod files;
pub mod upload;

mod bytes_string;
pub use crate::bytes_string::BytesString;

/// The b2 api returns errors in a json object that deserializes into this struct. It is
/// usually carried inside a [`B2Error`].
///
/// [`B2Error`]: enum.B2Error.html
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct B2ErrorMessage {
    pub code: String,
    pub message: String,
    pub status: u32,
}

/// An error caused while using the b2 api.
///
/// Errors returned by the b2 server are stored exactly as received, and the [`kind`]
/// method classifies them into the [`ErrorKind`] that callers match on. Retryable
/// conditions (408, 429, 500, 503, expired tokens, transport failures) are retried
/// internally before an error of this type is surfaced, so every `B2Error` a caller
/// sees is past its retry budget.
///
/// [`kind`]: #method.kind
/// [`ErrorKind`]: enum.ErrorKind.html
#[derive(Debug)]
pub enum B2Error {
    /// A failure in the http transport: connect, dns, reset, tls.
    Hyper(hyper::Error),
    /// An invalid request could not be constructed, e.g. a malformed url.
    Http(http::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    /// An error response from the b2 server, stored as received.
    B2Error(StatusCode, B2ErrorMessage),
    /// The requested file does not exist.
    FileNotFound(String),
    /// The library was used in a way that violates its contract, e.g. more than ten
    /// `X-Bz-Info-*` pairs or an invalid info key.
    Usage(String),
    /// The operation was cancelled before it completed.
    Cancelled,
    /// The b2 server did not follow its own api spec.
    ApiInconsistency(String),
}

/// The kinds of failure a caller can discriminate on.
///
/// This mirrors the b2 error taxonomy rather than the http status alone: the `code`
/// field of the server payload takes precedence over the status when both are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    CapExceeded,
    DownloadCapExceeded,
    RangeNotSatisfiable,
    RequestTimeout,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
    /// The account token expired and could not be refreshed within the retry budget.
    ExpiredCredentials,
    FileNotFound,
    /// A transport-layer failure that survived all retries.
    Transport,
    /// Misuse of the library api.
    Usage,
    Cancelled,
    /// A server response that fits no known classification.
    UnknownServerError,
}

impl B2Error {
    /// Classify this error into the kind a caller should match on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            B2Error::Hyper(_) | B2Error::Io(_) => ErrorKind::Transport,
            B2Error::Http(_) | B2Error::Json(_) | B2Error::ApiInconsistency(_) => {
                ErrorKind::UnknownServerError
            }
            B2Error::FileNotFound(_) => ErrorKind::FileNotFound,
            B2Error::Usage(_) => ErrorKind::Usage,
            B2Error::Cancelled => ErrorKind::Cancelled,
            B2Error::B2Error(status, msg) => match msg.code.as_str() {
                "bad_request" => ErrorKind::BadRequest,
                "unauthorized" => ErrorKind::Unauthorized,
                "cap_exceeded" => ErrorKind::CapExceeded,
                "download_cap_exceeded" => ErrorKind::DownloadCapExceeded,
                "range_not_satisfiable" => ErrorKind::RangeNotSatisfiable,
                "bad_auth_token" | "expired_auth_token" => ErrorKind::ExpiredCredentials,
                "no_such_file" | "file_not_present" => ErrorKind::FileNotFound,
                _ => match status.as_u16() {
                    400 => ErrorKind::BadRequest,
                    401 => ErrorKind::Unauthorized,
                    403 => ErrorKind::Forbidden,
                    404 => ErrorKind::FileNotFound,
                    408 => ErrorKind::RequestTimeout,
                    416 => ErrorKind::RangeNotSatisfiable,
                    429 => ErrorKind::TooManyRequests,
                    500 => ErrorKind::InternalServerError,
                    503 => ErrorKind::ServiceUnavailable,
                    _ => ErrorKind::UnknownServerError,
                },
            },
        }
    }
    /// Returns true if the b2 server asked us to back off, i.e. the status was 408, 429
    /// or 503.
    pub fn should_back_off(&self) -> bool {
        if let B2Error::B2Error(_, B2ErrorMessage { status, .. }) = self {
            matches!(status, 408 | 429 | 503)
        } else {
            false
        }
    }
    /// Returns true if the error is caused by an expired or rejected authorization
    /// token. The client refreshes its account token automatically, so seeing this
    /// error means the refresh itself kept failing.
    pub fn is_expired_authentication(&self) -> bool {
        if let B2Error::B2Error(_, B2ErrorMessage { code, .. }) = self {
            code == "expired_auth_token" || code == "bad_auth_token"
        } else {
            false
        }
    }
    /// Returns true if the usage cap on the b2 account has been exceeded.
    pub fn is_cap_exceeded(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapExceeded | ErrorKind::DownloadCapExceeded
        )
    }
    /// Returns true if the error refers to a file that does not exist.
    pub fn is_file_not_found(&self) -> bool {
        self.kind() == ErrorKind::FileNotFound
    }

    pub(crate) fn usage(msg: impl Into<String>) -> B2Error {
        B2Error::Usage(msg.into())
    }
}

impl From<hyper::Error> for B2Error {
    fn from(err: hyper::Error) -> B2Error {
        B2Error::Hyper(err)
    }
}
impl From<http::Error> for B2Error {
    fn from(err: http::Error) -> B2Error {
        B2Error::Http(err)
    }
}
impl From<http::uri::InvalidUri> for B2Error {
    fn from(err: http::uri::InvalidUri) -> B2Error {
        B2Error::Http(err.into())
    }
}
impl From<http::header::InvalidHeaderValue> for B2Error {
    fn from(err: http::header::InvalidHeaderValue) -> B2Error {
        B2Error::Http(err.into())
    }
}
impl From<std::io::Error> for B2Error {
    fn from(err: std::io::Error) -> B2Error {
        B2Error::Io(err)
    }
}
impl From<serde_json::Error> for B2Error {
    fn from(err: serde_json::Error) -> B2Error {
        B2Error::Json(err)
    }
}

impl fmt::Display for B2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            B2Error::Hyper(err) => err.fmt(f),
            B2Error::Http(err) => err.fmt(f),
            B2Error::Io(err) => err.fmt(f),
            B2Error::Json(err) => err.fmt(f),
            B2Error::B2Error(_, err) => {
                write!(f, "{} ({}): {}", err.status, err.code, err.message)
            }
            B2Error::FileNotFound(name) => write!(f, "file not found: {}", name),
            B2Error::Usage(msg) => write!(f, "api misuse: {}", msg),
            B2Error::Cancelled => f.pad("operation cancelled"),
            B2Error::ApiInconsistency(msg) => msg.fmt(f),
        }
    }
}
impl std::error::Error for B2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            B2Error::Hyper(err) => Some(err),
            B2Error::Http(err) => Some(err),
            B2Error::Io(err) => Some(err),
            B2Error::Json(err) => Some(err),
            _ => None,
        }
    }
}
