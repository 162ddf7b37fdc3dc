//! Credentials and authorization state for the b2 api.
//!
//! A [`B2Credentials`] identifies an application key. Passing it to
//! [`B2Client::authorize`] performs the [`b2_authorize_account`] api call and produces
//! the [`B2Authorization`] that every later call is signed with. The client refreshes
//! the authorization in place when the server reports the token expired, so callers
//! normally never touch this module beyond constructing credentials.
//!
//! [`B2Credentials`]: struct.B2Credentials.html
//! [`B2Client::authorize`]: ../client/struct.B2Client.html#method.authorize
//! [`B2Authorization`]: struct.B2Authorization.html
//! [`b2_authorize_account`]: https://www.backblaze.com/b2/docs/b2_authorize_account.html

use base64::encode as b64encode;
use bytes::Bytes;
use http::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::{B2Error, BytesString};

mod capabilities;
pub use self::capabilities::Capabilities;

/// The credentials needed to create a [`B2Authorization`].
///
/// [`B2Authorization`]: struct.B2Authorization.html
#[derive(Debug, Clone)]
pub struct B2Credentials {
    pub id: BytesString,
    pub key: BytesString,
    auth_string: Bytes,
}

impl B2Credentials {
    /// Create credentials from an application key id and application key.
    pub fn new(id: &str, key: &str) -> B2Credentials {
        let auth_string =
            Bytes::from(format!("Basic {}", b64encode(format!("{}:{}", id, key))));
        B2Credentials {
            id: BytesString::from(id),
            key: BytesString::from(key),
            auth_string,
        }
    }
    /// Read credentials from a json file of the shape `{"id": "...", "key": "..."}`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<B2Credentials, B2Error> {
        #[derive(Deserialize)]
        struct Creds {
            id: String,
            key: String,
        }
        let file = std::fs::File::open(path)?;
        let creds: Creds = serde_json::from_reader(file)?;
        Ok(B2Credentials::new(&creds.id, &creds.key))
    }
    /// Read credentials from the `B2_KEY_ID` and `B2_KEY` environment variables.
    pub fn from_env() -> Result<B2Credentials, B2Error> {
        let id = std::env::var("B2_KEY_ID")
            .map_err(|_| B2Error::usage("B2_KEY_ID is not set"))?;
        let key =
            std::env::var("B2_KEY").map_err(|_| B2Error::usage("B2_KEY is not set"))?;
        Ok(B2Credentials::new(&id, &key))
    }
    /// The value of the `Authorization` header used by the authorize call.
    pub(crate) fn basic_header(&self) -> Result<HeaderValue, B2Error> {
        Ok(HeaderValue::from_maybe_shared(self.auth_string.clone())?)
    }
}

/// The response body of `b2_authorize_account`, kept private; it is turned into a
/// [`B2Authorization`] before anyone sees it.
///
/// [`B2Authorization`]: struct.B2Authorization.html
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct B2AuthResponse {
    account_id: BytesString,
    authorization_token: BytesString,
    allowed: Allowed,
    api_url: BytesString,
    download_url: BytesString,
    recommended_part_size: usize,
    absolute_minimum_part_size: usize,
}

/// Describes what a certain authorization is allowed to do.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Allowed {
    /// The capabilities of this authorization.
    pub capabilities: Capabilities,
    /// If set, this authorization is limited to the specified bucket.
    pub bucket_id: Option<BytesString>,
    /// If set, this authorization is limited to the specified bucket.
    pub bucket_name: Option<BytesString>,
    /// If set, this authorization is limited to files within this prefix.
    pub name_prefix: Option<BytesString>,
}

/// An authorization for the backblaze b2 api.
///
/// Produced by the [`b2_authorize_account`] api call and replaced in place by the
/// client whenever the server reports `bad_auth_token` or `expired_auth_token`. This
/// type is internally reference counted through the client, so snapshots are cheap.
///
/// [`b2_authorize_account`]: https://www.backblaze.com/b2/docs/b2_authorize_account.html
#[derive(Clone, Debug)]
pub struct B2Authorization {
    pub account_id: BytesString,
    pub authorization_token: HeaderValue,
    pub api_url: BytesString,
    pub download_url: BytesString,
    pub recommended_part_size: usize,
    pub absolute_minimum_part_size: usize,
    pub allowed: Allowed,
}

impl B2Authorization {
    pub(crate) fn from_response(resp: B2AuthResponse) -> Result<B2Authorization, B2Error> {
        Ok(B2Authorization {
            account_id: resp.account_id,
            authorization_token: resp.authorization_token.as_header()?,
            api_url: resp.api_url,
            download_url: resp.download_url,
            recommended_part_size: resp.recommended_part_size,
            absolute_minimum_part_size: resp.absolute_minimum_part_size,
            allowed: resp.allowed,
        })
    }
    pub(crate) fn auth_token(&self) -> HeaderValue {
        self.authorization_token.clone()
    }
}
