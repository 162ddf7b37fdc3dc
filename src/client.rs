//! The client used for executing api calls.
//!
//! [`B2Client`] is the single choke point every request goes through: it signs requests
//! with the current account token, classifies the response, retries transient failures
//! under an exponential backoff schedule, and re-authorizes in place when the server
//! reports the token expired. Concurrent requests that hit an expired token coalesce
//! onto one `b2_authorize_account` call.
//!
//! [`B2Client`]: struct.B2Client.html

use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Response};
use hyper_tls::HttpsConnector;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::{B2AuthResponse, B2Authorization, B2Credentials};
use crate::buckets::Bucket;
use crate::{B2Error, B2ErrorMessage};

type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

const DEFAULT_AUTHORIZE_URL: &str =
    "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

static LIBRARY_USER_AGENT: &str =
    concat!("blaze-b2/", env!("CARGO_PKG_VERSION"), " (rust)");

/// How transient failures are retried.
///
/// Attempt `n` (zero based) sleeps `backoff_base * 2^n * (0.5 + U(0,1))` before the
/// next try, so the schedule is exponential with equal jitter. The budget counts
/// retries, not attempts: `max_retries = 5` allows six requests in total.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(150),
        }
    }
}

impl RetryPolicy {
    /// The jittered delay before retry number `attempt`.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.backoff_base * 2u32.saturating_pow(attempt);
        exponential.mul_f64(0.5 + rand::thread_rng().gen::<f64>())
    }
}

/// Options for constructing a [`B2Client`].
///
/// [`B2Client`]: struct.B2Client.html
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Retry tuning for every api call made by this client.
    pub retry: Option<RetryPolicy>,
    /// Override of the `b2_authorize_account` endpoint. Useful for api-compatible
    /// servers and tests; everything else follows the urls the server hands back.
    pub authorize_url: Option<String>,
    /// Replaces the default `User-Agent` sent on every request.
    pub user_agent: Option<String>,
}

/// What the classification table decided about a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Success,
    /// The account token was rejected; re-authorize and retry.
    RefreshAuth,
    /// Transient server condition; retry after backoff.
    Backoff,
    /// Terminal; surface to the caller.
    Fatal,
}

impl Disposition {
    pub(crate) fn of(status: StatusCode, message: Option<&B2ErrorMessage>) -> Disposition {
        if status.is_success() {
            return Disposition::Success;
        }
        if let Some(msg) = message {
            match msg.code.as_str() {
                "bad_request" | "unauthorized" | "cap_exceeded"
                | "download_cap_exceeded" => return Disposition::Fatal,
                "bad_auth_token" | "expired_auth_token" => {
                    return Disposition::RefreshAuth
                }
                _ => {}
            }
        }
        match status.as_u16() {
            400 | 403 | 416 => Disposition::Fatal,
            408 | 429 | 500 | 503 => Disposition::Backoff,
            _ => Disposition::Fatal,
        }
    }
}

/// The shared authorization slot.
///
/// Readers snapshot `(generation, token)` with two cheap loads; the refresh path is
/// serialized by an async mutex and no-ops when the generation moved while it waited,
/// which is what collapses a burst of `expired_auth_token` responses into a single
/// `b2_authorize_account` call.
struct AuthCell {
    auth: RwLock<Arc<B2Authorization>>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AuthCell {
    fn new(auth: B2Authorization) -> AuthCell {
        AuthCell {
            auth: RwLock::new(Arc::new(auth)),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }
    fn snapshot(&self) -> (u64, Arc<B2Authorization>) {
        // Generation is read first: a racing store can only make this snapshot look
        // older than it is, never newer, so a needless refresh is the worst outcome.
        let generation = self.generation.load(Ordering::Acquire);
        let auth = self.auth.read().unwrap().clone();
        (generation, auth)
    }
    fn store(&self, auth: B2Authorization) {
        *self.auth.write().unwrap() = Arc::new(auth);
        self.generation.fetch_add(1, Ordering::Release);
    }
}

/// An authorized client for the b2 api. Cloning is cheap and clones share the
/// authorization, so a re-auth performed through one clone is visible to all.
#[derive(Clone)]
pub struct B2Client {
    http: HyperClient,
    creds: B2Credentials,
    cell: Arc<AuthCell>,
    retry: RetryPolicy,
    authorize_uri: Uri,
    user_agent: HeaderValue,
}

impl B2Client {
    /// Perform `b2_authorize_account` with the given credentials and return a client
    /// that signs every subsequent call with the resulting token.
    pub async fn authorize(creds: B2Credentials) -> Result<B2Client, B2Error> {
        B2Client::authorize_with(creds, ClientOptions::default()).await
    }

    /// Like [`authorize`], with explicit [`ClientOptions`].
    ///
    /// [`authorize`]: #method.authorize
    /// [`ClientOptions`]: struct.ClientOptions.html
    pub async fn authorize_with(
        creds: B2Credentials,
        options: ClientOptions,
    ) -> Result<B2Client, B2Error> {
        let http = Client::builder().build(HttpsConnector::new());
        let retry = options.retry.unwrap_or_default();
        let authorize_uri: Uri = options
            .authorize_url
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORIZE_URL)
            .parse()?;
        let user_agent = match options.user_agent {
            Some(ua) => HeaderValue::from_str(&ua)
                .map_err(|_| B2Error::usage("user agent is not a valid header value"))?,
            None => HeaderValue::from_static(LIBRARY_USER_AGENT),
        };

        let auth = fetch_authorization(
            &http,
            &creds,
            &authorize_uri,
            &user_agent,
            &retry,
        )
        .await?;

        Ok(B2Client {
            http,
            creds,
            cell: Arc::new(AuthCell::new(auth)),
            retry,
            authorize_uri,
            user_agent,
        })
    }

    /// A snapshot of the current authorization. The token inside is the one in use at
    /// the time of the call; it is replaced, not mutated, on re-auth.
    pub fn authorization(&self) -> Arc<B2Authorization> {
        self.cell.snapshot().1
    }

    /// A handle to the bucket with the given name. No api call is made until the
    /// handle needs the bucket id.
    pub fn bucket_by_name(&self, name: &str) -> Bucket {
        Bucket::with_name(self.clone(), name)
    }

    /// A handle to the bucket with the given id.
    pub fn bucket_by_id(&self, id: &str) -> Bucket {
        Bucket::with_id(self.clone(), id)
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
    pub(crate) fn user_agent(&self) -> HeaderValue {
        self.user_agent.clone()
    }

    /// Execute a json api call under the full retry and re-auth policy.
    ///
    /// The body is serialized once; the request itself is rebuilt per attempt so a
    /// retry that follows a re-auth picks up the fresh token.
    pub(crate) async fn api_call<Req, Resp>(
        &self,
        op: &str,
        request: &Req,
    ) -> Result<Resp, B2Error>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let mut attempt: u32 = 0;
        loop {
            let (generation, auth) = self.cell.snapshot();
            let uri: Uri = format!("{}/b2api/v2/{}", auth.api_url, op).parse()?;
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(AUTHORIZATION, auth.auth_token())
                .header(USER_AGENT, self.user_agent.clone())
                .body(Body::from(body.clone()))?;

            let (status, bytes) = match self.roundtrip(request).await {
                Ok(ok) => ok,
                Err(err) => {
                    self.back_off(&mut attempt, op, err).await?;
                    continue;
                }
            };
            if status.is_success() {
                return Ok(serde_json::from_slice(&bytes)?);
            }
            let err = server_error(status, &bytes);
            match Disposition::of(status, err.message()) {
                Disposition::Success => unreachable!(),
                Disposition::Fatal => return Err(err),
                Disposition::Backoff => self.back_off(&mut attempt, op, err).await?,
                Disposition::RefreshAuth => {
                    if attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    self.refresh_auth(generation).await?;
                }
            }
        }
    }

    /// Execute a download request under the retry policy, returning the streaming
    /// response as soon as the status line is good.
    ///
    /// The request is rebuilt per attempt by `make`, which receives the current
    /// authorization for url and token assembly.
    pub(crate) async fn download_request<F>(
        &self,
        mut make: F,
    ) -> Result<Response<Body>, B2Error>
    where
        F: FnMut(&B2Authorization) -> Result<Request<Body>, B2Error>,
    {
        let mut attempt: u32 = 0;
        loop {
            let (generation, auth) = self.cell.snapshot();
            let request = make(&auth)?;
            let response = match self.http.request(request).await {
                Ok(resp) => resp,
                Err(err) => {
                    self.back_off(&mut attempt, "download", err.into()).await?;
                    continue;
                }
            };
            if response.status().is_success() {
                return Ok(response);
            }
            let (parts, body) = response.into_parts();
            let bytes = hyper::body::to_bytes(body).await?;
            let err = server_error(parts.status, &bytes);
            match Disposition::of(parts.status, err.message()) {
                Disposition::Success => unreachable!(),
                Disposition::Fatal => return Err(err),
                Disposition::Backoff => {
                    self.back_off(&mut attempt, "download", err).await?
                }
                Disposition::RefreshAuth => {
                    if attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    self.refresh_auth(generation).await?;
                }
            }
        }
    }

    /// Send a request to a mint-issued upload endpoint and collect the response.
    ///
    /// Upload endpoints carry their own tokens and their own retry ladders, so this
    /// performs exactly one round trip; classification is up to the caller.
    pub(crate) async fn roundtrip(
        &self,
        request: Request<Body>,
    ) -> Result<(StatusCode, Bytes), B2Error> {
        let response = self.http.request(request).await?;
        let (parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body).await?;
        Ok((parts.status, bytes))
    }

    /// Re-authorize unless another task already did since `seen_generation` was
    /// snapshotted.
    pub(crate) async fn refresh_auth(&self, seen_generation: u64) -> Result<(), B2Error> {
        let _guard = self.cell.refresh_lock.lock().await;
        if self.cell.generation.load(Ordering::Acquire) != seen_generation {
            // Someone else refreshed while we waited for the lock.
            return Ok(());
        }
        debug!("account token rejected, re-running b2_authorize_account");
        let auth = fetch_authorization(
            &self.http,
            &self.creds,
            &self.authorize_uri,
            &self.user_agent,
            &self.retry,
        )
        .await?;
        self.cell.store(auth);
        Ok(())
    }

    async fn back_off(
        &self,
        attempt: &mut u32,
        op: &str,
        err: B2Error,
    ) -> Result<(), B2Error> {
        if *attempt >= self.retry.max_retries {
            return Err(err);
        }
        let delay = self.retry.delay(*attempt);
        warn!(
            op,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying b2 call"
        );
        tokio::time::sleep(delay).await;
        *attempt += 1;
        Ok(())
    }
}

impl std::fmt::Debug for B2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Client")
            .field("account_id", &self.authorization().account_id)
            .finish()
    }
}

/// Perform `b2_authorize_account`. Transient failures back off and retry; everything
/// else is terminal, since retrying bad credentials will not make them good.
async fn fetch_authorization(
    http: &HyperClient,
    creds: &B2Credentials,
    authorize_uri: &Uri,
    user_agent: &HeaderValue,
    retry: &RetryPolicy,
) -> Result<B2Authorization, B2Error> {
    let mut attempt: u32 = 0;
    loop {
        let request = Request::builder()
            .method(Method::POST)
            .uri(authorize_uri.clone())
            .header(AUTHORIZATION, creds.basic_header()?)
            .header(USER_AGENT, user_agent.clone())
            .body(Body::empty())?;

        let err = match http.request(request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let bytes = hyper::body::to_bytes(body).await?;
                if parts.status.is_success() {
                    let resp: B2AuthResponse = serde_json::from_slice(&bytes)?;
                    return B2Authorization::from_response(resp);
                }
                let err = server_error(parts.status, &bytes);
                match Disposition::of(parts.status, err.message()) {
                    Disposition::Backoff => err,
                    _ => return Err(err),
                }
            }
            Err(err) => err.into(),
        };
        if attempt >= retry.max_retries {
            return Err(err);
        }
        let delay = retry.delay(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying b2_authorize_account"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Turn a non-2xx response body into a `B2Error`, preserving the server payload.
pub(crate) fn server_error(status: StatusCode, bytes: &Bytes) -> B2Error {
    match serde_json::from_slice::<B2ErrorMessage>(bytes) {
        Ok(msg) => B2Error::B2Error(status, msg),
        Err(_) => B2Error::ApiInconsistency(format!(
            "b2 returned {} with an unparseable error body",
            status
        )),
    }
}

impl B2Error {
    fn message(&self) -> Option<&B2ErrorMessage> {
        match self {
            B2Error::B2Error(_, msg) => Some(msg),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(code: &str, status: u32) -> B2ErrorMessage {
        B2ErrorMessage {
            code: code.to_string(),
            message: String::new(),
            status,
        }
    }

    #[test]
    fn classification_table() {
        use Disposition::*;
        let cases: &[(u16, Option<B2ErrorMessage>, Disposition)] = &[
            (200, None, Success),
            (400, Some(msg("bad_request", 400)), Fatal),
            (401, Some(msg("unauthorized", 401)), Fatal),
            (403, Some(msg("download_cap_exceeded", 403)), Fatal),
            (401, Some(msg("bad_auth_token", 401)), RefreshAuth),
            (401, Some(msg("expired_auth_token", 401)), RefreshAuth),
            (400, None, Fatal),
            (403, None, Fatal),
            (416, None, Fatal),
            (408, None, Backoff),
            (429, None, Backoff),
            (500, None, Backoff),
            (503, None, Backoff),
            // Anything unknown is terminal.
            (502, None, Fatal),
            (204, None, Success),
        ];
        for (status, message, expected) in cases {
            let status = StatusCode::from_u16(*status).unwrap();
            assert_eq!(
                Disposition::of(status, message.as_ref()),
                *expected,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn delay_is_exponential_with_equal_jitter() {
        let retry = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
        };
        for attempt in 0..4u32 {
            let exp = Duration::from_millis(100 * 2u64.pow(attempt));
            for _ in 0..32 {
                let d = retry.delay(attempt);
                assert!(d >= exp.mul_f64(0.5), "{:?} below jitter floor", d);
                assert!(d <= exp.mul_f64(1.5), "{:?} above jitter ceiling", d);
            }
        }
    }

    #[test]
    fn unparseable_error_body_is_an_api_inconsistency() {
        let err = server_error(StatusCode::BAD_GATEWAY, &Bytes::from_static(b"<html>"));
        assert!(matches!(err, B2Error::ApiInconsistency(_)));
    }
}
