//! A scripted in-process b2 server for integration tests.
//!
//! The server implements just enough of the v2 api to drive the client end to end:
//! authorization, bucket listing, single and large file uploads, downloads, and file
//! listings. Every request against an upload endpoint is recorded, and tests can
//! script fault sequences (per api operation or for upload posts) to exercise the
//! retry ladders.

#![allow(dead_code)]

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use blaze_b2::auth::B2Credentials;
use blaze_b2::client::{B2Client, ClientOptions, RetryPolicy};

pub fn sha1_hex(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

/// One recorded POST against an upload endpoint.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub endpoint: String,
    pub auth_token: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub part_number: Option<usize>,
}

impl UploadRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: String,
    pub file_name: String,
    pub content: Vec<u8>,
    pub content_sha1: Option<String>,
    pub content_type: String,
    pub file_info: Value,
}

#[derive(Debug, Clone)]
pub struct FinishRecord {
    pub file_id: String,
    pub part_sha1_array: Vec<String>,
}

struct LargeFile {
    file_name: String,
    content_type: String,
    file_info: Value,
    parts: BTreeMap<usize, (String, Vec<u8>)>,
}

enum EndpointKind {
    Single,
    Part { file_id: String },
}

struct Endpoint {
    token: String,
    kind: EndpointKind,
}

struct Inner {
    base_url: String,
    recommended_part_size: usize,
    absolute_minimum_part_size: usize,

    next_id: u64,
    valid_account_tokens: HashSet<String>,
    /// When set, newly issued account tokens are immediately invalid; lets tests
    /// exhaust the re-auth budget.
    poison_new_tokens: bool,

    authorize_calls: u64,
    api_calls: HashMap<String, u64>,
    api_faults: HashMap<String, VecDeque<u16>>,
    upload_faults: VecDeque<u16>,

    endpoints: HashMap<String, Endpoint>,
    files: BTreeMap<String, StoredFile>,
    file_ids: HashMap<String, String>,
    large: HashMap<String, LargeFile>,

    uploads: Vec<UploadRecord>,
    finishes: Vec<FinishRecord>,
    cancels: Vec<String>,
}

impl Inner {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct FakeB2 {
    pub addr: SocketAddr,
    inner: Arc<Mutex<Inner>>,
}

impl FakeB2 {
    pub async fn spawn() -> FakeB2 {
        FakeB2::spawn_with(100, 1).await
    }

    pub async fn spawn_with(
        recommended_part_size: usize,
        absolute_minimum_part_size: usize,
    ) -> FakeB2 {
        let inner = Arc::new(Mutex::new(Inner {
            base_url: String::new(),
            recommended_part_size,
            absolute_minimum_part_size,
            next_id: 0,
            valid_account_tokens: HashSet::new(),
            poison_new_tokens: false,
            authorize_calls: 0,
            api_calls: HashMap::new(),
            api_faults: HashMap::new(),
            upload_faults: VecDeque::new(),
            endpoints: HashMap::new(),
            files: BTreeMap::new(),
            file_ids: HashMap::new(),
            large: HashMap::new(),
            uploads: Vec::new(),
            finishes: Vec::new(),
            cancels: Vec::new(),
        }));

        let service_inner = inner.clone();
        let make = make_service_fn(move |_conn| {
            let inner = service_inner.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(req, inner.clone())))
            }
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        inner.lock().unwrap().base_url = format!("http://{}", addr);
        tokio::spawn(server);

        FakeB2 { addr, inner }
    }

    pub fn base_url(&self) -> String {
        self.inner.lock().unwrap().base_url.clone()
    }
    pub fn authorize_url(&self) -> String {
        format!("{}/b2api/v2/b2_authorize_account", self.base_url())
    }

    /// An authorized client with the given retry policy.
    pub async fn client(&self, retry: RetryPolicy) -> B2Client {
        B2Client::authorize_with(
            B2Credentials::new("key-id", "application-key"),
            ClientOptions {
                retry: Some(retry),
                authorize_url: Some(self.authorize_url()),
                user_agent: None,
            },
        )
        .await
        .expect("authorize against fake server")
    }

    // -- scripting --

    pub fn fault_api(&self, op: &str, statuses: &[u16]) {
        self.inner
            .lock()
            .unwrap()
            .api_faults
            .entry(op.to_string())
            .or_default()
            .extend(statuses);
    }
    pub fn fault_uploads(&self, statuses: &[u16]) {
        self.inner.lock().unwrap().upload_faults.extend(statuses);
    }
    pub fn expire_account_tokens(&self) {
        self.inner.lock().unwrap().valid_account_tokens.clear();
    }
    pub fn poison_new_tokens(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.poison_new_tokens = true;
        inner.valid_account_tokens.clear();
    }

    // -- observations --

    pub fn authorize_calls(&self) -> u64 {
        self.inner.lock().unwrap().authorize_calls
    }
    pub fn api_calls(&self, op: &str) -> u64 {
        *self.inner.lock().unwrap().api_calls.get(op).unwrap_or(&0)
    }
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.inner.lock().unwrap().uploads.clone()
    }
    pub fn finishes(&self) -> Vec<FinishRecord> {
        self.inner.lock().unwrap().finishes.clone()
    }
    pub fn cancels(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancels.clone()
    }
    pub fn stored(&self, name: &str) -> Option<StoredFile> {
        self.inner.lock().unwrap().files.get(name).cloned()
    }
}

async fn handle(
    req: Request<Body>,
    inner: Arc<Mutex<Inner>>,
) -> Result<Response<Body>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = hyper::body::to_bytes(body).await.unwrap();
    let mut inner = inner.lock().unwrap();
    Ok(route(&mut inner, &parts, body))
}

fn route(inner: &mut Inner, parts: &http::request::Parts, body: Bytes) -> Response<Body> {
    let path = parts.uri.path().to_string();
    match path.as_str() {
        "/b2api/v2/b2_authorize_account" => authorize(inner, parts),
        "/b2api/v2/b2_download_file_by_id" => {
            let file_id = parts
                .uri
                .query()
                .and_then(|q| q.strip_prefix("fileId="))
                .unwrap_or_default()
                .to_string();
            download_by_id(inner, parts, &file_id)
        }
        _ => {
            if let Some(rest) = path.strip_prefix("/upload/") {
                upload(inner, rest.to_string(), parts, body)
            } else if let Some(rest) = path.strip_prefix("/file/") {
                download_by_name(inner, parts, rest)
            } else if let Some(op) = path.strip_prefix("/b2api/v2/") {
                api(inner, op.to_string(), parts, body)
            } else {
                error(404, "not_found", "no such path")
            }
        }
    }
}

fn error(status: u16, code: &str, message: &str) -> Response<Body> {
    let body = json!({ "status": status, "code": code, "message": message });
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn fault_response(status: u16) -> Response<Body> {
    let code = match status {
        401 => "expired_auth_token",
        403 => "forbidden",
        408 => "request_timeout",
        429 => "too_many_requests",
        500 => "internal_error",
        503 => "service_unavailable",
        _ => "bad_request",
    };
    error(status, code, "scripted fault")
}

fn ok(body: Value) -> Response<Body> {
    Response::new(Body::from(body.to_string()))
}

fn header<'a>(parts: &'a http::request::Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name)?.to_str().ok()
}

fn authorize(inner: &mut Inner, parts: &http::request::Parts) -> Response<Body> {
    inner.authorize_calls += 1;
    match header(parts, "Authorization") {
        Some(value) if value.starts_with("Basic ") => {}
        _ => return error(401, "unauthorized", "missing basic auth"),
    }
    let token = format!("account-token-{}", inner.fresh_id());
    if !inner.poison_new_tokens {
        inner.valid_account_tokens.insert(token.clone());
    }
    ok(json!({
        "accountId": "acct-1",
        "authorizationToken": token,
        "apiUrl": inner.base_url,
        "downloadUrl": inner.base_url,
        "recommendedPartSize": inner.recommended_part_size,
        "absoluteMinimumPartSize": inner.absolute_minimum_part_size,
        "allowed": {
            "capabilities": ["listBuckets", "listFiles", "readFiles", "writeFiles"],
            "bucketId": null,
            "bucketName": null,
            "namePrefix": null
        }
    }))
}

fn check_account_token(
    inner: &Inner,
    parts: &http::request::Parts,
) -> Option<Response<Body>> {
    match header(parts, "Authorization") {
        Some(token) if inner.valid_account_tokens.contains(token) => None,
        _ => Some(error(401, "expired_auth_token", "account token expired")),
    }
}

fn file_json(file: &StoredFile) -> Value {
    json!({
        "accountId": "acct-1",
        "action": "upload",
        "bucketId": "bucket-1",
        "contentLength": file.content.len(),
        "contentSha1": file.content_sha1,
        "contentType": file.content_type,
        "fileId": file.file_id,
        "fileInfo": file.file_info,
        "fileName": file.file_name,
        "uploadTimestamp": 1_700_000_000_000i64
    })
}

fn api(
    inner: &mut Inner,
    op: String,
    parts: &http::request::Parts,
    body: Bytes,
) -> Response<Body> {
    *inner.api_calls.entry(op.clone()).or_insert(0) += 1;
    if let Some(resp) = check_account_token(inner, parts) {
        return resp;
    }
    if let Some(queue) = inner.api_faults.get_mut(&op) {
        if let Some(status) = queue.pop_front() {
            return fault_response(status);
        }
    }
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match op.as_str() {
        "b2_list_buckets" => {
            let id_filter = request.get("bucketId").and_then(Value::as_str);
            let name_filter = request.get("bucketName").and_then(Value::as_str);
            let matches = id_filter.map_or(true, |id| id == "bucket-1")
                && name_filter.map_or(true, |name| name == "test-bucket");
            let buckets: Vec<Value> = if matches {
                vec![json!({
                    "accountId": "acct-1",
                    "bucketId": "bucket-1",
                    "bucketName": "test-bucket",
                    "bucketType": "allPrivate",
                    "bucketInfo": {},
                    "revision": 1
                })]
            } else {
                Vec::new()
            };
            ok(json!({ "buckets": buckets }))
        }
        "b2_get_upload_url" => {
            if request.get("bucketId").and_then(Value::as_str) != Some("bucket-1") {
                return error(400, "bad_request", "unknown bucketId");
            }
            let id = inner.fresh_id();
            let endpoint = format!("u{}", id);
            let token = format!("upload-token-{}", id);
            inner.endpoints.insert(
                endpoint.clone(),
                Endpoint {
                    token: token.clone(),
                    kind: EndpointKind::Single,
                },
            );
            ok(json!({
                "bucketId": "bucket-1",
                "uploadUrl": format!("{}/upload/{}", inner.base_url, endpoint),
                "authorizationToken": token
            }))
        }
        "b2_get_upload_part_url" => {
            let file_id = match request.get("fileId").and_then(Value::as_str) {
                Some(id) if inner.large.contains_key(id) => id.to_string(),
                _ => return error(400, "bad_request", "unknown fileId"),
            };
            let id = inner.fresh_id();
            let endpoint = format!("p{}", id);
            let token = format!("part-token-{}", id);
            inner.endpoints.insert(
                endpoint.clone(),
                Endpoint {
                    token: token.clone(),
                    kind: EndpointKind::Part {
                        file_id: file_id.clone(),
                    },
                },
            );
            ok(json!({
                "fileId": file_id,
                "uploadUrl": format!("{}/upload/{}", inner.base_url, endpoint),
                "authorizationToken": token
            }))
        }
        "b2_start_large_file" => {
            let file_name = request
                .get("fileName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let content_type = request
                .get("contentType")
                .and_then(Value::as_str)
                .unwrap_or("b2/x-auto")
                .to_string();
            let file_info = request.get("fileInfo").cloned().unwrap_or(json!({}));
            let file_id = format!("large-{}", inner.fresh_id());
            inner.large.insert(
                file_id.clone(),
                LargeFile {
                    file_name: file_name.clone(),
                    content_type: content_type.clone(),
                    file_info: file_info.clone(),
                    parts: BTreeMap::new(),
                },
            );
            ok(json!({
                "accountId": "acct-1",
                "action": "start",
                "bucketId": "bucket-1",
                "contentLength": 0,
                "contentType": content_type,
                "fileId": file_id,
                "fileInfo": file_info,
                "fileName": file_name,
                "uploadTimestamp": 1_700_000_000_000i64
            }))
        }
        "b2_finish_large_file" => {
            let file_id = request
                .get("fileId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let sha1_array: Vec<String> = request
                .get("partSha1Array")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let large = match inner.large.remove(&file_id) {
                Some(large) => large,
                None => return error(400, "bad_request", "unknown fileId"),
            };
            // The part list must be 1..=K with no gaps and the sha array must match
            // it in order.
            let expected: Vec<String> = large
                .parts
                .values()
                .map(|(sha1, _)| sha1.clone())
                .collect();
            let contiguous = large
                .parts
                .keys()
                .enumerate()
                .all(|(index, number)| index + 1 == *number);
            if !contiguous || expected != sha1_array {
                return error(400, "bad_request", "part checksums do not match");
            }
            inner.finishes.push(FinishRecord {
                file_id: file_id.clone(),
                part_sha1_array: sha1_array,
            });
            let content: Vec<u8> = large
                .parts
                .values()
                .flat_map(|(_, bytes)| bytes.iter().copied())
                .collect();
            let file = StoredFile {
                file_id: file_id.clone(),
                file_name: large.file_name.clone(),
                content,
                content_sha1: None,
                content_type: large.content_type.clone(),
                file_info: large.file_info.clone(),
            };
            let response = file_json(&file);
            inner.file_ids.insert(file_id, large.file_name.clone());
            inner.files.insert(large.file_name, file);
            ok(response)
        }
        "b2_cancel_large_file" => {
            let file_id = request
                .get("fileId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let large = match inner.large.remove(&file_id) {
                Some(large) => large,
                None => return error(400, "bad_request", "unknown fileId"),
            };
            inner.cancels.push(file_id.clone());
            ok(json!({
                "fileId": file_id,
                "fileName": large.file_name,
                "bucketId": "bucket-1",
                "accountId": "acct-1"
            }))
        }
        "b2_list_file_names" => {
            let start = request
                .get("startFileName")
                .and_then(Value::as_str)
                .unwrap_or("");
            let prefix = request.get("prefix").and_then(Value::as_str).unwrap_or("");
            let max = request
                .get("maxFileCount")
                .and_then(Value::as_u64)
                .unwrap_or(100) as usize;
            let mut files: Vec<Value> = Vec::new();
            let mut next_file_name: Option<String> = None;
            for (name, file) in inner.files.range(start.to_string()..) {
                if !name.starts_with(prefix) {
                    continue;
                }
                if files.len() == max {
                    next_file_name = Some(name.clone());
                    break;
                }
                files.push(file_json(file));
            }
            ok(json!({ "files": files, "nextFileName": next_file_name }))
        }
        "b2_get_file_info" => {
            let file_id = request
                .get("fileId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match inner
                .file_ids
                .get(file_id)
                .and_then(|name| inner.files.get(name))
            {
                Some(file) => ok(file_json(file)),
                None => error(404, "not_found", "no such file"),
            }
        }
        _ => error(400, "bad_request", "unknown api operation"),
    }
}

fn upload(
    inner: &mut Inner,
    endpoint: String,
    parts: &http::request::Parts,
    body: Bytes,
) -> Response<Body> {
    let token = match inner.endpoints.get(&endpoint) {
        Some(ep) => ep.token.clone(),
        None => return error(404, "not_found", "no such upload url"),
    };
    let auth_token = header(parts, "Authorization").unwrap_or_default().to_string();
    let part_number = header(parts, "X-Bz-Part-Number").and_then(|v| v.parse().ok());
    inner.uploads.push(UploadRecord {
        endpoint: endpoint.clone(),
        auth_token: auth_token.clone(),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: body.to_vec(),
        part_number,
    });
    if auth_token != token {
        return error(401, "expired_auth_token", "upload token mismatch");
    }
    if let Some(status) = inner.upload_faults.pop_front() {
        return fault_response(status);
    }
    let declared: Option<u64> = header(parts, "Content-Length").and_then(|v| v.parse().ok());
    if declared != Some(body.len() as u64) {
        return error(400, "bad_request", "content length mismatch");
    }
    let sha1_header = header(parts, "X-Bz-Content-Sha1").unwrap_or_default().to_string();

    let kind = match inner.endpoints.get(&endpoint).map(|ep| &ep.kind) {
        Some(EndpointKind::Single) => None,
        Some(EndpointKind::Part { file_id }) => Some(file_id.clone()),
        None => unreachable!(),
    };
    match kind {
        None => {
            let (content, content_sha1) = if sha1_header == "hex_digits_at_end" {
                if body.len() < 40 {
                    return error(400, "bad_request", "body shorter than sha1 trailer");
                }
                let (content, trailer) = body.split_at(body.len() - 40);
                let trailer = String::from_utf8_lossy(trailer).to_string();
                if sha1_hex(content) != trailer {
                    return error(400, "bad_request", "sha1 trailer mismatch");
                }
                (content.to_vec(), trailer)
            } else {
                if sha1_hex(&body) != sha1_header {
                    return error(400, "bad_request", "sha1 mismatch");
                }
                (body.to_vec(), sha1_header)
            };
            let file_name = header(parts, "X-Bz-File-Name").unwrap_or_default().to_string();
            let content_type = header(parts, "Content-Type").unwrap_or_default().to_string();
            let file_info: Value = Value::Object(
                parts
                    .headers
                    .iter()
                    .filter_map(|(name, value)| {
                        let key = name.as_str().strip_prefix("x-bz-info-")?;
                        Some((
                            key.to_string(),
                            Value::String(value.to_str().ok()?.to_string()),
                        ))
                    })
                    .collect(),
            );
            let file = StoredFile {
                file_id: format!("file-{}", inner.fresh_id()),
                file_name: file_name.clone(),
                content,
                content_sha1: Some(content_sha1),
                content_type,
                file_info,
            };
            let response = file_json(&file);
            inner.file_ids.insert(file.file_id.clone(), file_name.clone());
            inner.files.insert(file_name, file);
            ok(response)
        }
        Some(file_id) => {
            let number = match part_number {
                Some(number) if (1..=10_000).contains(&number) => number,
                _ => return error(400, "bad_request", "bad part number"),
            };
            if sha1_hex(&body) != sha1_header {
                return error(400, "bad_request", "sha1 mismatch");
            }
            match inner.large.get_mut(&file_id) {
                Some(large) => {
                    large.parts.insert(number, (sha1_header.clone(), body.to_vec()));
                }
                None => return error(400, "bad_request", "large file gone"),
            }
            ok(json!({
                "fileId": file_id,
                "partNumber": number,
                "contentLength": body.len(),
                "contentSha1": sha1_header,
                "uploadTimestamp": 1_700_000_000_000i64
            }))
        }
    }
}

fn download_by_name(
    inner: &Inner,
    parts: &http::request::Parts,
    rest: &str,
) -> Response<Body> {
    if let Some(resp) = check_account_token(inner, parts) {
        return resp;
    }
    let mut pieces = rest.splitn(2, '/');
    let bucket = pieces.next().unwrap_or_default();
    let name = pieces.next().unwrap_or_default();
    if bucket != "test-bucket" {
        return error(404, "not_found", "no such bucket");
    }
    match inner.files.get(name) {
        Some(file) => serve_file(file, parts),
        None => error(404, "no_such_file", "file not present"),
    }
}

fn download_by_id(
    inner: &Inner,
    parts: &http::request::Parts,
    file_id: &str,
) -> Response<Body> {
    if let Some(resp) = check_account_token(inner, parts) {
        return resp;
    }
    match inner
        .file_ids
        .get(file_id)
        .and_then(|name| inner.files.get(name))
    {
        Some(file) => serve_file(file, parts),
        None => error(404, "no_such_file", "file not present"),
    }
}

fn serve_file(file: &StoredFile, parts: &http::request::Parts) -> Response<Body> {
    let range = header(parts, "Range")
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| {
            let mut pieces = value.splitn(2, '-');
            let start: u64 = pieces.next()?.parse().ok()?;
            let end: u64 = pieces.next()?.parse().ok()?;
            Some((start as usize, end as usize))
        });
    let (status, content) = match range {
        Some((start, end)) => {
            if start >= file.content.len() || end < start {
                return error(416, "range_not_satisfiable", "bad range");
            }
            let end = end.min(file.content.len() - 1);
            (StatusCode::PARTIAL_CONTENT, file.content[start..=end].to_vec())
        }
        None => (StatusCode::OK, file.content.clone()),
    };
    Response::builder()
        .status(status)
        .header("Content-Length", content.len())
        .header("Content-Type", file.content_type.as_str())
        .header(
            "X-Bz-Content-Sha1",
            file.content_sha1.as_deref().unwrap_or("none"),
        )
        .header("X-Bz-File-Id", file.file_id.as_str())
        .body(Body::from(content))
        .unwrap()
}
