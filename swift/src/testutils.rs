//! In-memory Swift and Keystone for tests
//!
//! [`MemoryStore`] implements [`Transport`] so a [`Context`] can be built against it exactly as
//! against a real deployment. Identity lives under `https://keystone.test/` (v2 and v3
//! exchanges), accounts under `https://swift.test/v1/AUTH_<tenant>/`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::json;

use crate::context::Context;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::transport::{Request, Response, Transport};

pub const AUTH_URL_V2: &str = "https://keystone.test/v2.0";
pub const AUTH_URL_V3: &str = "https://keystone.test/v3";
pub const STORAGE_URL: &str = "https://swift.test/v1/";
pub const REGION: &str = "TEST1";
pub const DEFAULT_PASSWORD: &str = "password";

const SWIFT_HOST: &str = "swift.test";
const KEYSTONE_HOST: &str = "keystone.test";

/// Request as seen by the store, with a decoded path.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub content_type: String,
    /// `x-object-meta-*` headers, lower-case
    pub meta: BTreeMap<String, String>,
    /// `container/prefix` of a dynamic large object
    pub dlo_manifest: Option<String>,
    /// Segment list of a static large object
    pub slo_segments: Option<Vec<String>>,
    pub last_modified: chrono::NaiveDateTime,
}

impl StoredObject {
    fn new(data: Bytes, content_type: &str) -> Self {
        Self {
            etag: format!("{:x}", md5::compute(&data)),
            data,
            content_type: content_type.to_string(),
            meta: BTreeMap::new(),
            dlo_manifest: None,
            slo_segments: None,
            last_modified: chrono::Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Default)]
struct Container {
    meta: BTreeMap<String, String>,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Default)]
struct Account {
    meta: BTreeMap<String, String>,
    containers: BTreeMap<String, Container>,
}

#[derive(Debug)]
struct User {
    password: String,
    tenant: String,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, User>,
    /// token -> tenant
    tokens: HashMap<String, String>,
    issued: u64,
    accounts: HashMap<String, Account>,
    failing_copies: u32,
    hidden_probes: u32,
    /// (account, container, object) -> probes still answered with 404
    hidden: HashMap<(String, String, String), u32>,
    requests: Vec<RecordedRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn account_name(tenant: &str) -> String {
    format!("AUTH_{tenant}")
}

fn reply(status: StatusCode) -> Response {
    Response::from_bytes(status, HeaderMap::new(), Bytes::new())
}

fn reply_with(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Response {
    Response::from_bytes(status, headers, body)
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Applies `prefix*` headers to `meta`; empty values remove the entry.
fn apply_meta(meta: &mut BTreeMap<String, String>, headers: &HeaderMap, prefixes: &[&str]) {
    for (name, value) in headers {
        let name = name.as_str();
        if !prefixes.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }
        match value.to_str() {
            Ok("") | Err(_) => {
                meta.remove(name);
            }
            Ok(value) => {
                meta.insert(name.to_string(), value.to_string());
            }
        }
    }
}

fn md5_of_etags<'a>(etags: impl Iterator<Item = &'a str>) -> String {
    let joined: String = etags.collect();
    format!("{:x}", md5::compute(joined.as_bytes()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, tenant: &str, user: &str, password: &str) {
        let mut state = self.lock();
        state.users.insert(
            user.to_string(),
            User {
                password: password.to_string(),
                tenant: tenant.to_string(),
            },
        );
        state.accounts.entry(account_name(tenant)).or_default();
    }

    /// Legacy-auth credentials pointing at this store.
    pub fn credentials(tenant: &str, user: &str, password: &str) -> Credentials {
        Credentials::password(user, password, tenant)
            .with_auth_url(AUTH_URL_V2)
            .with_region(REGION)
    }

    /// Authenticated context for `tenant`, creating its user on first use.
    pub async fn context(&self, tenant: &str) -> Result<Context> {
        let user = format!("user-{tenant}");
        if !self.lock().users.contains_key(&user) {
            self.add_user(tenant, &user, DEFAULT_PASSWORD);
        }
        Context::build(
            Self::credentials(tenant, &user, DEFAULT_PASSWORD),
            Arc::new(self.clone()),
        )
        .await
    }

    pub fn create_container(&self, tenant: &str, container: &str) {
        self.lock()
            .accounts
            .entry(account_name(tenant))
            .or_default()
            .containers
            .entry(container.to_string())
            .or_default();
    }

    fn insert(&self, tenant: &str, container: &str, name: &str, object: StoredObject) {
        self.lock()
            .accounts
            .entry(account_name(tenant))
            .or_default()
            .containers
            .entry(container.to_string())
            .or_default()
            .objects
            .insert(name.to_string(), object);
    }

    /// Stores a plain object, creating account and container as needed.
    pub fn insert_object(&self, tenant: &str, container: &str, name: &str, data: impl Into<Bytes>) {
        self.insert(
            tenant,
            container,
            name,
            StoredObject::new(data.into(), "application/octet-stream"),
        );
    }

    /// Stores a dynamic large object manifest pointing at `pointer` (`container/prefix`).
    pub fn insert_dlo(&self, tenant: &str, container: &str, name: &str, pointer: &str) {
        let mut object = StoredObject::new(Bytes::new(), "application/octet-stream");
        object.dlo_manifest = Some(pointer.to_string());
        self.insert(tenant, container, name, object);
    }

    pub fn object(&self, tenant: &str, container: &str, name: &str) -> Option<StoredObject> {
        self.lock()
            .accounts
            .get(&account_name(tenant))
            .and_then(|account| account.containers.get(container))
            .and_then(|container| container.objects.get(name))
            .cloned()
    }

    pub fn object_names(&self, tenant: &str, container: &str) -> Vec<String> {
        self.lock()
            .accounts
            .get(&account_name(tenant))
            .and_then(|account| account.containers.get(container))
            .map(|container| container.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The next `count` server-side copies answer 504 and the copied object stays invisible
    /// for `hidden_probes` reads.
    pub fn fail_next_copies(&self, count: u32, hidden_probes: u32) {
        let mut state = self.lock();
        state.failing_copies = count;
        state.hidden_probes = hidden_probes;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Number of recorded requests with `method` (storage requests only).
    pub fn count(&self, method: &Method) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|request| request.host == SWIFT_HOST && request.method == *method)
            .count()
    }

    fn handle(&self, request: &Request, body: Bytes) -> Response {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            method: request.method.clone(),
            host: host.clone(),
            path: decode(request.url.path()),
            query: request.url.query().unwrap_or_default().to_string(),
            headers: request.headers.clone(),
        });
        match host.as_str() {
            KEYSTONE_HOST => state.identity(request, &body),
            SWIFT_HOST => state.storage(request, body),
            _ => reply(StatusCode::NOT_FOUND),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryStore {
    async fn send(&self, request: Request) -> Result<Response> {
        let mut request = request;
        let body = std::mem::take(&mut request.body).collect().await?;
        Ok(self.handle(&request, body))
    }
}

struct Target {
    account: String,
    container: String,
    object: String,
}

impl State {
    fn issue_token(&mut self, tenant: &str) -> String {
        self.issued += 1;
        let token = format!("tok-{}-{}", tenant, self.issued);
        self.tokens.insert(token.clone(), tenant.to_string());
        token
    }

    fn check_password(&self, user: &str, password: &str) -> Option<String> {
        self.users
            .get(user)
            .filter(|record| record.password == password)
            .map(|record| record.tenant.clone())
    }

    fn identity(&mut self, request: &Request, body: &[u8]) -> Response {
        let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
            return reply(StatusCode::BAD_REQUEST);
        };
        let auth = &payload["auth"];
        match request.url.path() {
            "/v2.0/tokens" => {
                let tenant = if let Some(token) = auth["token"]["id"].as_str() {
                    self.tokens.get(token).cloned()
                } else {
                    let credentials = &auth["passwordCredentials"];
                    self.check_password(
                        credentials["username"].as_str().unwrap_or_default(),
                        credentials["password"].as_str().unwrap_or_default(),
                    )
                };
                let scope = auth["tenantId"].as_str().or(auth["tenantName"].as_str());
                match tenant {
                    Some(tenant) if scope.is_none_or(|scope| scope == tenant) => {
                        let token = self.issue_token(&tenant);
                        let body = json!({
                            "access": {
                                "token": { "id": token, "tenant": { "id": tenant } },
                                "serviceCatalog": [
                                    {
                                        "type": "object-store",
                                        "endpoints": [
                                            {
                                                "region": "OTHER",
                                                "publicURL": "https://elsewhere.test/v1/x",
                                            },
                                            {
                                                "region": REGION,
                                                "publicURL": format!("{STORAGE_URL}{}", account_name(&tenant)),
                                            },
                                        ],
                                    },
                                    {
                                        "type": "identity",
                                        "endpoints": [
                                            { "region": REGION, "publicURL": AUTH_URL_V2 },
                                        ],
                                    },
                                ],
                            }
                        });
                        reply_with(StatusCode::OK, HeaderMap::new(), body.to_string())
                    }
                    _ => reply(StatusCode::UNAUTHORIZED),
                }
            }
            "/v3/auth/tokens" => {
                let identity = &auth["identity"];
                let tenant = if let Some(token) = identity["token"]["id"].as_str() {
                    self.tokens.get(token).cloned()
                } else {
                    let user = &identity["password"]["user"];
                    self.check_password(
                        user["name"].as_str().unwrap_or_default(),
                        user["password"].as_str().unwrap_or_default(),
                    )
                };
                let project = &auth["scope"]["project"];
                let scope = project["id"].as_str().or(project["name"].as_str());
                match tenant {
                    Some(tenant) if scope.is_none_or(|scope| scope == tenant) => {
                        let token = self.issue_token(&tenant);
                        let url = format!("{STORAGE_URL}{}", account_name(&tenant));
                        let body = json!({
                            "token": {
                                "project": { "id": tenant },
                                "catalog": [
                                    {
                                        "type": "object-store",
                                        "endpoints": [
                                            {
                                                "region_id": REGION,
                                                "region": REGION,
                                                "interface": "internal",
                                                "url": "https://internal.test/v1/x",
                                            },
                                            {
                                                "region_id": REGION,
                                                "region": REGION,
                                                "interface": "public",
                                                "url": url,
                                            },
                                        ],
                                    },
                                ],
                            }
                        });
                        let mut headers = HeaderMap::new();
                        set_header(&mut headers, "x-subject-token", &token);
                        reply_with(StatusCode::CREATED, headers, body.to_string())
                    }
                    _ => reply(StatusCode::UNAUTHORIZED),
                }
            }
            _ => reply(StatusCode::NOT_FOUND),
        }
    }

    fn target(url: &Url) -> Option<Target> {
        let rest = url.path().strip_prefix("/v1/")?;
        let mut parts = rest.splitn(3, '/');
        Some(Target {
            account: decode(parts.next()?),
            container: decode(parts.next().unwrap_or_default()),
            object: decode(parts.next().unwrap_or_default()),
        })
    }

    fn temp_url_keys(&self, target: &Target) -> Vec<String> {
        let Some(account) = self.accounts.get(&target.account) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = ["x-account-meta-temp-url-key", "x-account-meta-temp-url-key-2"]
            .iter()
            .filter_map(|name| account.meta.get(*name).cloned())
            .collect();
        if let Some(container) = account.containers.get(&target.container) {
            keys.extend(
                ["x-container-meta-temp-url-key", "x-container-meta-temp-url-key-2"]
                    .iter()
                    .filter_map(|name| container.meta.get(*name).cloned()),
            );
        }
        keys
    }

    fn authorized(&self, request: &Request, target: &Target) -> bool {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        if let Some(sig) = query.get("temp_url_sig") {
            let Some(expires) = query
                .get("temp_url_expires")
                .and_then(|expires| expires.parse::<u64>().ok())
            else {
                return false;
            };
            if i64::try_from(expires).unwrap_or(i64::MAX) < chrono::Utc::now().timestamp() {
                return false;
            }
            // HEAD is allowed with a GET signature
            let mut methods = vec![request.method.clone()];
            if request.method == Method::HEAD {
                methods.push(Method::GET);
            }
            let path = decode(request.url.path());
            return self.temp_url_keys(target).iter().any(|key| {
                methods.iter().any(|method| {
                    crate::tempurl::signature(key, method, expires, &path)
                        .is_ok_and(|expected| &expected == sig)
                })
            });
        }
        header(&request.headers, "x-auth-token")
            .and_then(|token| self.tokens.get(token))
            .is_some_and(|tenant| account_name(tenant) == target.account)
    }

    fn storage(&mut self, request: &Request, body: Bytes) -> Response {
        let Some(target) = Self::target(&request.url) else {
            return reply(StatusCode::NOT_FOUND);
        };
        if !self.authorized(request, &target) {
            return reply(StatusCode::UNAUTHORIZED);
        }
        if target.container.is_empty() {
            self.account_request(request, &target)
        } else if target.object.is_empty() {
            self.container_request(request, &target)
        } else {
            self.object_request(request, &target, body)
        }
    }

    fn account_request(&mut self, request: &Request, target: &Target) -> Response {
        let account = self.accounts.entry(target.account.clone()).or_default();
        match request.method {
            Method::HEAD | Method::GET => {
                let mut headers = HeaderMap::new();
                for (name, value) in &account.meta {
                    set_header(&mut headers, name, value);
                }
                set_header(
                    &mut headers,
                    "x-account-container-count",
                    &account.containers.len().to_string(),
                );
                let names: Vec<serde_json::Value> = account
                    .containers
                    .keys()
                    .map(|name| json!({ "name": name }))
                    .collect();
                let body = if request.method == Method::GET {
                    serde_json::Value::Array(names).to_string()
                } else {
                    String::new()
                };
                reply_with(StatusCode::OK, headers, body)
            }
            Method::POST => {
                apply_meta(&mut account.meta, &request.headers, &["x-account-meta-"]);
                reply(StatusCode::NO_CONTENT)
            }
            _ => reply(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn container_request(&mut self, request: &Request, target: &Target) -> Response {
        const CONTAINER_META: &[&str] =
            &["x-container-meta-", "x-container-read", "x-container-write"];
        let account = self.accounts.entry(target.account.clone()).or_default();
        match request.method {
            Method::PUT => {
                let created = !account.containers.contains_key(&target.container);
                let container = account.containers.entry(target.container.clone()).or_default();
                apply_meta(&mut container.meta, &request.headers, CONTAINER_META);
                reply(if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::ACCEPTED
                })
            }
            Method::POST => match account.containers.get_mut(&target.container) {
                Some(container) => {
                    apply_meta(&mut container.meta, &request.headers, CONTAINER_META);
                    reply(StatusCode::NO_CONTENT)
                }
                None => reply(StatusCode::NOT_FOUND),
            },
            Method::DELETE => match account.containers.get(&target.container) {
                Some(container) if !container.objects.is_empty() => reply(StatusCode::CONFLICT),
                Some(_) => {
                    account.containers.remove(&target.container);
                    reply(StatusCode::NO_CONTENT)
                }
                None => reply(StatusCode::NOT_FOUND),
            },
            Method::HEAD | Method::GET => {
                let Some(container) = account.containers.get(&target.container) else {
                    return reply(StatusCode::NOT_FOUND);
                };
                let mut headers = HeaderMap::new();
                for (name, value) in &container.meta {
                    set_header(&mut headers, name, value);
                }
                set_header(
                    &mut headers,
                    "x-container-object-count",
                    &container.objects.len().to_string(),
                );
                let bytes_used: usize = container
                    .objects
                    .values()
                    .map(|object| object.data.len())
                    .sum();
                set_header(&mut headers, "x-container-bytes-used", &bytes_used.to_string());
                if request.method == Method::HEAD {
                    return reply_with(StatusCode::NO_CONTENT, headers, Bytes::new());
                }
                let query: HashMap<String, String> =
                    request.url.query_pairs().into_owned().collect();
                let prefix = query.get("prefix").map(String::as_str).unwrap_or_default();
                let marker = query.get("marker").map(String::as_str);
                let limit = query
                    .get("limit")
                    .and_then(|limit| limit.parse::<usize>().ok())
                    .unwrap_or(10_000);
                let entries: Vec<serde_json::Value> = container
                    .objects
                    .iter()
                    .filter(|(name, _)| marker.is_none_or(|marker| name.as_str() > marker))
                    .filter(|(name, _)| name.starts_with(prefix))
                    .take(limit)
                    .map(|(name, object)| {
                        json!({
                            "name": name,
                            "hash": object.etag,
                            "bytes": object.data.len(),
                            "content_type": object.content_type,
                            "last_modified": object
                                .last_modified
                                .format("%Y-%m-%dT%H:%M:%S%.6f")
                                .to_string(),
                        })
                    })
                    .collect();
                set_header(&mut headers, "content-type", "application/json; charset=utf-8");
                let body = serde_json::Value::Array(entries).to_string();
                reply_with(StatusCode::OK, headers, body)
            }
            _ => reply(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn lookup(&self, account: &str, container: &str, name: &str) -> Option<&StoredObject> {
        self.accounts
            .get(account)?
            .containers
            .get(container)?
            .objects
            .get(name)
    }

    /// Content and etag of an object as served by GET, large objects assembled.
    fn assemble(&self, account: &str, object: &StoredObject) -> (Bytes, String) {
        if let Some(pointer) = &object.dlo_manifest {
            let (container, prefix) = pointer.split_once('/').unwrap_or((pointer.as_str(), ""));
            let segments: Vec<&StoredObject> = self
                .accounts
                .get(account)
                .and_then(|account| account.containers.get(container))
                .map(|container| {
                    container
                        .objects
                        .iter()
                        .filter(|(name, _)| name.starts_with(prefix))
                        .map(|(_, segment)| segment)
                        .collect()
                })
                .unwrap_or_default();
            let data: Vec<u8> = segments
                .iter()
                .flat_map(|segment| segment.data.iter().copied())
                .collect();
            let etag = md5_of_etags(segments.iter().map(|segment| segment.etag.as_str()));
            return (data.into(), format!("\"{etag}\""));
        }
        if let Some(paths) = &object.slo_segments {
            let mut data = Vec::new();
            for path in paths {
                let path = path.trim_start_matches('/');
                if let Some((container, name)) = path.split_once('/') {
                    if let Some(segment) = self.lookup(account, container, name) {
                        data.extend_from_slice(&segment.data);
                    }
                }
            }
            return (data.into(), format!("\"{}\"", object.etag));
        }
        (object.data.clone(), object.etag.clone())
    }

    fn object_request(&mut self, request: &Request, target: &Target, body: Bytes) -> Response {
        let key = (
            target.account.clone(),
            target.container.clone(),
            target.object.clone(),
        );
        match request.method {
            Method::HEAD | Method::GET => {
                if let Some(remaining) = self.hidden.get_mut(&key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return reply(StatusCode::NOT_FOUND);
                    }
                    self.hidden.remove(&key);
                }
                let Some(object) = self.lookup(&target.account, &target.container, &target.object)
                else {
                    return reply(StatusCode::NOT_FOUND);
                };
                let (data, etag) = self.assemble(&target.account, object);
                let mut headers = HeaderMap::new();
                set_header(&mut headers, "etag", &etag);
                set_header(&mut headers, "content-type", &object.content_type);
                set_header(&mut headers, "content-length", &data.len().to_string());
                for (name, value) in &object.meta {
                    set_header(&mut headers, name, value);
                }
                if let Some(pointer) = &object.dlo_manifest {
                    set_header(&mut headers, "x-object-manifest", pointer);
                }
                if object.slo_segments.is_some() {
                    set_header(&mut headers, "x-static-large-object", "True");
                }
                let body = if request.method == Method::GET {
                    data
                } else {
                    Bytes::new()
                };
                reply_with(StatusCode::OK, headers, body)
            }
            Method::PUT => self.put_object(request, target, key, body),
            Method::POST => {
                let Some(object) = self
                    .accounts
                    .get_mut(&target.account)
                    .and_then(|account| account.containers.get_mut(&target.container))
                    .and_then(|container| container.objects.get_mut(&target.object))
                else {
                    return reply(StatusCode::NOT_FOUND);
                };
                object.meta.clear();
                apply_meta(&mut object.meta, &request.headers, &["x-object-meta-"]);
                if let Some(content_type) = header(&request.headers, "content-type") {
                    object.content_type = content_type.to_string();
                }
                object.dlo_manifest = header(&request.headers, "x-object-manifest")
                    .filter(|pointer| !pointer.is_empty())
                    .map(decode);
                reply(StatusCode::ACCEPTED)
            }
            Method::DELETE => {
                let removed = self
                    .accounts
                    .get_mut(&target.account)
                    .and_then(|account| account.containers.get_mut(&target.container))
                    .and_then(|container| container.objects.remove(&target.object));
                match removed {
                    Some(_) => reply(StatusCode::NO_CONTENT),
                    None => reply(StatusCode::NOT_FOUND),
                }
            }
            _ => reply(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn put_object(
        &mut self,
        request: &Request,
        target: &Target,
        key: (String, String, String),
        body: Bytes,
    ) -> Response {
        let exists = self
            .accounts
            .get(&target.account)
            .is_some_and(|account| account.containers.contains_key(&target.container));
        if !exists {
            return reply(StatusCode::NOT_FOUND);
        }
        let expected_etag = header(&request.headers, "etag").map(|etag| etag.trim_matches('"'));
        let content_type = header(&request.headers, "content-type");
        let query = request.url.query().unwrap_or_default();
        let (object, status) = if query.contains("multipart-manifest=put") {
            #[derive(serde::Deserialize)]
            struct Segment {
                path: String,
                etag: String,
            }
            let Ok(segments) = serde_json::from_slice::<Vec<Segment>>(&body) else {
                return reply(StatusCode::BAD_REQUEST);
            };
            let etag = md5_of_etags(segments.iter().map(|segment| segment.etag.as_str()));
            if expected_etag.is_some_and(|expected| expected != etag) {
                return reply(StatusCode::UNPROCESSABLE_ENTITY);
            }
            let mut object = StoredObject::new(
                Bytes::new(),
                content_type.unwrap_or("application/octet-stream"),
            );
            object.etag = etag;
            object.slo_segments =
                Some(segments.into_iter().map(|segment| segment.path).collect());
            (object, StatusCode::CREATED)
        } else if let Some(source) = header(&request.headers, "x-copy-from") {
            let source = decode(source.trim_start_matches('/'));
            let Some((container, name)) = source.split_once('/') else {
                return reply(StatusCode::PRECONDITION_FAILED);
            };
            let account = header(&request.headers, "x-copy-from-account")
                .map(str::to_string)
                .unwrap_or_else(|| target.account.clone());
            let Some(source) = self.lookup(&account, container, name) else {
                return reply(StatusCode::NOT_FOUND);
            };
            let mut object = source.clone();
            object.last_modified = chrono::Utc::now().naive_utc();
            if let Some(content_type) = content_type {
                object.content_type = content_type.to_string();
            }
            if self.failing_copies > 0 {
                self.failing_copies -= 1;
                self.hidden.insert(key, self.hidden_probes);
                (object, StatusCode::GATEWAY_TIMEOUT)
            } else {
                (object, StatusCode::CREATED)
            }
        } else {
            let mut object =
                StoredObject::new(body, content_type.unwrap_or("application/octet-stream"));
            if expected_etag.is_some_and(|expected| expected != object.etag) {
                return reply(StatusCode::UNPROCESSABLE_ENTITY);
            }
            apply_meta(&mut object.meta, &request.headers, &["x-object-meta-"]);
            object.dlo_manifest = header(&request.headers, "x-object-manifest").map(decode);
            (object, StatusCode::CREATED)
        };
        let etag = object.etag.clone();
        if let Some(container) = self
            .accounts
            .get_mut(&target.account)
            .and_then(|account| account.containers.get_mut(&target.container))
        {
            container.objects.insert(target.object.clone(), object);
        }
        let mut headers = HeaderMap::new();
        if status.is_success() {
            set_header(&mut headers, "etag", &etag);
        }
        reply_with(status, headers, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_with_scripted_timeout_hides_object() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert_object("src", "c", "file", "data");
        let ctx = store.context("dst").await?;
        crate::storage::create_container(&ctx, "cas", HeaderMap::new()).await?;
        store.fail_next_copies(1, 2);
        let headers = crate::headers(&[
            ("x-copy-from", "c/file"),
            ("x-copy-from-account", "AUTH_src"),
        ])?;
        let err = crate::storage::put(
            &ctx,
            "cas",
            "copy",
            crate::RequestOptions::default().with_headers(headers),
        )
        .await
        .unwrap_err();
        assert!(err.is_gateway_timeout());
        for _ in 0..2 {
            let err = crate::storage::head(&ctx, "cas", "copy").await.unwrap_err();
            assert!(err.is_not_found());
        }
        crate::storage::head(&ctx, "cas", "copy").await?;
        assert_eq!(
            store.object("dst", "cas", "copy").map(|object| object.data),
            Some(Bytes::from("data"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn dlo_is_served_concatenated() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert_object("t", "segments", "big/0001", "hello ");
        store.insert_object("t", "segments", "big/0002", "world");
        store.insert_dlo("t", "files", "big", "segments/big/");
        let ctx = store.context("t").await?;
        let response = crate::storage::download(&ctx, "files", "big").await?;
        assert_eq!(response.header_str("x-object-manifest"), Some("segments/big/"));
        assert_eq!(&response.bytes().await?[..], b"hello world");
        Ok(())
    }
}
