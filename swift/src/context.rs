//! Session context: authenticated endpoints, request building and cached metadata
//!
//! A [`Context`] is built once per remote and shared read-only (behind an `Arc`) by every
//! worker. [`Context::renew`] needs `&mut self`, so a token swap can never interleave with
//! requests that borrow the context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use tracing::{debug, instrument};

use crate::auth::{self, Session};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::transport::{Body, Request, Response, Transport};

pub const OBJECT_STORE: &str = "object-store";

const AUTH_TOKEN: &str = "x-auth-token";
const ACCOUNT_TEMP_URL_KEY: &str = "x-account-meta-temp-url-key";
const CONTAINER_TEMP_URL_KEY: &str = "x-container-meta-temp-url-key";

/// Per-call request parameters.
///
/// Header precedence, lowest first: context defaults (`Accept`, `User-Agent`), the session
/// token, then `headers` given here.
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    /// Query pairs appended after any query already present in the path
    pub query: Vec<(String, String)>,
    pub body: Body,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }
}

/// Builds a header map from string pairs, rejecting invalid names or values.
pub fn headers(pairs: &[(&str, &str)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| Error::Config(format!("invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| Error::Config(format!("invalid value for header '{name}': {err}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

pub(crate) fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn encode_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encoded `container` path relative to the object-store endpoint.
pub fn container_path(container: &str) -> String {
    urlencoding::encode(container).into_owned()
}

/// Percent-encoded `container/name` path, keeping the `/` separators of `name`.
pub fn object_path(container: &str, name: &str) -> String {
    format!("{}/{}", container_path(container), encode_segments(name))
}

pub struct Context {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    session: Session,
    default_headers: HeaderMap,
    containers: Mutex<HashMap<String, HeaderMap>>,
    account: Mutex<Option<HeaderMap>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("region", &self.credentials.region)
            .field("endpoints", &self.session.endpoints)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Opens a session for `credentials`.
    ///
    /// Direct containers get a fixed endpoint without any network traffic; every other
    /// configuration goes through the identity exchange of its auth version.
    #[instrument(skip_all)]
    pub async fn build(credentials: Credentials, transport: Arc<dyn Transport>) -> Result<Self> {
        let session = auth::authenticate(transport.as_ref(), &credentials).await?;
        debug!(
            "session opened with {} endpoint(s) in region {}",
            session.endpoints.len(),
            credentials.region
        );
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("swiftcas/", env!("CARGO_PKG_VERSION"))),
        );
        Ok(Self {
            transport,
            credentials,
            session,
            default_headers,
            containers: Mutex::new(HashMap::new()),
            account: Mutex::new(None),
        })
    }

    /// Re-runs the identity exchange and swaps token and endpoints together.
    ///
    /// On failure the previous session stays in place.
    #[instrument(skip(self))]
    pub async fn renew(&mut self) -> Result<()> {
        let session = auth::authenticate(self.transport.as_ref(), &self.credentials).await?;
        self.session = session;
        self.invalidate_account();
        Ok(())
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn token(&self) -> Option<&str> {
        self.session.token.as_deref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn endpoint(&self, service: &str) -> Result<&Url> {
        self.session
            .endpoints
            .get(service)
            .ok_or_else(|| Error::Endpoint {
                service: service.to_string(),
                region: self.credentials.region.clone(),
            })
    }

    /// Account name (`AUTH_...`) of the object-store endpoint.
    pub fn account(&self) -> Result<String> {
        let endpoint = self.endpoint(OBJECT_STORE)?;
        let from_path = endpoint
            .path_segments()
            .and_then(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .next_back()
                    .map(str::to_string)
            })
            .filter(|segment| segment.starts_with("AUTH_"));
        if let Some(account) = from_path {
            return Ok(account);
        }
        match &self.session.tenant_id {
            Some(tenant_id) => Ok(format!("AUTH_{tenant_id}")),
            None => Err(Error::Config(format!(
                "cannot determine the account of endpoint {endpoint}"
            ))),
        }
    }

    /// Builds a request for `path` relative to the endpoint of `service`.
    ///
    /// `path` must already be percent-encoded and may carry its own query string.
    pub fn resolve(&self, service: &str, path: &str, options: RequestOptions) -> Result<Request> {
        let endpoint = self.endpoint(service)?;
        let raw = format!("{}{}", endpoint.as_str(), path.trim_start_matches('/'));
        let mut url =
            Url::parse(&raw).map_err(|err| Error::Config(format!("invalid url {raw}: {err}")))?;
        if !options.query.is_empty() {
            url.query_pairs_mut().extend_pairs(options.query.iter());
        }
        let mut headers = self.default_headers.clone();
        if let Some(token) = self.token() {
            let token = HeaderValue::from_str(token)
                .map_err(|_| Error::Auth("token is not a valid header value".to_string()))?;
            headers.insert(AUTH_TOKEN, token);
        }
        headers.extend(options.headers);
        Ok(Request {
            method: options.method,
            url,
            headers,
            body: options.body,
        })
    }

    /// Sends a request to the object store; any non-2xx answer becomes [`Error::Storage`].
    pub async fn call(&self, path: &str, options: RequestOptions) -> Result<Response> {
        let request = self.resolve(OBJECT_STORE, path, options)?;
        let method = request.method.clone();
        let target = request.target();
        let response = self.transport.send(request).await?;
        if response.status.is_success() {
            return Ok(response);
        }
        let status = response.status;
        let headers = response.headers.clone();
        let mut message = response.text().await.unwrap_or_default();
        if message.trim().is_empty() {
            message = status.canonical_reason().unwrap_or("").to_string();
        }
        Err(Error::storage(method, target, status, message, headers))
    }

    /// Account metadata, served from the cache until the account is updated.
    pub async fn account_headers(&self) -> Result<HeaderMap> {
        let cached = self
            .account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(headers) = cached {
            return Ok(headers);
        }
        let response = self.call("", RequestOptions::new(Method::HEAD)).await?;
        self.cache_account(response.headers.clone());
        Ok(response.headers)
    }

    pub fn cache_account(&self, headers: HeaderMap) {
        *self.account.lock().unwrap_or_else(PoisonError::into_inner) = Some(headers);
    }

    pub fn invalidate_account(&self) {
        *self.account.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Container metadata, served from the cache after the first lookup.
    pub async fn container_headers(&self, container: &str) -> Result<HeaderMap> {
        let cached = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
            .cloned();
        if let Some(headers) = cached {
            return Ok(headers);
        }
        let response = self
            .call(&container_path(container), RequestOptions::new(Method::HEAD))
            .await?;
        self.cache_container(container, response.headers.clone());
        Ok(response.headers)
    }

    pub fn cache_container(&self, container: &str, headers: HeaderMap) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.to_string(), headers);
    }

    pub fn invalidate(&self, container: &str) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container);
    }

    /// Key used to sign temporary URLs for objects of `container`.
    ///
    /// A direct container uses its configured key. Otherwise the account key wins over the
    /// container key.
    pub async fn secret(&self, container: &str) -> Result<String> {
        if let Some(direct) = &self.credentials.direct {
            return Ok(direct.temp_url_key.clone());
        }
        if let Some(key) = header_string(&self.account_headers().await?, ACCOUNT_TEMP_URL_KEY) {
            return Ok(key);
        }
        let container_headers = self.container_headers(container).await?;
        header_string(&container_headers, CONTAINER_TEMP_URL_KEY).ok_or_else(|| {
            Error::Config(format!(
                "Invalid container '{container}' configuration (missing secret key)"
            ))
        })
    }
}
