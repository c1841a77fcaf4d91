//! Identity exchanges with Keystone-compatible auth endpoints

use std::collections::HashMap;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::credentials::{AuthVersion, Credentials};
use crate::error::{Error, Result};
use crate::transport::{Request, Transport};

/// Token plus the endpoints it unlocks in one region.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: Option<String>,
    /// Service type (e.g. `object-store`) to endpoint, always ending with `/`
    pub endpoints: HashMap<String, Url>,
    /// Tenant (v2) or project (v3) the token is scoped to
    pub tenant_id: Option<String>,
}

fn invalid() -> Error {
    Error::Auth("invalid credentials".to_string())
}

/// Parses an endpoint and makes sure joining a relative path keeps its last segment.
pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<Url> {
    let mut endpoint = endpoint.to_string();
    if !endpoint.ends_with('/') {
        endpoint.push('/');
    }
    Url::parse(&endpoint).map_err(|err| Error::Config(format!("invalid endpoint {endpoint}: {err}")))
}

#[derive(Deserialize)]
struct V2Reply {
    access: V2Access,
}

#[derive(Deserialize)]
struct V2Access {
    token: V2Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<V2Service>,
}

#[derive(Deserialize)]
struct V2Token {
    id: String,
    #[serde(default)]
    tenant: Option<V2Tenant>,
}

#[derive(Deserialize)]
struct V2Tenant {
    id: String,
}

#[derive(Deserialize)]
struct V2Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V2Endpoint>,
}

#[derive(Deserialize)]
struct V2Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: Option<String>,
}

#[derive(Deserialize)]
struct V3Reply {
    token: V3Token,
}

#[derive(Deserialize)]
struct V3Token {
    #[serde(default)]
    catalog: Vec<V3Service>,
    #[serde(default)]
    project: Option<V3Project>,
}

#[derive(Deserialize)]
struct V3Project {
    id: String,
}

#[derive(Deserialize)]
struct V3Service {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<V3Endpoint>,
}

#[derive(Deserialize)]
struct V3Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    interface: Option<String>,
    url: String,
}

fn v2_body(credentials: &Credentials) -> Result<serde_json::Value> {
    let mut auth = match (&credentials.token, &credentials.username, &credentials.password) {
        (Some(token), _, _) => json!({ "token": { "id": token } }),
        (None, Some(username), Some(password)) => json!({
            "passwordCredentials": { "username": username, "password": password }
        }),
        _ => {
            return Err(Error::Config(
                "either a token or username and password are required".to_string(),
            ));
        }
    };
    if let Some(tenant_id) = &credentials.tenant_id {
        auth["tenantId"] = json!(tenant_id);
    } else if let Some(tenant_name) = &credentials.tenant_name {
        auth["tenantName"] = json!(tenant_name);
    }
    Ok(json!({ "auth": auth }))
}

fn v3_body(credentials: &Credentials) -> Result<serde_json::Value> {
    let identity = match (&credentials.token, &credentials.username, &credentials.password) {
        (Some(token), _, _) => json!({ "methods": ["token"], "token": { "id": token } }),
        (None, Some(username), Some(password)) => json!({
            "methods": ["password"],
            "password": {
                "user": {
                    "name": username,
                    "domain": { "name": credentials.domain },
                    "password": password,
                }
            }
        }),
        _ => {
            return Err(Error::Config(
                "either a token or username and password are required".to_string(),
            ));
        }
    };
    let mut auth = json!({ "identity": identity });
    if let Some(tenant_id) = &credentials.tenant_id {
        auth["scope"] = json!({ "project": { "id": tenant_id } });
    } else if let Some(tenant_name) = &credentials.tenant_name {
        auth["scope"] = json!({
            "project": { "name": tenant_name, "domain": { "name": credentials.domain } }
        });
    }
    Ok(json!({ "auth": auth }))
}

fn json_request(url: &str, body: &serde_json::Value) -> Result<Request> {
    let url = Url::parse(url).map_err(|err| Error::Config(format!("invalid auth url {url}: {err}")))?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Ok(Request {
        method: Method::POST,
        url,
        headers,
        body: body.to_string().into(),
    })
}

async fn authenticate_v2(transport: &dyn Transport, credentials: &Credentials) -> Result<Session> {
    let url = format!("{}/tokens", credentials.auth_url.trim_end_matches('/'));
    let request = json_request(&url, &v2_body(credentials)?)?;
    let response = transport.send(request).await?;
    if !response.status.is_success() {
        debug!("identity exchange rejected with {}", response.status);
        return Err(invalid());
    }
    let reply: V2Reply = response.json().await.map_err(|_| invalid())?;
    let mut endpoints = HashMap::new();
    for service in reply.access.service_catalog {
        let endpoint = service.endpoints.into_iter().find(|endpoint| {
            endpoint.region.as_deref() == Some(credentials.region.as_str())
                && endpoint.public_url.is_some()
        });
        if let Some(url) = endpoint.and_then(|endpoint| endpoint.public_url) {
            endpoints.insert(service.service_type, normalize_endpoint(&url)?);
        }
    }
    let tenant_id = reply
        .access
        .token
        .tenant
        .map(|tenant| tenant.id)
        .or_else(|| credentials.tenant_id.clone());
    Ok(Session {
        token: Some(reply.access.token.id),
        endpoints,
        tenant_id,
    })
}

async fn authenticate_v3(transport: &dyn Transport, credentials: &Credentials) -> Result<Session> {
    let url = format!("{}/auth/tokens", credentials.auth_url.trim_end_matches('/'));
    let request = json_request(&url, &v3_body(credentials)?)?;
    let response = transport.send(request).await?;
    if !response.status.is_success() {
        debug!("identity exchange rejected with {}", response.status);
        return Err(invalid());
    }
    let token = response
        .header_str("x-subject-token")
        .map(str::to_string)
        .ok_or_else(invalid)?;
    let reply: V3Reply = response.json().await.map_err(|_| invalid())?;
    let mut endpoints = HashMap::new();
    for service in reply.token.catalog {
        let endpoint = service.endpoints.into_iter().find(|endpoint| {
            let region = endpoint.region_id.as_deref().or(endpoint.region.as_deref());
            region == Some(credentials.region.as_str())
                && endpoint
                    .interface
                    .as_deref()
                    .is_none_or(|interface| interface == "public")
        });
        if let Some(endpoint) = endpoint {
            endpoints.insert(service.service_type, normalize_endpoint(&endpoint.url)?);
        }
    }
    let tenant_id = reply
        .token
        .project
        .map(|project| project.id)
        .or_else(|| credentials.tenant_id.clone());
    Ok(Session {
        token: Some(token),
        endpoints,
        tenant_id,
    })
}

/// Opens a session: fixed endpoint for direct containers, token exchange otherwise.
#[instrument(skip(transport, credentials), fields(region = %credentials.region))]
pub async fn authenticate(transport: &dyn Transport, credentials: &Credentials) -> Result<Session> {
    if let Some(direct) = &credentials.direct {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            crate::OBJECT_STORE.to_string(),
            normalize_endpoint(&direct.storage_url)?,
        );
        return Ok(Session {
            token: direct.token.clone(),
            endpoints,
            tenant_id: credentials.tenant_id.clone(),
        });
    }
    match credentials.auth_version {
        AuthVersion::V2 => authenticate_v2(transport, credentials).await,
        AuthVersion::V3 => authenticate_v3(transport, credentials).await,
    }
}
