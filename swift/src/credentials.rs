use crate::error::{Error, Result};

pub const DEFAULT_AUTH_URL: &str = "https://auth.cloud.ovh.net/v2.0";
pub const DEFAULT_REGION: &str = "GRA3";
pub const DEFAULT_DOMAIN: &str = "Default";

/// Identity protocol spoken with the auth endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthVersion {
    /// Legacy tenant-scoped token exchange (`POST {auth}/tokens`)
    #[default]
    V2,
    /// Domain/project-scoped token exchange (`POST {auth}/auth/tokens`)
    V3,
}

impl AuthVersion {
    /// Guesses the protocol from the auth URL path, defaulting to v2.
    pub fn infer(auth_url: &str) -> Self {
        let path = auth_url.trim_end_matches('/');
        if path.ends_with("/v3") {
            AuthVersion::V3
        } else {
            AuthVersion::V2
        }
    }
}

impl std::str::FromStr for AuthVersion {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().trim_start_matches(['v', 'V']) {
            "2" | "2.0" => Ok(AuthVersion::V2),
            "3" => Ok(AuthVersion::V3),
            other => Err(Error::Config(format!(
                "unsupported auth version '{other}', expected 2 or 3"
            ))),
        }
    }
}

/// Fixed container endpoint that bypasses the identity exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectContainer {
    /// Object-store account URL, e.g. `https://storage.example/v1/AUTH_abc`
    pub storage_url: String,
    pub temp_url_key: String,
    /// Token sent with authenticated requests, if any
    pub token: Option<String>,
}

/// Everything needed to open a session; immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued token, used instead of username and password
    pub token: Option<String>,
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,
    pub domain: String,
    pub auth_url: String,
    pub region: String,
    pub auth_version: AuthVersion,
    pub direct: Option<DirectContainer>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            token: None,
            tenant_id: None,
            tenant_name: None,
            domain: DEFAULT_DOMAIN.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            region: DEFAULT_REGION.to_string(),
            auth_version: AuthVersion::V2,
            direct: None,
        }
    }
}

impl Credentials {
    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn direct(storage_url: impl Into<String>, temp_url_key: impl Into<String>) -> Self {
        Self {
            direct: Some(DirectContainer {
                storage_url: storage_url.into(),
                temp_url_key: temp_url_key.into(),
                token: None,
            }),
            ..Default::default()
        }
    }

    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.auth_version = AuthVersion::infer(&self.auth_url);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_auth_version(mut self, auth_version: AuthVersion) -> Self {
        self.auth_version = auth_version;
        self
    }

    /// Reads `OS_USERNAME`, `OS_PASSWORD`, `OS_TENANT_ID`, `OS_REGION_NAME` and `OS_AUTH_URL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let username = lookup("OS_USERNAME")
            .ok_or_else(|| Error::Config("OS_USERNAME is not set".to_string()))?;
        let password = lookup("OS_PASSWORD")
            .ok_or_else(|| Error::Config("OS_PASSWORD is not set".to_string()))?;
        let mut credentials = Self {
            username: Some(username),
            password: Some(password),
            tenant_id: lookup("OS_TENANT_ID"),
            tenant_name: lookup("OS_TENANT_NAME").or_else(|| lookup("OS_PROJECT_NAME")),
            ..Default::default()
        };
        if let Some(domain) = lookup("OS_USER_DOMAIN_NAME") {
            credentials.domain = domain;
        }
        if let Some(region) = lookup("OS_REGION_NAME") {
            credentials.region = region;
        }
        if let Some(auth_url) = lookup("OS_AUTH_URL") {
            credentials = credentials.with_auth_url(auth_url);
        }
        if let Some(version) = lookup("OS_IDENTITY_API_VERSION") {
            credentials.auth_version = version.parse()?;
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let credentials = Credentials::default();
        assert_eq!(credentials.auth_url, "https://auth.cloud.ovh.net/v2.0");
        assert_eq!(credentials.region, "GRA3");
        assert_eq!(credentials.auth_version, AuthVersion::V2);
    }

    #[test]
    fn version_inference_and_parsing() -> Result<()> {
        assert_eq!(
            AuthVersion::infer("https://keystone.example/v3/"),
            AuthVersion::V3
        );
        assert_eq!(
            AuthVersion::infer("https://keystone.example/v2.0"),
            AuthVersion::V2
        );
        assert_eq!("v3".parse::<AuthVersion>()?, AuthVersion::V3);
        assert_eq!("2".parse::<AuthVersion>()?, AuthVersion::V2);
        assert!("4".parse::<AuthVersion>().is_err());
        Ok(())
    }

    #[test]
    fn environment_lookup() -> Result<()> {
        let env: HashMap<&str, &str> = [
            ("OS_USERNAME", "alice"),
            ("OS_PASSWORD", "secret"),
            ("OS_TENANT_ID", "t-1"),
            ("OS_REGION_NAME", "BHS"),
            ("OS_AUTH_URL", "https://keystone.example/v3"),
        ]
        .into_iter()
        .collect();
        let credentials =
            Credentials::from_lookup(|name| env.get(name).map(|value| value.to_string()))?;
        assert_eq!(credentials.username.as_deref(), Some("alice"));
        assert_eq!(credentials.tenant_id.as_deref(), Some("t-1"));
        assert_eq!(credentials.region, "BHS");
        assert_eq!(credentials.auth_version, AuthVersion::V3);
        let missing = Credentials::from_lookup(|_| None);
        assert!(matches!(missing, Err(Error::Config(_))));
        Ok(())
    }
}
