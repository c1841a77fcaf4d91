//! Named remotes read from a local TOML file
//!
//! ```toml
//! [backup]
//! type = "swift"
//! user = "alice"
//! key = "secret"
//! tenant_id = "0123456789abcdef"
//! auth = "https://auth.cloud.ovh.net/v3"
//! region = "GRA3"
//! ```
//!
//! Only `type = "swift"` tables are kept. The reserved name [`ENV_REMOTE`] resolves to
//! [`Credentials::from_env`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::credentials::{AuthVersion, Credentials, DirectContainer};
use crate::error::{Error, Result};

pub const ENV_REMOTE: &str = "@env";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VersionField {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Remote {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    auth_version: Option<VersionField>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    storage_url: Option<String>,
    #[serde(default)]
    temp_url_key: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

impl Remote {
    fn credentials(&self) -> Result<Credentials> {
        let mut credentials = Credentials {
            username: self.user.clone(),
            password: self.key.clone(),
            token: self.auth_token.clone(),
            tenant_id: self.tenant_id.clone(),
            tenant_name: self.tenant.clone(),
            ..Default::default()
        };
        if let Some(domain) = &self.domain {
            credentials.domain = domain.clone();
        }
        if let Some(auth) = &self.auth {
            credentials = credentials.with_auth_url(auth.clone());
        }
        if let Some(region) = &self.region {
            credentials.region = region.clone();
        }
        match &self.auth_version {
            Some(VersionField::Number(version)) => {
                credentials.auth_version = version.to_string().parse()?;
            }
            Some(VersionField::Text(version)) => {
                credentials.auth_version = version.parse::<AuthVersion>()?;
            }
            None => {}
        }
        match (&self.storage_url, &self.temp_url_key) {
            (Some(storage_url), Some(temp_url_key)) => {
                credentials.direct = Some(DirectContainer {
                    storage_url: storage_url.clone(),
                    temp_url_key: temp_url_key.clone(),
                    token: self.auth_token.clone(),
                });
            }
            (Some(_), None) => {
                return Err(Error::Config(
                    "storage_url requires temp_url_key".to_string(),
                ));
            }
            _ => {}
        }
        Ok(credentials)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Remotes {
    remotes: BTreeMap<String, Remote>,
}

/// `$XDG_CONFIG_HOME/swiftcas/remotes.toml` or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("swiftcas").join("remotes.toml"))
}

impl Remotes {
    pub fn parse(text: &str) -> Result<Self> {
        let all: BTreeMap<String, Remote> = toml::from_str(text)
            .map_err(|err| Error::Config(format!("invalid remotes file: {err}")))?;
        let remotes = all
            .into_iter()
            .filter(|(_, remote)| remote.kind == "swift")
            .collect();
        Ok(Self { remotes })
    }

    /// Reads `path`; a missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|err| {
                Error::Config(format!("{}: {}", path.display(), err))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no remotes file at {}", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn load_default() -> Result<Self> {
        match default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.remotes.keys().map(String::as_str)
    }

    pub fn credentials(&self, name: &str) -> Result<Credentials> {
        if name == ENV_REMOTE {
            return Credentials::from_env();
        }
        self.remotes
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown remote '{name}'")))?
            .credentials()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[backup]
type = "swift"
user = "alice"
key = "secret"
tenant_id = "t-1"
auth = "https://keystone.example/v3"
region = "BHS"

[legacy]
type = "swift"
user = "bob"
key = "hunter2"
tenant = "project"
auth_version = 2

[public]
type = "swift"
storage_url = "https://swift.example/v1/AUTH_abc"
temp_url_key = "k3y"

[photos]
type = "s3"
provider = "AWS"
"#;

    #[test]
    fn parses_only_swift_remotes() -> anyhow::Result<()> {
        let remotes = Remotes::parse(SAMPLE)?;
        assert_eq!(
            remotes.names().collect::<Vec<_>>(),
            vec!["backup", "legacy", "public"]
        );
        let backup = remotes.credentials("backup")?;
        assert_eq!(backup.username.as_deref(), Some("alice"));
        assert_eq!(backup.auth_version, AuthVersion::V3);
        assert_eq!(backup.region, "BHS");
        let legacy = remotes.credentials("legacy")?;
        assert_eq!(legacy.auth_version, AuthVersion::V2);
        assert_eq!(legacy.tenant_name.as_deref(), Some("project"));
        assert_eq!(legacy.region, crate::credentials::DEFAULT_REGION);
        let public = remotes.credentials("public")?;
        assert_eq!(
            public.direct.map(|direct| direct.temp_url_key),
            Some("k3y".to_string())
        );
        assert!(remotes.credentials("photos").is_err());
        Ok(())
    }

    #[test]
    fn missing_file_is_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let remotes = Remotes::load(&dir.path().join("remotes.toml"))?;
        assert_eq!(remotes.names().count(), 0);
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[backup\n")?;
        assert!(Remotes::load(&path).is_err());
        Ok(())
    }
}
