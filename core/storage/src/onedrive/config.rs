//! Persisted session configuration.
//!
//! A config file is a JSON object whose top-level keys name independent
//! sections, so one file can hold several accounts. Saving a section merges it
//! into the existing document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use graphdrive_common::{Error, Result, Secret};

use super::auth::{Credentials, DEFAULT_REDIRECT_URL};

/// Section used when no config key is given.
pub const DEFAULT_CONFIG_KEY: &str = "onedrive";
const CONFIG_FILE_NAME: &str = "config.json";

fn default_redirect_url() -> String {
    DEFAULT_REDIRECT_URL.to_string()
}

/// App registration plus the refresh token of the last session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret_value: Secret,
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret>,
}

impl SessionConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<Secret>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret_value: client_secret.into(),
            redirect_url: default_redirect_url(),
            refresh_token: None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.tenant_id.clone(),
            self.client_id.clone(),
            self.client_secret_value.clone(),
        )
        .with_redirect_url(self.redirect_url.clone())
    }

    pub fn from_credentials(credentials: &Credentials, refresh_token: Option<Secret>) -> Self {
        Self {
            tenant_id: credentials.tenant_id.clone(),
            client_id: credentials.client_id.clone(),
            client_secret_value: credentials.client_secret.clone(),
            redirect_url: credentials.redirect_url.clone(),
            refresh_token,
        }
    }
}

/// `<config dir>/graphdrive/config.json`, or `config.json` in the working
/// directory when the platform has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("graphdrive").join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// Load the section `key` from the config file at `path`.
///
/// # Errors
/// - File missing or unreadable
/// - Not a JSON object, key absent, or required fields missing
pub async fn load_session_config(path: &Path, key: &str) -> Result<SessionConfig> {
    debug!(path = %path.display(), key, "Loading session config");
    let document = read_document(path).await?.ok_or_else(|| {
        Error::Config(format!("Config file '{}' not found", path.display()))
    })?;

    let section = document.get(key).cloned().ok_or_else(|| {
        Error::Config(format!(
            "Config key '{}' not found in '{}'",
            key,
            path.display()
        ))
    })?;

    serde_json::from_value(section)
        .map_err(|e| Error::Config(format!("Invalid config section '{}': {}", key, e)))
}

/// Write `config` as section `key`, keeping every other section of the file.
pub async fn save_session_config(path: &Path, key: &str, config: &SessionConfig) -> Result<()> {
    let mut document = read_document(path).await?.unwrap_or_default();
    document.insert(key.to_string(), serde_json::to_value(config)?);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(&Value::Object(document))?;
    tokio::fs::write(path, json).await?;

    info!(path = %path.display(), key, "Saved session config");
    Ok(())
}

async fn read_document(path: &Path) -> Result<Option<Map<String, Value>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&contents) {
        Ok(Value::Object(document)) => Ok(Some(document)),
        Ok(_) => Err(Error::Config(format!(
            "'{}' does not contain a JSON object",
            path.display()
        ))),
        Err(e) => Err(Error::Config(format!(
            "Failed to parse '{}': {}",
            path.display(),
            e
        ))),
    }
}
