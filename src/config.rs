//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Production authorization endpoint
pub const DEFAULT_AUTHORIZE_URL: &str = "https://auth.onkernel.com/authorize";

/// Production token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://auth.onkernel.com/token";

/// Kernel CLI OAuth client id
pub const DEFAULT_CLIENT_ID: &str = "hmFrJn9hKDV2N02M";

/// Uncommon loopback ports registered as redirect URIs with the authorization server
pub const DEFAULT_CALLBACK_PORTS: [u16; 8] = [58432, 58433, 58434, 58435, 58436, 58437, 58438, 58439];

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Authorization endpoint the browser is sent to
    pub authorize_url: String,
    /// Token endpoint for code exchange and refresh
    pub token_url: String,
    /// Public OAuth client id
    pub client_id: String,
    /// Space separated scopes
    pub scope: String,
    /// Loopback ports tried in order before falling back to an ephemeral port
    pub preferred_ports: Vec<u16>,
    /// Path of the redirect route on the loopback server
    pub callback_path: String,
    /// How long to wait for the browser redirect
    #[serde(with = "humantime_serde")]
    pub login_timeout: Duration,
    /// Upper bound on each token endpoint request
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Directory holding the fallback `credentials` file (default `~/.config/kernel`)
    pub credentials_dir: Option<PathBuf>,
    /// Service name of the keychain entry
    pub keychain_service: String,
    /// Account name of the keychain entry
    pub keychain_account: String,
    /// Environment variable consulted for a static API key
    pub api_key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scope: "openid email".to_string(),
            preferred_ports: DEFAULT_CALLBACK_PORTS.to_vec(),
            callback_path: "/callback".to_string(),
            login_timeout: Duration::from_secs(5 * 60),
            http_timeout: Duration::from_secs(30),
            credentials_dir: None,
            keychain_service: "kernel-cli".to_string(),
            keychain_account: "oauth-tokens".to_string(),
            api_key_env: "KERNEL_API_KEY".to_string(),
        }
    }
}

impl AuthConfig {
    /// Load configuration from an optional YAML file and `KERNEL_` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("KERNEL_"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the login flow cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("OAuth client id is not configured".to_string()));
        }

        for (name, value) in [
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
        ] {
            Url::parse(value).map_err(|e| Error::Config(format!("Invalid {name} '{value}': {e}")))?;
        }

        if !self.callback_path.starts_with('/') {
            return Err(Error::Config(format!(
                "callback_path must start with '/', got '{}'",
                self.callback_path
            )));
        }

        if self.login_timeout.is_zero() {
            return Err(Error::Config("login_timeout must be greater than zero".to_string()));
        }

        Ok(())
    }

    /// Resolve the directory for the fallback credentials file
    pub fn credentials_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.credentials_dir {
            return Ok(dir.clone());
        }

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".config").join("kernel"))
    }

    /// Read the static API key from the configured environment variable
    #[must_use]
    pub fn api_key_from_env(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}
