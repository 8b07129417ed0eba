//! Authenticated client factory
//!
//! The one contract the rest of the CLI consumes: produce a bearer
//! credential for API requests, or fail with a message telling the user
//! how to authenticate.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{ClientBuilder, RequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::oauth::TokenEndpoint;
use crate::storage::TokenStore;
use crate::{Error, Result};

/// Where a bearer credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Stored OAuth access token
    OAuth,
    /// Static API key from the environment
    ApiKey,
}

/// A bearer token ready to attach to API requests
#[derive(Clone)]
pub struct BearerCredential {
    source: CredentialSource,
    token: String,
}

impl fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerCredential")
            .field("source", &self.source)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl BearerCredential {
    /// Source of the token
    #[must_use]
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Raw token value
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value, marked sensitive
    pub fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| Error::Protocol(format!("Token is not a valid header value: {e}")))?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Attach the credential to a single request
    #[must_use]
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    /// Install the credential as a default header on a client builder
    pub fn apply(&self, builder: ClientBuilder) -> Result<ClientBuilder> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.header_value()?);
        Ok(builder.default_headers(headers))
    }
}

/// Chooses stored OAuth tokens (refreshing them when due) or the API key
pub struct ClientFactory {
    store: Arc<TokenStore>,
    tokens: TokenEndpoint,
    api_key: Option<String>,
    api_key_env: String,
    api_key_hint_shown: AtomicBool,
}

impl ClientFactory {
    /// Create a factory over explicit collaborators, with no API key fallback
    #[must_use]
    pub fn new(store: Arc<TokenStore>, tokens: TokenEndpoint) -> Self {
        Self {
            store,
            tokens,
            api_key: None,
            api_key_env: AuthConfig::default().api_key_env,
            api_key_hint_shown: AtomicBool::new(false),
        }
    }

    /// Create a factory from configuration and the process environment
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let store = Arc::new(TokenStore::from_config(config)?);
        let tokens = TokenEndpoint::new(config)?;
        let mut factory = Self::new(store, tokens).with_api_key(config.api_key_from_env());
        factory.api_key_env.clone_from(&config.api_key_env);
        Ok(factory)
    }

    /// Set the API key used when no OAuth credential is stored
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    /// Token store backing this factory
    #[must_use]
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Produce a valid bearer credential
    ///
    /// Stored OAuth credentials take precedence. An expired record is
    /// refreshed once; if that fails the call fails rather than using the
    /// expired token or silently switching to the API key.
    pub async fn bearer(&self, cancel: &CancellationToken) -> Result<BearerCredential> {
        match self.store.run_blocking(TokenStore::load).await {
            Ok(credentials) => {
                if !credentials.is_expired() {
                    debug!("Using stored OAuth access token");
                    return Ok(BearerCredential {
                        source: CredentialSource::OAuth,
                        token: credentials.access_token,
                    });
                }

                debug!("Access token expired, attempting refresh");
                let refreshed = self
                    .tokens
                    .refresh(&credentials, cancel)
                    .await
                    .map_err(|e| match e {
                        Error::Cancelled => Error::Cancelled,
                        other => Error::NotAuthenticated(format!(
                            "Stored credentials have expired and could not be refreshed: {other}. \
                             Run 'kernel login' to re-authenticate."
                        )),
                    })?;

                let rotated = refreshed.clone();
                if let Err(e) = self.store.run_blocking(move |s| s.save(&rotated)).await {
                    warn!(error = %e, "Failed to save refreshed credentials");
                }
                info!("Using refreshed OAuth access token");

                Ok(BearerCredential {
                    source: CredentialSource::OAuth,
                    token: refreshed.access_token,
                })
            }
            Err(load_error) => {
                if !load_error.is_not_found() {
                    warn!(error = %load_error, "Stored credentials unavailable");
                }

                let Some(api_key) = &self.api_key else {
                    let mut message = format!(
                        "No authentication available. Run 'kernel login' or set the {} environment variable.",
                        self.api_key_env
                    );
                    if !load_error.is_not_found() {
                        message.push_str(&format!(" (credential storage: {load_error})"));
                    }
                    return Err(Error::NotAuthenticated(message));
                };

                if !self.api_key_hint_shown.swap(true, Ordering::Relaxed) {
                    info!(env = %self.api_key_env, "Using API key authentication; run 'kernel login' to use OAuth");
                }
                Ok(BearerCredential {
                    source: CredentialSource::ApiKey,
                    token: api_key.clone(),
                })
            }
        }
    }

    /// Build a `reqwest` client that signs every request
    pub async fn client(&self, builder: ClientBuilder, cancel: &CancellationToken) -> Result<reqwest::Client> {
        let bearer = self.bearer(cancel).await?;
        bearer
            .apply(builder)?
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
    }
}
