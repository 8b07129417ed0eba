//! Token endpoint: authorization-code exchange and refresh
//!
//! Neither call is retried. Authorization codes are single use, and a
//! failed refresh is surfaced once so the caller can decide to log in again.

use chrono::{TimeDelta, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::storage::Credentials;
use crate::{Error, Result};

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    /// Build a record; `org_id` is decided by the caller, never read from the response
    fn into_credentials(self, org_id: Option<String>) -> Result<Credentials> {
        if self.access_token.is_empty() {
            return Err(Error::Protocol("token response has an empty access_token".to_string()));
        }
        let expires_in = self
            .expires_in
            .ok_or_else(|| Error::Protocol("token response is missing expires_in".to_string()))?;
        let expires_at = TimeDelta::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| Error::Protocol(format!("token response has invalid expires_in {expires_in}")))?;

        Ok(Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            org_id,
        })
    }
}

/// Client for the authorization server's token endpoint
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http_client: Client,
    token_url: String,
    client_id: String,
    scope: String,
}

impl TokenEndpoint {
    /// Create an endpoint client with the configured request timeout
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("kernel-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http_client, config))
    }

    /// Create an endpoint client around an existing HTTP client
    #[must_use]
    pub fn with_client(http_client: Client, config: &AuthConfig) -> Self {
        Self {
            http_client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
        }
    }

    /// Exchange an authorization code for a credential record
    ///
    /// The record's `org_id` is the one carried back in the state, if any.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        org_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(org) = org_id {
            params.push(("org_id", org));
        }

        let response = self.request_token(&params, "Token exchange", cancel).await?;
        let credentials = response.into_credentials(org_id.map(str::to_string))?;

        info!(org_id = ?credentials.org_id, "Exchanged authorization code for tokens");
        Ok(credentials)
    }

    /// Exchange the record's refresh token for a new record
    ///
    /// The new record keeps the prior `org_id` regardless of the response.
    pub async fn refresh(&self, current: &Credentials, cancel: &CancellationToken) -> Result<Credentials> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::NotAuthenticated("No refresh token available".to_string()))?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
        ];
        if let Some(org) = current.org_id.as_deref() {
            params.push(("org_id", org));
        }

        let response = self.request_token(&params, "Token refresh", cancel).await?;
        let credentials = response.into_credentials(current.org_id.clone())?;

        info!("Access token refreshed");
        Ok(credentials)
    }

    async fn request_token(
        &self,
        params: &[(&str, &str)],
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse> {
        debug!(url = %self.token_url, what, "Calling token endpoint");

        let send = self.http_client.post(&self.token_url).form(params).send();
        let response = tokio::select! {
            response = send => response.map_err(|e| Error::Network(format!("{what} request failed: {e}")))?,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!("{what} failed: HTTP {status} - {body}")));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to parse {what} response: {e}")))
    }
}
