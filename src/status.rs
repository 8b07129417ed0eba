//! Authentication status reporting

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;

use crate::Error;
use crate::storage::{StorageLocation, TokenStore};

/// Below this remaining lifetime the status calls out the upcoming expiry
const EXPIRY_WARNING: Duration = Duration::from_secs(24 * 60 * 60);

/// Claims read from the access token for display only (never verified)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// User id
    #[serde(default)]
    pub sub: Option<String>,
    /// User email
    #[serde(default)]
    pub email: Option<String>,
    /// Organization id
    #[serde(default)]
    pub org_id: Option<String>,
    /// Organization name
    #[serde(default)]
    pub org_name: Option<String>,
    /// Expiry (seconds since epoch)
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Decode the payload segment of a JWT without checking its signature
#[must_use]
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Mask an API key for display
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() >= 12 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "*".repeat(chars.len())
    }
}

/// State of the stored access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Valid for a while
    Valid(Duration),
    /// Valid, but for less than a day
    ExpiringSoon(Duration),
    /// Expired; will be refreshed on next use
    ExpiredRefreshable,
    /// Expired and no refresh token; login required
    ExpiredNoRefresh,
}

/// What the CLI would authenticate with right now
#[derive(Debug)]
pub enum AuthStatus {
    /// Stored OAuth credentials
    OAuth {
        /// Backend holding them
        location: StorageLocation,
        /// Access token expiry state
        expiry: Expiry,
        /// Organization from the record
        org_id: Option<String>,
        /// Unverified access token claims
        claims: Option<TokenClaims>,
    },
    /// API key from the environment
    ApiKey {
        /// Masked key
        masked: String,
    },
    /// Nothing usable
    NotAuthenticated {
        /// Storage failure other than "not found", if any
        storage_error: Option<Error>,
    },
}

/// Inspect stored credentials and the API key without touching the network
#[must_use]
pub fn current_status(store: &TokenStore, api_key: Option<&str>) -> AuthStatus {
    match store.load_with_location() {
        Ok((credentials, location)) => {
            let expiry = if credentials.is_expired() {
                if credentials.has_refresh_token() {
                    Expiry::ExpiredRefreshable
                } else {
                    Expiry::ExpiredNoRefresh
                }
            } else {
                let remaining = credentials.time_until_expiry().unwrap_or_default();
                if remaining < EXPIRY_WARNING {
                    Expiry::ExpiringSoon(remaining)
                } else {
                    Expiry::Valid(remaining)
                }
            };

            AuthStatus::OAuth {
                location,
                expiry,
                claims: decode_claims(&credentials.access_token),
                org_id: credentials.org_id,
            }
        }
        Err(e) => match api_key.filter(|k| !k.is_empty()) {
            Some(key) => AuthStatus::ApiKey {
                masked: mask_api_key(key),
            },
            None => AuthStatus::NotAuthenticated {
                storage_error: (!e.is_not_found()).then_some(e),
            },
        },
    }
}
