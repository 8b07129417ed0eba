//! PKCE (RFC 7636) and CSRF state helpers
//!
//! All functions here are pure apart from drawing entropy from the OS.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rand::{TryRngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Random bytes behind a code verifier (256 bits, 43 base64url chars)
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind a CSRF token (192 bits, 32 base64url chars)
const CSRF_BYTES: usize = 24;

/// Fill `len` bytes from the OS entropy source and encode them base64url without padding
fn random_token(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "secure random source unavailable: {e}"
        )))
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a fresh PKCE code verifier
pub fn generate_verifier() -> Result<String> {
    random_token(VERIFIER_BYTES)
}

/// Compute `code_challenge = base64url_nopad(sha256(verifier))`
#[must_use]
pub fn generate_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Decoded contents of the `state` parameter
///
/// The authorization server may add an `org_id` before redirecting back,
/// so the decoded value from a callback can carry more than was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    /// CSRF token compared on return
    pub csrf: String,

    /// Organization selected during authorization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl OAuthState {
    /// Generate a state with a fresh CSRF token
    pub fn generate(org_id: Option<String>) -> Result<Self> {
        Ok(Self {
            csrf: random_token(CSRF_BYTES)?,
            org_id,
        })
    }

    /// Encode as the opaque base64 string sent to the authorization server
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode a `state` value; anything but a well-formed payload is a protocol error
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Protocol(format!("state parameter is not valid base64: {e}")))?;
        let state: Self = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Protocol(format!("state parameter is malformed: {e}")))?;
        if state.csrf.is_empty() {
            return Err(Error::Protocol("state parameter carries no CSRF token".to_string()));
        }
        Ok(state)
    }
}

/// Verify a received `state` against the one this flow sent
///
/// Returns the decoded received state so the caller can pick up the
/// `org_id` the authorization server attached.
pub fn verify_state(received: &str, expected: &str) -> Result<OAuthState> {
    let received = OAuthState::decode(received)?;
    let expected = OAuthState::decode(expected)?;

    if bool::from(received.csrf.as_bytes().ct_eq(expected.csrf.as_bytes())) {
        Ok(received)
    } else {
        Err(Error::Protocol(
            "state mismatch - possible CSRF attack".to_string(),
        ))
    }
}
