//! Credential record and its layered secure storage
//!
//! The record is kept in the OS keychain when one is available. Only when
//! the keychain write fails does it land in an owner-only `credentials`
//! file. Concurrent CLI invocations are not coordinated: the last writer
//! wins.

mod backend;
mod file;
mod keychain;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

pub use backend::{BackendError, MemoryBackend, SecretBackend};
pub use file::{CREDENTIALS_FILE, FileBackend};
pub use keychain::KeychainBackend;

use crate::config::AuthConfig;
use crate::error::StorageError;
use crate::{Error, Result};

/// Tokens are refreshed this long before they actually expire
pub const REFRESH_BUFFER: TimeDelta = TimeDelta::minutes(5);

/// The persisted unit of authentication material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer access token
    pub access_token: String,

    /// Refresh token, absent when the server did not issue one
    #[serde(default, deserialize_with = "empty_as_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry of `access_token`
    pub expires_at: DateTime<Utc>,

    /// Organization the tokens are scoped to
    #[serde(default, deserialize_with = "empty_as_none")]
    pub org_id: Option<String>,
}

/// Older records store absent values as empty strings.
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("org_id", &self.org_id)
            .finish()
    }
}

impl Credentials {
    /// Check if the token should be refreshed (5 minute buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// `is_expired` against an explicit clock reading
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + REFRESH_BUFFER >= self.expires_at
    }

    /// Time until the access token expires, `None` once it has
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<std::time::Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }

    /// Whether a non-empty refresh token is present
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Which backend served or received a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    /// OS keychain / Secret Service
    Native,
    /// Owner-only credentials file
    File,
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "OS keychain"),
            Self::File => write!(f, "credentials file"),
        }
    }
}

/// Layered credential store: native backend first, file fallback second
///
/// Clones share backends and the one-time fallback warning.
#[derive(Clone)]
pub struct TokenStore {
    native: Option<Arc<dyn SecretBackend>>,
    file: Arc<dyn SecretBackend>,
    fallback_warned: Arc<AtomicBool>,
}

impl TokenStore {
    /// Assemble a store from explicit backends
    #[must_use]
    pub fn new(native: Option<Box<dyn SecretBackend>>, file: Box<dyn SecretBackend>) -> Self {
        Self {
            native: native.map(Arc::from),
            file: Arc::from(file),
            fallback_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Look for an OS keychain and place the fallback file per configuration
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let native = KeychainBackend::detect(&config.keychain_service, &config.keychain_account)
            .map(|k| Box::new(k) as Box<dyn SecretBackend>);
        let file = FileBackend::in_dir(&config.credentials_dir()?);
        Ok(Self::new(native, Box::new(file)))
    }

    /// Persist a record, replacing any previous one
    pub fn save(&self, credentials: &Credentials) -> Result<StorageLocation> {
        let data = serde_json::to_string(credentials)?;

        if let Some(native) = &self.native {
            match native.write(&data) {
                Ok(()) => {
                    // Drop a stale copy from an earlier fallback so it cannot resurface.
                    if let Err(e) = self.file.remove() {
                        if e != BackendError::NotFound {
                            debug!(error = %e, "Could not remove stale credentials file");
                        }
                    }
                    info!(backend = native.name(), "Saved credentials");
                    return Ok(StorageLocation::Native);
                }
                Err(e) => self.warn_fallback(native.name(), &e),
            }
        }

        self.file.write(&data).map_err(|e| StorageError::Write {
            backend: self.file.name(),
            reason: e.to_string(),
        })?;
        info!(backend = self.file.name(), "Saved credentials");
        Ok(StorageLocation::File)
    }

    /// Load the stored record
    pub fn load(&self) -> Result<Credentials> {
        self.load_with_location().map(|(credentials, _)| credentials)
    }

    /// Load the stored record and report which backend served it
    ///
    /// A missing record yields [`StorageError::NotFound`] unless the native
    /// backend failed for a reason other than absence, in which case that
    /// failure is reported instead of "never logged in".
    pub fn load_with_location(&self) -> Result<(Credentials, StorageLocation)> {
        let mut native_failure = None;

        if let Some(native) = &self.native {
            match native.read() {
                Ok(data) => match serde_json::from_str::<Credentials>(&data) {
                    Ok(credentials) => {
                        debug!(backend = native.name(), "Loaded credentials");
                        return Ok((credentials, StorageLocation::Native));
                    }
                    Err(e) => {
                        warn!(backend = native.name(), error = %e, "Stored credentials are corrupt");
                        native_failure = Some(StorageError::Corrupt {
                            backend: native.name(),
                            reason: e.to_string(),
                        });
                    }
                },
                Err(BackendError::NotFound) => {
                    debug!(backend = native.name(), "No credentials in native store");
                }
                Err(BackendError::Unavailable(reason)) => {
                    debug!(backend = native.name(), %reason, "Native store unavailable");
                }
                Err(BackendError::Failed(reason)) => {
                    warn!(backend = native.name(), %reason, "Native store read failed");
                    native_failure = Some(StorageError::Unreadable {
                        backend: native.name(),
                        reason,
                    });
                }
            }
        }

        match self.file.read() {
            Ok(data) => serde_json::from_str::<Credentials>(&data)
                .map(|credentials| (credentials, StorageLocation::File))
                .map_err(|e| {
                    StorageError::Corrupt {
                        backend: self.file.name(),
                        reason: e.to_string(),
                    }
                    .into()
                }),
            Err(BackendError::NotFound) => Err(native_failure.unwrap_or(StorageError::NotFound).into()),
            Err(e) => Err(StorageError::Unreadable {
                backend: self.file.name(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Remove the record from every backend
    ///
    /// Absence is not an error. Only a native failure other than
    /// "not found" or "unavailable" is surfaced; file removal problems are
    /// logged.
    pub fn delete(&self) -> Result<()> {
        let native_result = self.native.as_ref().map(|n| (n.name(), n.remove()));

        match self.file.remove() {
            Ok(()) | Err(BackendError::NotFound) => {}
            Err(e) => warn!(backend = self.file.name(), error = %e, "Failed to remove credentials file"),
        }

        match native_result {
            Some((backend, Err(BackendError::Failed(reason)))) => {
                Err(StorageError::Delete { backend, reason }.into())
            }
            _ => {
                info!("Deleted stored credentials");
                Ok(())
            }
        }
    }

    /// Run store operations on the blocking pool
    ///
    /// Keychain backends spawn and wait on subprocesses; async callers go
    /// through here instead of calling [`load`](Self::load) or
    /// [`save`](Self::save) on a runtime worker.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&TokenStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("credential store task failed: {e}"))))?
    }

    fn warn_fallback(&self, backend: &str, error: &BackendError) {
        if self.fallback_warned.swap(true, Ordering::SeqCst) {
            debug!(backend, %error, "Native store write failed again");
            return;
        }
        warn!(
            backend,
            %error,
            "Secure credential store unavailable, falling back to owner-only credentials file"
        );
    }
}
