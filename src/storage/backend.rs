//! Secret backend abstraction
//!
//! A backend holds exactly one secret string: the serialized credential
//! record. The token store layers a native backend over a file backend.

use parking_lot::Mutex;
use thiserror::Error;

/// Failure reported by a single backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend works but holds no entry
    #[error("no entry")]
    NotFound,

    /// The backend cannot be used on this host right now
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The backend is present but the operation failed
    #[error("{0}")]
    Failed(String),
}

/// Storage for one named secret
pub trait SecretBackend: Send + Sync {
    /// Short human readable name used in logs and errors
    fn name(&self) -> &'static str;

    /// Read the secret
    fn read(&self) -> Result<String, BackendError>;

    /// Create or replace the secret
    fn write(&self, secret: &str) -> Result<(), BackendError>;

    /// Remove the secret
    fn remove(&self) -> Result<(), BackendError>;
}

/// In-process backend, used by tests and for ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryBackend {
    secret: Mutex<Option<String>>,
    unavailable: bool,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects every operation as unavailable
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            secret: Mutex::new(None),
            unavailable: true,
        }
    }

    /// Current raw contents
    #[must_use]
    pub fn contents(&self) -> Option<String> {
        self.secret.lock().clone()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.unavailable {
            Err(BackendError::Unavailable("memory backend disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SecretBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self) -> Result<String, BackendError> {
        self.check()?;
        self.secret.lock().clone().ok_or(BackendError::NotFound)
    }

    fn write(&self, secret: &str) -> Result<(), BackendError> {
        self.check()?;
        *self.secret.lock() = Some(secret.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<(), BackendError> {
        self.check()?;
        self.secret.lock().take().map(|_| ()).ok_or(BackendError::NotFound)
    }
}
