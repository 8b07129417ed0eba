//! Error types for the Kernel CLI authentication subsystem

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the authentication subsystem
pub type Result<T> = std::result::Result<T, Error>;

/// Authentication errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid client configuration (not fixable at runtime)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure reaching the authorization or token endpoint
    #[error("Network error: {0}")]
    Network(String),

    /// OAuth protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No redirect arrived before the login deadline
    #[error("Authentication timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// The caller cancelled the operation
    #[error("Authentication cancelled")]
    Cancelled,

    /// Credential storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No usable credential is available; the message says what to do
    #[error("{0}")]
    NotAuthenticated(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the credential store simply holds nothing yet
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound))
    }
}

/// Failures of the layered credential store
#[derive(Error, Debug)]
pub enum StorageError {
    /// Neither backend holds a credential record ("never logged in")
    #[error("no stored credentials found")]
    NotFound,

    /// A backend exists but could not be read
    #[error("failed to read credentials from {backend}: {reason}")]
    Unreadable {
        /// Backend that failed
        backend: &'static str,
        /// Underlying cause
        reason: String,
    },

    /// A backend returned data that is not a credential record
    #[error("stored credentials in {backend} are corrupt: {reason}")]
    Corrupt {
        /// Backend that served the data
        backend: &'static str,
        /// Parse failure
        reason: String,
    },

    /// Writing failed on every available backend
    #[error("failed to write credentials to {backend}: {reason}")]
    Write {
        /// Last backend attempted
        backend: &'static str,
        /// Underlying cause
        reason: String,
    },

    /// Removing the record failed
    #[error("failed to delete credentials from {backend}: {reason}")]
    Delete {
        /// Backend that failed
        backend: &'static str,
        /// Underlying cause
        reason: String,
    },
}
