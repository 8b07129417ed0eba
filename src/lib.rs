//! Kernel CLI authentication
//!
//! OAuth 2.0 Authorization Code + PKCE login for the Kernel CLI, with
//! secure token persistence and transparent refresh.
//!
//! # Features
//!
//! - **Login**: browser redirect caught by a one-shot loopback server
//! - **Storage**: OS keychain first, owner-only credentials file as fallback
//! - **Refresh**: expired tokens are refreshed before each authenticated call
//! - **API key fallback**: `KERNEL_API_KEY` when no OAuth login exists
//!
//! Commands that call the Kernel API only need [`ClientFactory::bearer`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod oauth;
pub mod status;
pub mod storage;

pub use client::{BearerCredential, ClientFactory, CredentialSource};
pub use error::{Error, Result, StorageError};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging on stderr
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize logging: {e}")))?;
        }
    }

    Ok(())
}
