//! Interactive login: Authorization Code + PKCE through the browser
//!
//! ```text
//! Idle -> AwaitingRedirect -> Exchanging -> Complete
//!   \            \                 \
//!    `------------`-----------------`--> Failed(reason)
//! ```
//!
//! A flow instance runs once. Its verifier and state are generated at
//! construction, written once, and only read afterwards.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::callback::CallbackServer;
use super::pkce::{OAuthState, generate_challenge, generate_verifier};
use super::token::TokenEndpoint;
use crate::config::AuthConfig;
use crate::storage::{Credentials, StorageLocation, TokenStore};
use crate::{Error, Result};

/// Opens the authorization URL for the user
pub trait BrowserLauncher: Send + Sync {
    /// Open `url`; failure is reported but never aborts the flow
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// The desktop's default browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Why a flow ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Could not start: bad configuration or no port to listen on
    Setup,
    /// Forged, malformed or refused redirect
    Protocol,
    /// No redirect before the deadline
    Timeout,
    /// Caller cancelled
    Cancelled,
    /// Token endpoint rejected the code or was unreachable
    Exchange,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Setup => "setup",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Exchange => "exchange_error",
        };
        f.write_str(s)
    }
}

/// Login flow state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowPhase {
    /// Constructed, nothing bound yet
    Idle,
    /// Listener bound, browser sent to the authorization server
    AwaitingRedirect,
    /// Code received, talking to the token endpoint
    Exchanging,
    /// Credentials obtained
    Complete,
    /// Terminal failure
    Failed(FailureReason),
}

impl FlowPhase {
    /// `Complete` and `Failed` accept no further transitions
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }

    fn failure_for(&self, error: &Error) -> FailureReason {
        match (self, error) {
            (_, Error::Cancelled) => FailureReason::Cancelled,
            (_, Error::Timeout(_)) => FailureReason::Timeout,
            (Self::Exchanging, _) => FailureReason::Exchange,
            (Self::AwaitingRedirect, _) => FailureReason::Protocol,
            _ => FailureReason::Setup,
        }
    }
}

/// One interactive login attempt
pub struct LoginFlow {
    config: AuthConfig,
    tokens: TokenEndpoint,
    browser: Arc<dyn BrowserLauncher>,
    verifier: String,
    challenge: String,
    state: String,
    phase: FlowPhase,
}

impl LoginFlow {
    /// Prepare a flow with a fresh PKCE pair and CSRF state
    pub fn new(config: &AuthConfig, tokens: TokenEndpoint) -> Result<Self> {
        config.validate()?;

        let verifier = generate_verifier()?;
        let challenge = generate_challenge(&verifier);
        let state = OAuthState::generate(None)?.encode();

        Ok(Self {
            config: config.clone(),
            tokens,
            browser: Arc::new(SystemBrowser),
            verifier,
            challenge,
            state,
            phase: FlowPhase::Idle,
        })
    }

    /// Replace the browser launcher
    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> &FlowPhase {
        &self.phase
    }

    /// PKCE challenge sent with the authorization request
    #[must_use]
    pub fn code_challenge(&self) -> &str {
        &self.challenge
    }

    /// Build the authorization URL for a bound redirect URI
    pub fn authorization_url(&self, redirect_uri: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| Error::Config(format!("Invalid authorize_url: {e}")))?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", &self.state)
            .append_pair("code_challenge", &self.challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url)
    }

    /// Drive the flow to `Complete` or `Failed`
    ///
    /// Returns an error without side effects if this flow has already run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Credentials> {
        if self.phase != FlowPhase::Idle {
            return Err(Error::Protocol(
                "This login attempt has already run; start a new one".to_string(),
            ));
        }

        let outcome = self.drive(cancel).await;
        self.phase = match &outcome {
            Ok(_) => FlowPhase::Complete,
            Err(e) => {
                let reason = self.phase.failure_for(e);
                warn!(%reason, error = %e, "Login failed");
                FlowPhase::Failed(reason)
            }
        };
        outcome
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<Credentials> {
        let server = CallbackServer::bind(&self.config.preferred_ports, &self.config.callback_path).await?;
        let redirect_uri = server.redirect_uri();
        let auth_url = self.authorization_url(&redirect_uri)?.to_string();

        self.phase = FlowPhase::AwaitingRedirect;
        let callback = server.serve(self.state.clone());

        eprintln!("Authentication URL:\n  {auth_url}\n");
        info!(port = callback.port(), "Opening browser for authorization");
        if let Err(e) = self.browser.open(&auth_url) {
            warn!(error = %e, "Failed to open browser automatically");
            eprintln!("Could not open a browser automatically. Open the URL above to continue.");
        }

        let result = callback.wait(self.config.login_timeout, cancel).await?;
        debug!(org_id = ?result.org_id, "Received authorization code");

        self.phase = FlowPhase::Exchanging;
        self.tokens
            .exchange_code(
                &result.code,
                &redirect_uri,
                &self.verifier,
                result.org_id.as_deref(),
                cancel,
            )
            .await
    }
}

/// Result of a completed login
#[derive(Debug)]
pub struct LoginOutcome {
    /// Tokens obtained
    pub credentials: Credentials,
    /// Where they were persisted, or why persisting failed
    pub saved: Result<StorageLocation>,
}

/// Run a login flow and persist its credentials
///
/// A failure to persist does not fail the login; it is reported in
/// [`LoginOutcome::saved`] because the tokens remain usable in-process.
pub async fn login(flow: &mut LoginFlow, store: &TokenStore, cancel: &CancellationToken) -> Result<LoginOutcome> {
    let credentials = flow.run(cancel).await?;
    let record = credentials.clone();
    let saved = store.run_blocking(move |s| s.save(&record)).await;
    if let Err(e) = &saved {
        warn!(error = %e, "Login succeeded but credentials could not be saved");
    }
    Ok(LoginOutcome { credentials, saved })
}
