//! OAuth 2.0 client for the Kernel CLI
//!
//! Implements the Authorization Code flow with PKCE (RFC 7636).
//!
//! Features:
//! - PKCE verifier/challenge and CSRF state generation
//! - Loopback callback server on a preferred or ephemeral port
//! - Browser-based authorization with timeout and cancellation
//! - Code exchange and token refresh

mod callback;
mod flow;
mod pkce;
mod token;

pub use callback::{AuthorizationResult, CallbackServer, RunningCallback};
pub use flow::{
    BrowserLauncher, FailureReason, FlowPhase, LoginFlow, LoginOutcome, SystemBrowser, login,
};
pub use pkce::{OAuthState, generate_challenge, generate_verifier, verify_state};
pub use token::TokenEndpoint;
