//! OAuth Callback Server
//!
//! A minimal loopback HTTP server that receives exactly one authorization
//! redirect. The listener is bound before the redirect URI is built and is
//! handed straight to the server, so the port is never released and
//! re-bound in between.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::pkce::verify_state;
use crate::{Error, Result};

/// How long in-flight responses get to finish after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// What a successful redirect carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResult {
    /// Authorization code
    pub code: String,

    /// Organization chosen during authorization, from the returned state
    pub org_id: Option<String>,
}

/// Why a redirect was refused
#[derive(Debug, PartialEq, Eq)]
struct Rejection {
    error: String,
    description: String,
}

impl Rejection {
    fn new(error: &str, description: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            description: description.into(),
        }
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        Error::Protocol(format!("{} ({})", r.description, r.error))
    }
}

/// Validate one redirect against the state this flow sent
fn evaluate(expected_state: &str, params: CallbackParams) -> std::result::Result<AuthorizationResult, Rejection> {
    let received = params
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Rejection::new("missing_state", "State parameter not provided"))?;

    let decoded = verify_state(&received, expected_state)
        .map_err(|e| Rejection::new("invalid_state", e.to_string()))?;

    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "Authorization was not granted".to_string());
        return Err(Rejection::new(&error, description));
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Rejection::new("missing_code", "Authorization code not provided"))?;

    Ok(AuthorizationResult {
        code,
        org_id: decoded.org_id,
    })
}

/// State shared with the callback handler
struct CallbackState {
    expected_state: String,
    tx: Mutex<Option<oneshot::Sender<Result<AuthorizationResult>>>>,
    shutdown: CancellationToken,
}

/// A bound but not yet serving callback listener
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
    path: String,
}

impl CallbackServer {
    /// Bind the first free preferred port, or an ephemeral one if all are taken
    pub async fn bind(preferred_ports: &[u16], path: &str) -> Result<Self> {
        for &port in preferred_ports {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Ok(Self::from_listener(listener, port, path)),
                Err(e) => debug!(port, error = %e, "Preferred callback port unavailable"),
            }
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| Error::Network(format!("Failed to bind callback server: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Network(format!("Failed to get callback server address: {e}")))?
            .port();
        Ok(Self::from_listener(listener, port, path))
    }

    fn from_listener(listener: TcpListener, port: u16, path: &str) -> Self {
        Self {
            listener,
            port,
            path: path.to_string(),
        }
    }

    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Redirect URI for the bound port
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }

    /// Start serving; the expected state is fixed from here on
    pub fn serve(self, expected_state: String) -> RunningCallback {
        let (tx, rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let state = Arc::new(CallbackState {
            expected_state,
            tx: Mutex::new(Some(tx)),
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route(&self.path, get(handle_callback))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        info!(url = %self.redirect_uri(), "OAuth callback server listening");

        let signal = shutdown.clone();
        let listener = self.listener;
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
                .map_err(|e| Error::Network(format!("Callback server error: {e}")))
        });

        RunningCallback {
            port: self.port,
            result: Some(rx),
            task: Some(task),
            shutdown,
        }
    }
}

/// A serving callback server; dropping it stops the server
pub struct RunningCallback {
    port: u16,
    result: Option<oneshot::Receiver<Result<AuthorizationResult>>>,
    task: Option<JoinHandle<Result<()>>>,
    shutdown: CancellationToken,
}

impl RunningCallback {
    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the first of: a redirect, the timeout, or cancellation
    ///
    /// The server is shut down and its listener released before this returns,
    /// whichever way it returns.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<AuthorizationResult> {
        let (Some(result), Some(mut task)) = (self.result.take(), self.task.take()) else {
            return Err(Error::Protocol("Callback already consumed".to_string()));
        };

        let mut server_exited = false;
        let outcome = tokio::select! {
            biased;
            received = result => received.unwrap_or_else(|_| {
                Err(Error::Network("Callback channel closed unexpectedly".to_string()))
            }),
            joined = &mut task => {
                server_exited = true;
                match joined {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) => Err(Error::Network("Callback server stopped before a redirect arrived".to_string())),
                    Err(e) => Err(Error::Network(format!("Callback server task failed: {e}"))),
                }
            }
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
        };

        self.shutdown.cancel();
        if !server_exited {
            stop_server(task).await;
        }

        debug!(port = self.port, "OAuth callback server stopped");
        outcome
    }
}

impl Drop for RunningCallback {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Let the server drain, then force it down
async fn stop_server(mut task: JoinHandle<Result<()>>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Callback server exited with error"),
        Ok(_) => {}
        Err(_) => {
            warn!("Callback server did not drain in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

/// Handle the OAuth callback
async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    query: std::result::Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    let Some(tx) = state.tx.lock().take() else {
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("already_completed", "This login attempt has already finished")),
        )
            .into_response();
    };

    let evaluated = match query {
        Ok(Query(params)) => {
            debug!(
                has_code = params.code.is_some(),
                has_state = params.state.is_some(),
                error = ?params.error,
                "Received OAuth callback"
            );
            evaluate(&state.expected_state, params)
        }
        Err(e) => Err(Rejection::new(
            "invalid_request",
            format!("Malformed callback query: {}", e.body_text()),
        )),
    };

    let response = match evaluated {
        Ok(result) => {
            let _ = tx.send(Ok(result));
            (StatusCode::OK, Html(success_page().to_string())).into_response()
        }
        Err(rejection) => {
            warn!(error = %rejection.error, "Rejected OAuth callback");
            let page = error_page(&rejection.error, &rejection.description);
            let _ = tx.send(Err(rejection.into()));
            (StatusCode::BAD_REQUEST, Html(page)).into_response()
        }
    };

    state.shutdown.cancel();
    response
}

fn success_page() -> &'static str {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>Authentication Successful</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #0f172a;
            color: #f8fafc;
        }
        .container { text-align: center; padding: 2rem; }
        .checkmark { font-size: 3rem; margin-bottom: 1rem; color: #22c55e; }
        h1 { margin: 0 0 0.5rem 0; }
        p { margin: 0; opacity: 0.8; }
    </style>
</head>
<body>
    <div class="container">
        <div class="checkmark">✓</div>
        <h1>You're signed in to Kernel</h1>
        <p>You can close this tab and return to your terminal.</p>
    </div>
</body>
</html>"#
}

fn error_page(error: &str, description: &str) -> String {
    let error = html_escape(error);
    let description = html_escape(description);
    format!(r#"<!DOCTYPE html>
<html>
<head>
    <title>Authentication Failed</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #0f172a;
            color: #f8fafc;
        }}
        .container {{ text-align: center; padding: 2rem; max-width: 420px; }}
        .error-icon {{ font-size: 3rem; margin-bottom: 1rem; color: #ef4444; }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        p {{ margin: 0; opacity: 0.8; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.6; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="error-icon">✗</div>
        <h1>Authentication Failed</h1>
        <p>{description}</p>
        <p class="error-code">Error: {error}</p>
    </div>
</body>
</html>"#)
}

/// Query values are attacker controlled
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
