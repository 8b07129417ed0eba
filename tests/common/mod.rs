//! Shared fixtures: a mock token endpoint and a scripted browser

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Form, Json, Router, extract::State, http::StatusCode, routing::post};
use kernel_cli::config::AuthConfig;
use kernel_cli::oauth::{BrowserLauncher, OAuthState};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Barrier;
use url::Url;

struct TokenServerState {
    status: StatusCode,
    body: Value,
    calls: AtomicUsize,
    forms: Mutex<Vec<HashMap<String, String>>>,
}

/// Token endpoint that answers every request with the same reply
pub struct MockTokenServer {
    pub url: String,
    state: Arc<TokenServerState>,
}

impl MockTokenServer {
    pub async fn start(status: StatusCode, body: Value) -> Self {
        let state = Arc::new(TokenServerState {
            status,
            body,
            calls: AtomicUsize::new(0),
            forms: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/token", post(token))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/token"),
            state,
        }
    }

    pub async fn issuing(body: Value) -> Self {
        Self::start(StatusCode::OK, body).await
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn forms(&self) -> Vec<HashMap<String, String>> {
        self.state.forms.lock().clone()
    }
}

async fn token(
    State(state): State<Arc<TokenServerState>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    state.calls.fetch_add(1, Ordering::SeqCst);
    state.forms.lock().push(form);
    (state.status, Json(state.body.clone()))
}

/// Config pointing at a mock token endpoint, ephemeral callback ports only
pub fn config_for(token_url: &str) -> AuthConfig {
    AuthConfig {
        authorize_url: "http://127.0.0.1:9/authorize".to_string(),
        token_url: token_url.to_string(),
        preferred_ports: vec![],
        login_timeout: Duration::from_secs(10),
        http_timeout: Duration::from_secs(5),
        ..AuthConfig::default()
    }
}

/// What the "browser" does once it is handed the authorization URL
#[derive(Debug, Clone)]
pub enum Redirect {
    /// Come back with a code and the state that was sent
    Approve { code: String },
    /// Come back with a code and the sent state with an organization added
    ApproveForOrg { code: String, org_id: String },
    /// Come back with a code and a state minted elsewhere
    ForgedState { code: String },
    /// Come back with an authorization server error
    Deny { error: String },
    /// Never come back
    Abandon,
}

/// Browser stand-in that performs the redirect itself
pub struct ScriptedBrowser {
    redirect: Redirect,
    gate: Option<Arc<Barrier>>,
    opened: Mutex<Vec<String>>,
    statuses: Arc<Mutex<Vec<u16>>>,
}

impl ScriptedBrowser {
    pub fn new(redirect: Redirect) -> Arc<Self> {
        Self::build(redirect, None)
    }

    /// Redirect only once every browser sharing `gate` has been opened,
    /// so all their callback servers are listening at the same time
    pub fn gated(redirect: Redirect, gate: Arc<Barrier>) -> Arc<Self> {
        Self::build(redirect, Some(gate))
    }

    fn build(redirect: Redirect, gate: Option<Arc<Barrier>>) -> Arc<Self> {
        Arc::new(Self {
            redirect,
            gate,
            opened: Mutex::new(Vec::new()),
            statuses: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Authorization URLs this browser was asked to open
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    /// HTTP statuses the callback server answered with
    pub fn statuses(&self) -> Vec<u16> {
        self.statuses.lock().clone()
    }

    /// `redirect_uri` of the last opened authorization URL
    pub fn redirect_uri(&self) -> Option<String> {
        self.opened().last().and_then(|url| query_param(url, "redirect_uri"))
    }

    /// Port the callback server was bound to
    pub fn callback_port(&self) -> Option<u16> {
        self.redirect_uri()
            .and_then(|uri| Url::parse(&uri).ok())
            .and_then(|uri| uri.port())
    }
}

impl BrowserLauncher for ScriptedBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.lock().push(url.to_string());

        let redirect_uri = query_param(url, "redirect_uri").ok_or_else(|| std::io::Error::other("no redirect_uri"))?;
        let sent_state = query_param(url, "state").ok_or_else(|| std::io::Error::other("no state"))?;

        let mut callback = Url::parse(&redirect_uri).map_err(std::io::Error::other)?;
        callback
            .set_host(Some("127.0.0.1"))
            .map_err(std::io::Error::other)?;

        match &self.redirect {
            Redirect::Approve { code } => {
                callback
                    .query_pairs_mut()
                    .append_pair("code", code)
                    .append_pair("state", &sent_state);
            }
            Redirect::ApproveForOrg { code, org_id } => {
                let mut state = OAuthState::decode(&sent_state).map_err(std::io::Error::other)?;
                state.org_id = Some(org_id.clone());
                callback
                    .query_pairs_mut()
                    .append_pair("code", code)
                    .append_pair("state", &state.encode());
            }
            Redirect::ForgedState { code } => {
                let forged = OAuthState::generate(None).map_err(std::io::Error::other)?.encode();
                callback
                    .query_pairs_mut()
                    .append_pair("code", code)
                    .append_pair("state", &forged);
            }
            Redirect::Deny { error } => {
                callback
                    .query_pairs_mut()
                    .append_pair("error", error)
                    .append_pair("error_description", "The user denied access")
                    .append_pair("state", &sent_state);
            }
            Redirect::Abandon => return Ok(()),
        }

        let statuses = self.statuses.clone();
        let gate = self.gate.clone();
        tokio::spawn(async move {
            if let Some(gate) = gate {
                gate.wait().await;
            }
            if let Ok(response) = reqwest::get(callback).await {
                statuses.lock().push(response.status().as_u16());
            }
        });
        Ok(())
    }
}

fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Whether anything still accepts connections on a loopback port
pub async fn port_accepts(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}
