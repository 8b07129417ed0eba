//! End-to-end login flow tests
//!
//! Each test drives a real loopback callback server with a scripted
//! browser and exchanges codes against a mock token endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{MockTokenServer, Redirect, ScriptedBrowser, config_for, port_accepts};
use kernel_cli::Error;
use kernel_cli::config::AuthConfig;
use kernel_cli::oauth::{FailureReason, FlowPhase, LoginFlow, TokenEndpoint, generate_challenge, login};
use kernel_cli::storage::{MemoryBackend, StorageLocation, TokenStore};
use serde_json::json;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

fn memory_store() -> TokenStore {
    TokenStore::new(None, Box::new(MemoryBackend::new()))
}

fn flow_with(config: &AuthConfig, browser: Arc<ScriptedBrowser>) -> LoginFlow {
    let tokens = TokenEndpoint::new(config).unwrap();
    LoginFlow::new(config, tokens).unwrap().with_browser(browser)
}

/// A redirect with the sent state and a code completes and persists the record
#[tokio::test]
async fn test_login_completes_and_persists_credentials() {
    let server = MockTokenServer::issuing(json!({
        "access_token": "access-1",
        "refresh_token": "refresh-1",
        "expires_in": 3600,
        "org_id": "org_from_server",
    }))
    .await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::Approve {
        code: "code-123".to_string(),
    });
    let mut flow = flow_with(&config, browser.clone());
    let challenge = flow.code_challenge().to_string();
    let store = memory_store();

    let outcome = login(&mut flow, &store, &CancellationToken::new()).await.unwrap();

    assert_eq!(flow.phase(), &FlowPhase::Complete);
    assert_eq!(outcome.saved.unwrap(), StorageLocation::File);
    assert_eq!(outcome.credentials.access_token, "access-1");

    let stored = store.load().unwrap();
    assert_eq!(stored.access_token, "access-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    // The organization only ever comes from the returned state.
    assert_eq!(stored.org_id, None);
    assert!(!stored.is_expired());

    // The token request proves possession of the verifier behind the challenge.
    let forms = server.forms();
    assert_eq!(forms.len(), 1);
    let form = &forms[0];
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "code-123");
    assert_eq!(form["redirect_uri"], browser.redirect_uri().unwrap());
    assert_eq!(generate_challenge(&form["code_verifier"]), challenge);
}

/// An organization attached to the state is sent with the exchange and stored
#[tokio::test]
async fn test_org_from_returned_state_is_stored() {
    let server = MockTokenServer::issuing(json!({
        "access_token": "access-1",
        "expires_in": 3600,
        "org_id": "org_from_server",
    }))
    .await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::ApproveForOrg {
        code: "code-123".to_string(),
        org_id: "org_selected".to_string(),
    });
    let mut flow = flow_with(&config, browser);
    let store = memory_store();

    login(&mut flow, &store, &CancellationToken::new()).await.unwrap();

    assert_eq!(store.load().unwrap().org_id.as_deref(), Some("org_selected"));
    assert_eq!(server.forms()[0]["org_id"], "org_selected");
}

/// A redirect carrying a state this flow never sent is rejected
#[tokio::test]
async fn test_forged_state_fails_without_exchange() {
    let server = MockTokenServer::issuing(json!({"access_token": "x", "expires_in": 60})).await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::ForgedState {
        code: "stolen".to_string(),
    });
    let mut flow = flow_with(&config, browser.clone());
    let store = memory_store();

    let err = login(&mut flow, &store, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(flow.phase(), &FlowPhase::Failed(FailureReason::Protocol));
    assert_eq!(server.calls(), 0);
    assert!(store.load().unwrap_err().is_not_found());
}

/// An authorization server error with a valid state fails the flow
#[tokio::test]
async fn test_denied_authorization_fails_with_protocol_error() {
    let server = MockTokenServer::issuing(json!({"access_token": "x", "expires_in": 60})).await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::Deny {
        error: "access_denied".to_string(),
    });
    let mut flow = flow_with(&config, browser);

    let err = flow.run(&CancellationToken::new()).await.unwrap_err();

    assert!(err.to_string().contains("access_denied"));
    assert_eq!(flow.phase(), &FlowPhase::Failed(FailureReason::Protocol));
    assert_eq!(server.calls(), 0);
}

/// No redirect before the deadline fails with a timeout and frees the port
#[tokio::test]
async fn test_timeout_releases_callback_port() {
    let server = MockTokenServer::issuing(json!({"access_token": "x", "expires_in": 60})).await;
    let mut config = config_for(&server.url);
    config.login_timeout = Duration::from_millis(200);
    let browser = ScriptedBrowser::new(Redirect::Abandon);
    let mut flow = flow_with(&config, browser.clone());
    let store = memory_store();

    let err = login(&mut flow, &store, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(flow.phase(), &FlowPhase::Failed(FailureReason::Timeout));
    assert!(store.load().unwrap_err().is_not_found());

    let port = browser.callback_port().unwrap();
    assert!(!port_accepts(port).await);
}

/// Cancelling while waiting for the redirect ends the flow as cancelled
#[tokio::test]
async fn test_cancel_while_awaiting_redirect() {
    let server = MockTokenServer::issuing(json!({"access_token": "x", "expires_in": 60})).await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::Abandon);
    let mut flow = flow_with(&config, browser.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = flow.run(&cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(flow.phase(), &FlowPhase::Failed(FailureReason::Cancelled));
    assert!(!port_accepts(browser.callback_port().unwrap()).await);
}

/// The token endpoint refusing the code fails the flow in the exchange phase
#[tokio::test]
async fn test_rejected_code_fails_in_exchange() {
    let server = MockTokenServer::start(
        StatusCode::BAD_REQUEST,
        json!({"error": "invalid_grant", "error_description": "code expired"}),
    )
    .await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::Approve {
        code: "expired-code".to_string(),
    });
    let mut flow = flow_with(&config, browser);
    let store = memory_store();

    let err = login(&mut flow, &store, &CancellationToken::new()).await.unwrap_err();

    assert!(err.to_string().contains("invalid_grant"));
    assert_eq!(flow.phase(), &FlowPhase::Failed(FailureReason::Exchange));
    assert_eq!(server.calls(), 1);
    assert!(store.load().unwrap_err().is_not_found());
}

/// After a completed login nothing listens on the callback port any more
#[tokio::test]
async fn test_callback_port_closed_after_completion() {
    let server = MockTokenServer::issuing(json!({"access_token": "a", "expires_in": 60})).await;
    let config = config_for(&server.url);
    let browser = ScriptedBrowser::new(Redirect::Approve {
        code: "code".to_string(),
    });
    let mut flow = flow_with(&config, browser.clone());

    flow.run(&CancellationToken::new()).await.unwrap();

    for _ in 0..50 {
        if !browser.statuses().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(browser.statuses(), vec![200]);
    assert!(!port_accepts(browser.callback_port().unwrap()).await);
}

/// Run `count` logins at once, all listening before any redirect arrives
async fn run_concurrently(config: &AuthConfig, count: usize) -> Vec<u16> {
    let gate = Arc::new(Barrier::new(count));
    let mut handles = Vec::new();
    let mut browsers = Vec::new();
    for i in 0..count {
        let browser = ScriptedBrowser::gated(
            Redirect::Approve {
                code: format!("code-{i}"),
            },
            gate.clone(),
        );
        browsers.push(browser.clone());
        let mut flow = flow_with(config, browser);
        handles.push(tokio::spawn(async move {
            let result = flow.run(&CancellationToken::new()).await;
            (result.is_ok(), flow.phase().clone())
        }));
    }

    for handle in handles {
        let (ok, phase) = handle.await.unwrap();
        assert!(ok);
        assert_eq!(phase, FlowPhase::Complete);
    }

    browsers.iter().map(|b| b.callback_port().unwrap()).collect()
}

/// Concurrent logins bind distinct ports and each completes with its own code
#[tokio::test]
async fn test_concurrent_flows_are_isolated() {
    let server = MockTokenServer::issuing(json!({"access_token": "shared", "expires_in": 60})).await;
    let config = config_for(&server.url);

    let mut ports = run_concurrently(&config, 4).await;
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4);

    let mut codes: Vec<String> = server.forms().into_iter().map(|f| f["code"].clone()).collect();
    codes.sort();
    assert_eq!(codes, vec!["code-0", "code-1", "code-2", "code-3"]);
}

/// More concurrent logins than preferred ports: the preferred ports are
/// shared out once each and the rest fall back to ephemeral ports
#[tokio::test]
async fn test_concurrent_flows_share_preferred_ports() {
    let server = MockTokenServer::issuing(json!({"access_token": "shared", "expires_in": 60})).await;
    let preferred = {
        let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        vec![a.local_addr().unwrap().port(), b.local_addr().unwrap().port()]
    };
    let config = AuthConfig {
        preferred_ports: preferred.clone(),
        ..config_for(&server.url)
    };

    let ports = run_concurrently(&config, 4).await;

    let mut distinct = ports.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 4);
    for port in &preferred {
        assert!(ports.iter().filter(|p| *p == port).count() <= 1);
    }
    assert!(ports.iter().any(|p| preferred.contains(p)));
    assert_eq!(server.calls(), 4);
}
