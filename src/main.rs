//! Kernel CLI - authentication commands

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use kernel_cli::{
    ClientFactory, Error,
    cli::{Cli, Command},
    config::AuthConfig,
    oauth::{LoginFlow, TokenEndpoint, login},
    setup_tracing,
    status::{AuthStatus, Expiry, current_status},
    storage::TokenStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match AuthConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Login { force } => run_login(&config, force).await,
        Command::Logout => run_off_runtime(config, run_logout).await,
        Command::Status => run_off_runtime(config, run_status).await,
        Command::Token => run_token(&config).await,
    }
}

/// Run a command that only touches credential storage on the blocking pool
async fn run_off_runtime(config: AuthConfig, command: fn(&AuthConfig) -> ExitCode) -> ExitCode {
    tokio::task::spawn_blocking(move || command(&config))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Command task failed");
            ExitCode::FAILURE
        })
}

fn fail(context: &str, e: &Error) -> ExitCode {
    eprintln!("❌ {context}: {e}");
    ExitCode::FAILURE
}

/// Run the interactive login
async fn run_login(config: &AuthConfig, force: bool) -> ExitCode {
    let store = match TokenStore::from_config(config) {
        Ok(store) => store,
        Err(e) => return fail("Failed to open credential storage", &e),
    };

    if !force
        && let Ok(credentials) = store.run_blocking(TokenStore::load).await
        && !credentials.is_expired()
    {
        println!("Already authenticated with Kernel");
        println!("Use --force to re-authenticate");
        return ExitCode::SUCCESS;
    }

    let mut flow = match TokenEndpoint::new(config).and_then(|tokens| LoginFlow::new(config, tokens)) {
        Ok(flow) => flow,
        Err(e) => return fail("Failed to create OAuth configuration", &e),
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    println!("Starting Kernel authentication...");
    println!("This will open your browser to complete the OAuth flow\n");

    let result = login(&mut flow, &store, &cancel).await;
    signal_task.abort();
    debug!(phase = ?flow.phase(), "Login flow finished");

    match result {
        Ok(outcome) => {
            match outcome.saved {
                Ok(location) => {
                    info!(%location, "Stored credentials");
                    println!("✅ Successfully authenticated with Kernel!");
                    println!("You can now use other Kernel CLI commands without setting {}", config.api_key_env);
                }
                Err(e) => {
                    eprintln!("⚠️  Authentication succeeded but failed to save credentials: {e}");
                    eprintln!("You may need to re-authenticate on your next CLI usage");
                }
            }
            ExitCode::SUCCESS
        }
        Err(Error::Cancelled) => {
            println!("Authentication cancelled by user");
            ExitCode::SUCCESS
        }
        Err(e) => fail("Authentication failed", &e),
    }
}

/// Remove stored credentials
fn run_logout(config: &AuthConfig) -> ExitCode {
    let store = match TokenStore::from_config(config) {
        Ok(store) => store,
        Err(e) => return fail("Failed to open credential storage", &e),
    };

    match store.load() {
        Err(e) if e.is_not_found() => {
            println!("No active session found - already logged out");
            return ExitCode::SUCCESS;
        }
        Err(e) => debug!(error = %e, "Stored credentials unreadable, clearing anyway"),
        Ok(_) => {}
    }

    match store.delete() {
        Ok(()) => {
            println!("✅ Successfully logged out");
            println!("Run 'kernel login' to authenticate again");
            ExitCode::SUCCESS
        }
        Err(e) => fail("Failed to clear stored credentials", &e),
    }
}

/// Show which credential the CLI would use
fn run_status(config: &AuthConfig) -> ExitCode {
    let store = match TokenStore::from_config(config) {
        Ok(store) => store,
        Err(e) => return fail("Failed to open credential storage", &e),
    };
    let api_key = config.api_key_from_env();

    match current_status(&store, api_key.as_deref()) {
        AuthStatus::OAuth {
            location,
            expiry,
            org_id,
            claims,
        } => {
            println!("✅ Authenticated with OAuth");
            if let Some(claims) = claims {
                debug!(
                    email = ?claims.email,
                    user_id = ?claims.sub,
                    org_name = ?claims.org_name,
                    "User details"
                );
            }
            debug!(?org_id, storage = %location, "Credential details");

            match expiry {
                Expiry::Valid(remaining) => {
                    println!("✅ Access token valid for {}", format_duration(remaining));
                }
                Expiry::ExpiringSoon(remaining) => {
                    println!("⚠️  Access token expires in {}", format_duration(remaining));
                }
                Expiry::ExpiredRefreshable => {
                    println!("⚠️  Access token expired (will be refreshed automatically)");
                }
                Expiry::ExpiredNoRefresh => {
                    println!("❌ Access token expired and no refresh token available");
                    println!("Run 'kernel login --force' to re-authenticate");
                }
            }
        }
        AuthStatus::ApiKey { masked } => {
            println!("Authentication method: API Key");
            println!("API Key: {masked}");
            println!("💡 Consider running 'kernel login' to use OAuth authentication");
        }
        AuthStatus::NotAuthenticated { storage_error } => {
            if let Some(e) = storage_error {
                eprintln!("⚠️  Credential storage problem: {e}");
            }
            println!("No active session found - not authenticated");
            println!("Run 'kernel login' to authenticate with OAuth");
            println!("Or set the {} environment variable", config.api_key_env);
        }
    }

    ExitCode::SUCCESS
}

/// Print a valid bearer token
async fn run_token(config: &AuthConfig) -> ExitCode {
    let factory = match ClientFactory::from_config(config) {
        Ok(factory) => factory,
        Err(e) => return fail("Failed to initialize authentication", &e),
    };

    match factory.bearer(&CancellationToken::new()).await {
        Ok(bearer) => {
            println!("{}", bearer.token());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours) {
        (0, 0) => format!("{minutes}m"),
        (0, _) => format!("{hours}h{minutes}m"),
        _ => format!("{days}d{hours}h"),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
