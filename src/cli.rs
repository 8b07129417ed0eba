//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Kernel CLI authentication
#[derive(Parser, Debug)]
#[command(name = "kernel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KERNEL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "KERNEL_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KERNEL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate with Kernel using your browser
    Login {
        /// Force re-authentication even if already logged in
        #[arg(long)]
        force: bool,
    },

    /// Log out and clear stored credentials
    Logout,

    /// Show current authentication status
    #[command(alias = "auth")]
    Status,

    /// Print a valid bearer token (refreshing if needed)
    Token,
}
