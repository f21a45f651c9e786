//! Command-line interface definition for oidc-session
//!
//! This module defines the CLI structure using clap's derive API. The CLI
//! drives one session manager per invocation; the session and any pending
//! login persist in the configured Token Store between invocations.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::StoreBackend;

/// oidc-session - OpenID Connect session manager
///
/// Signs in against an OpenID Provider, keeps the session renewed, and calls
/// protected APIs with the current access token.
#[derive(Parser, Debug, Clone)]
#[command(name = "oidc-session")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Token Store backend override
    #[arg(long, value_enum)]
    pub store: Option<StoreBackend>,

    /// Directory for the file Token Store
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start an interactive login at the identity provider
    Login {
        /// Application path to resume after login
        #[arg(long)]
        return_to: Option<String>,

        /// Print the authorization URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Complete a login from the URL the provider redirected to
    Callback {
        /// Full callback URL, or just its `#fragment` / `?query`
        url: String,
    },

    /// Show the current session
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Renew the tokens now
    Renew,

    /// Sign out locally and at the identity provider
    Logout,

    /// Evaluate the route guard for an application path
    Guard {
        /// Route path, e.g. `/protected/orders`
        path: String,
    },

    /// GET a URL, attaching the access token for protected APIs
    Fetch {
        /// Target URL
        url: String,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Self::Status { json: false }
    }
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            store: None,
            store_path: None,
            command: Commands::default(),
        }
    }
}
