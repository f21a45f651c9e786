//! oidc-session - OpenID Connect session manager CLI
//!
//! Main entry point for the oidc-session application.

use anyhow::Result;

use oidc_session::cli::{Cli, Commands};
use oidc_session::commands;
use oidc_session::config::Config;
use oidc_session::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    init_logging(&config.logging)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Login {
            return_to,
            no_browser,
        } => {
            tracing::info!("Starting interactive login");
            commands::session::login(config, return_to, no_browser).await
        }
        Commands::Callback { url } => {
            tracing::info!("Completing login from callback");
            commands::session::callback(config, url).await
        }
        Commands::Status { json } => commands::status::show_status(config, json).await,
        Commands::Renew => {
            tracing::info!("Renewing tokens");
            commands::session::renew(config).await
        }
        Commands::Logout => {
            tracing::info!("Signing out");
            commands::session::logout(config).await
        }
        Commands::Guard { path } => {
            tracing::debug!("Evaluating route guard for {}", path);
            commands::access::guard(config, path).await
        }
        Commands::Fetch { url } => {
            tracing::debug!("Fetching {}", url);
            commands::access::fetch(config, url).await
        }
    }
}
