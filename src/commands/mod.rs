/*!
Command handlers for the CLI

Each handler builds a session manager from the loaded configuration,
restores the persisted session, and runs one operation:

- `session` - login, callback, renew and logout
- `status`  - session report as a table or JSON
- `access`  - route guard evaluation and decorated API requests
*/

use std::sync::Arc;

use colored::Colorize;

use crate::auth::manager::SessionManager;
use crate::auth::navigator::BrowserNavigator;
use crate::config::Config;
use crate::error::Result;

pub mod status;

/// A configured manager with its persisted session restored.
pub struct SessionContext {
    /// Loaded configuration.
    pub config: Config,
    /// The session manager.
    pub manager: Arc<SessionManager>,
}

impl SessionContext {
    /// Builds the manager and restores the stored session.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `open_browser` - Whether login and logout redirects open a browser
    ///
    /// # Errors
    ///
    /// Returns configuration or storage errors from building the manager.
    pub fn new(config: Config, open_browser: bool) -> Result<Self> {
        let manager = SessionManager::builder(config.oidc.clone())
            .navigator(Arc::new(BrowserNavigator::new(open_browser)))
            .build()?;
        let snapshot = manager.restore();
        tracing::debug!(state = %snapshot.state, "Session restored");
        Ok(Self { config, manager })
    }
}

// Session lifecycle commands
pub mod session {
    //! Login, callback, renewal and logout handlers.

    use super::*;

    /// Start an interactive login.
    ///
    /// Prints the authorization URL. When a login is already pending the
    /// same URL is printed again.
    pub async fn login(config: Config, return_to: Option<String>, no_browser: bool) -> Result<()> {
        let ctx = SessionContext::new(config, !no_browser)?;

        if ctx.manager.is_authenticated() {
            if let Some(session) = ctx.manager.get_session().session {
                println!(
                    "{} Already signed in as {}",
                    "✓".green(),
                    session.profile.display_name().bold()
                );
            }
            return Ok(());
        }

        let url = ctx.manager.initiate_login(return_to.as_deref()).await?;
        tracing::info!(host = url.host_str().unwrap_or_default(), "Login started");
        println!("{}", url);
        eprintln!(
            "After signing in, run: {}",
            "oidc-session callback '<redirected URL>'".cyan()
        );
        Ok(())
    }

    /// Complete a login from the provider's redirect.
    pub async fn callback(config: Config, url: String) -> Result<()> {
        let ctx = SessionContext::new(config, false)?;

        match ctx.manager.handle_callback(&url).await {
            Ok(result) => {
                println!(
                    "{} Signed in as {}",
                    "✓".green(),
                    result.session.profile.display_name().bold()
                );
                println!(
                    "  Session expires at {}",
                    result.session.expires_at.to_rfc3339()
                );
                if let Some(path) = result.return_to {
                    println!("  Continue at {}", path);
                }
                Ok(())
            }
            Err(e) => {
                eprintln!("{} Login failed: {}", "✗".red(), e);
                Err(e)
            }
        }
    }

    /// Renew the tokens now.
    pub async fn renew(config: Config) -> Result<()> {
        let ctx = SessionContext::new(config, false)?;
        ctx.manager.wait_for_renewal().await;

        match ctx.manager.signin_silent().await {
            Ok(()) => {
                if let Some(session) = ctx.manager.get_session().session {
                    println!(
                        "{} Tokens renewed; valid until {}",
                        "✓".green(),
                        session.expires_at.to_rfc3339()
                    );
                }
                Ok(())
            }
            Err(e) => {
                eprintln!("{} Renewal failed: {}", "✗".red(), e);
                Err(e)
            }
        }
    }

    /// Sign out locally and at the provider.
    pub async fn logout(config: Config) -> Result<()> {
        let ctx = SessionContext::new(config, true)?;
        let target = ctx.manager.logout().await?;
        println!("{} Signed out", "✓".green());
        if let Some(url) = target {
            println!("  Provider sign-out: {}", url);
        }
        Ok(())
    }
}

// Guard and protected API commands
pub mod access {
    //! Route guard evaluation and decorated requests.

    use super::*;
    use crate::decorator::RequestDecorator;
    use crate::guard::{AuthGuard, GuardDecision, Navigation};

    /// Evaluate the route guard for `path` without starting a login.
    pub async fn guard(config: Config, path: String) -> Result<()> {
        let ctx = SessionContext::new(config, false)?;
        ctx.manager.wait_for_renewal().await;
        let guard = AuthGuard::new(ctx.manager.clone(), ctx.config.routes.clone());

        match guard.check(&path) {
            GuardDecision::Allow => println!("{} allow {}", "✓".green(), path),
            GuardDecision::Redirect(Navigation::Route(route)) => {
                println!("{} redirect {}", "→".yellow(), route)
            }
            GuardDecision::Redirect(Navigation::External(url)) => {
                println!("{} redirect {}", "→".yellow(), url)
            }
        }
        Ok(())
    }

    /// GET `url`, attaching the access token for protected APIs.
    pub async fn fetch(config: Config, url: String) -> Result<()> {
        let ctx = SessionContext::new(config, false)?;
        let decorator = RequestDecorator::new(ctx.manager.clone(), &ctx.config.api.protected)?;
        let client = reqwest::Client::new();
        let request = client.get(&url).build()?;

        let response = decorator.execute(&client, request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            eprintln!("{}", status.to_string().green());
        } else {
            eprintln!("{}", status.to_string().red());
        }
        println!("{}", body);
        Ok(())
    }
}
