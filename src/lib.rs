//! oidc-session - OpenID Connect session management library
//!
//! This library manages the lifecycle of an OpenID Connect session for a
//! browser-style client: interactive login, callback validation, silent
//! renewal before expiry, and logout.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: Session manager, Token Store, discovery and callback validation
//! - `guard`: Route guard that admits or redirects navigation
//! - `decorator`: Attaches bearer tokens to protected API requests
//! - `config`: Configuration management and validation
//! - `logging`: Tracing subscriber setup
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface and handlers
//!
//! # Example
//!
//! ```no_run
//! use oidc_session::{Config, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let manager = SessionManager::builder(config.oidc).build()?;
//!     manager.restore();
//!     if !manager.is_authenticated() {
//!         let url = manager.initiate_login(Some("/protected")).await?;
//!         println!("Sign in at {url}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod decorator;
pub mod error;
pub mod guard;
pub mod logging;

// Re-export commonly used types
pub use auth::{CallbackResult, Session, SessionEvent, SessionManager, SessionSnapshot, SessionState};
pub use config::Config;
pub use decorator::RequestDecorator;
pub use error::{OidcError, Result};
pub use guard::{AuthGuard, GuardDecision, Navigation};

#[cfg(test)]
pub mod test_utils;
