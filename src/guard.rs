//! Authorization guard for application routes
//!
//! Decides whether navigation to a route may proceed. Routes matching one of
//! the configured glob patterns require an authenticated session; the guard
//! fails closed and never allows a protected route while the session is not
//! authenticated.

use std::sync::Arc;

use metrics::increment_counter;
use url::Url;

use crate::auth::manager::SessionManager;
use crate::auth::session::SessionState;
use crate::config::RouteConfig;

/// Where the application should go instead of the requested route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// An in-application path.
    Route(String),
    /// A full-page navigation to the identity provider.
    External(Url),
}

/// Outcome of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Navigation may proceed.
    Allow,
    /// Navigation is replaced by another target.
    Redirect(Navigation),
}

/// Route guard backed by a [`SessionManager`].
///
/// # Examples
///
/// ```no_run
/// use oidc_session::auth::manager::SessionManager;
/// use oidc_session::config::Config;
/// use oidc_session::guard::{AuthGuard, GuardDecision};
///
/// # async fn example() -> oidc_session::error::Result<()> {
/// let config = Config::default();
/// let manager = SessionManager::builder(config.oidc).build()?;
/// let guard = AuthGuard::new(manager, config.routes);
///
/// match guard.can_activate("/protected").await {
///     GuardDecision::Allow => println!("render the view"),
///     GuardDecision::Redirect(target) => println!("go to {target:?}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AuthGuard {
    manager: Arc<SessionManager>,
    routes: RouteConfig,
}

impl AuthGuard {
    /// Creates a guard over `routes`.
    pub fn new(manager: Arc<SessionManager>, routes: RouteConfig) -> Self {
        Self { manager, routes }
    }

    /// The route table.
    pub fn routes(&self) -> &RouteConfig {
        &self.routes
    }

    /// Whether `path` (query and fragment ignored) matches a protected
    /// pattern.
    pub fn is_protected(&self, path: &str) -> bool {
        let path = route_path(path);
        self.routes
            .protected
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, path))
    }

    /// Guard check run before activating `path`.
    ///
    /// Waits for an in-flight renewal before deciding. For an
    /// unauthenticated session on a protected route, redirects to the
    /// login route with `returnUrl`, or starts login directly when no login
    /// route is configured. If starting login fails the user is sent to the
    /// unauthorized route.
    pub async fn can_activate(&self, path: &str) -> GuardDecision {
        if !self.is_protected(path) {
            return GuardDecision::Allow;
        }

        if self.manager.get_session().state == SessionState::Renewing {
            tracing::debug!(path, "Waiting for renewal before guard decision");
            self.manager.wait_for_renewal().await;
        }

        if self.manager.is_authenticated() {
            return GuardDecision::Allow;
        }

        increment_counter!("oidc_guard_denied_total");
        if let Some(login_route) = &self.routes.login_route {
            tracing::debug!(path, "Protected route requires login");
            return GuardDecision::Redirect(Navigation::Route(with_return_url(login_route, path)));
        }

        match self.manager.initiate_login(Some(path)).await {
            Ok(url) => GuardDecision::Redirect(Navigation::External(url)),
            Err(e) => {
                tracing::warn!(error = %e, path, "Could not start login");
                GuardDecision::Redirect(self.unauthorized())
            }
        }
    }

    /// Synchronous check that never starts a login.
    pub fn check(&self, path: &str) -> GuardDecision {
        if !self.is_protected(path) || self.manager.is_authenticated() {
            return GuardDecision::Allow;
        }
        let target = match &self.routes.login_route {
            Some(login_route) => Navigation::Route(with_return_url(login_route, path)),
            None => self.unauthorized(),
        };
        GuardDecision::Redirect(target)
    }

    /// Completes a login from the callback and returns where to go next.
    ///
    /// Only local paths are honoured as the preserved destination.
    pub async fn complete_login(&self, callback: &str) -> Navigation {
        match self.manager.handle_callback(callback).await {
            Ok(result) => match result.return_to {
                Some(path) if is_local_path(&path) => Navigation::Route(path),
                Some(path) => {
                    tracing::warn!(return_to = %path, "Ignoring non-local return path");
                    Navigation::Route(self.routes.default_route.clone())
                }
                None => Navigation::Route(self.routes.default_route.clone()),
            },
            Err(e) => {
                tracing::warn!(error = %e, outcome = ?crate::error::kind_of(&e).map(|k| k.outcome()), "Login did not complete");
                self.unauthorized()
            }
        }
    }

    fn unauthorized(&self) -> Navigation {
        Navigation::Route(self.routes.unauthorized_route.clone())
    }
}

fn route_path(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

fn with_return_url(login_route: &str, path: &str) -> String {
    let separator = if login_route.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
    format!("{login_route}{separator}returnUrl={encoded}")
}

fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.starts_with("/\\")
}
