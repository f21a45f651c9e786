//! Bearer token attachment for protected API calls
//!
//! A request receives `Authorization: Bearer <access_token>` only when its
//! URL has the same origin as a configured protected API and its path lies
//! under that API's path prefix (at a segment boundary), and the session is
//! authenticated. Every other request passes through untouched, so tokens
//! never leak to third-party origins.

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use url::{Origin, Url};

use crate::auth::manager::SessionManager;
use crate::auth::session::SessionState;
use crate::error::{OidcError, Result};

/// One protected API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProtectedApi {
    origin: Origin,
    path_prefix: String,
}

impl ProtectedApi {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| {
            OidcError::Configuration(format!("invalid protected API URL '{raw}': {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(OidcError::Configuration(format!(
                "protected API URL '{raw}' must use http or https"
            ))
            .into());
        }
        Ok(Self {
            origin: url.origin(),
            path_prefix: url.path().trim_end_matches('/').to_string(),
        })
    }

    fn matches(&self, url: &Url) -> bool {
        if url.origin() != self.origin {
            return false;
        }
        let path = url.path();
        self.path_prefix.is_empty()
            || path == self.path_prefix
            || path
                .strip_prefix(self.path_prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Attaches the current access token to protected API requests.
#[derive(Debug, Clone)]
pub struct RequestDecorator {
    manager: Arc<SessionManager>,
    apis: Vec<ProtectedApi>,
}

impl RequestDecorator {
    /// Creates a decorator for the given protected API base URLs.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] for URLs that cannot be parsed
    /// or are not http(s).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oidc_session::auth::manager::SessionManager;
    /// use oidc_session::config::Config;
    /// use oidc_session::decorator::RequestDecorator;
    ///
    /// # async fn example() -> oidc_session::error::Result<()> {
    /// let config = Config::default();
    /// let manager = SessionManager::builder(config.oidc).build()?;
    /// let decorator = RequestDecorator::new(manager, &config.api.protected)?;
    ///
    /// let client = reqwest::Client::new();
    /// let request = client.get("https://api.example.com/v1/orders").build()?;
    /// let response = decorator.execute(&client, request).await?;
    /// println!("{}", response.status());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(manager: Arc<SessionManager>, protected: &[String]) -> Result<Self> {
        let apis = protected
            .iter()
            .map(|raw| ProtectedApi::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { manager, apis })
    }

    /// Whether `url` targets a configured protected API.
    pub fn is_protected(&self, url: &Url) -> bool {
        self.apis.iter().any(|api| api.matches(url))
    }

    /// Attaches the bearer token when `request` targets a protected API and
    /// the session is authenticated.
    ///
    /// Returns `true` if the header was set.
    pub fn decorate(&self, request: &mut reqwest::Request) -> bool {
        if !self.is_protected(request.url()) {
            return false;
        }
        let Some(token) = self.manager.access_token() else {
            tracing::debug!(url = %request.url(), "No authenticated session; request sent without token");
            return false;
        };

        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Access token is not a valid header value");
                false
            }
        }
    }

    /// Sends `request`, attaching the token where appropriate.
    ///
    /// Waits for an in-flight renewal before sending to a protected API. On
    /// a `401` from a protected API, performs one out-of-band renewal and
    /// retries once; requests whose body cannot be cloned are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Http`] for transport failures. HTTP error
    /// statuses are returned as responses.
    pub async fn execute(
        &self,
        client: &reqwest::Client,
        request: reqwest::Request,
    ) -> Result<reqwest::Response> {
        if !self.is_protected(request.url()) {
            return client.execute(request).await.map_err(|e| OidcError::Http(e).into());
        }

        if self.manager.get_session().state == SessionState::Renewing {
            self.manager.wait_for_renewal().await;
        }

        let retry = request.try_clone();
        let mut request = request;
        self.decorate(&mut request);

        let response = client.execute(request).await.map_err(OidcError::Http)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut retry) = retry else {
            tracing::debug!("Protected API returned 401; request body not replayable");
            return Ok(response);
        };

        tracing::warn!(url = %retry.url(), "Protected API returned 401 Unauthorized; attempting renewal");
        if !self.manager.handle_unauthorized().await || !self.decorate(&mut retry) {
            return Ok(response);
        }

        tracing::info!(url = %retry.url(), "Retrying request with renewed token");
        client.execute(retry).await.map_err(|e| OidcError::Http(e).into())
    }
}
