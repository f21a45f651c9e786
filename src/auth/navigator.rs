//! Platform seams for user-agent navigation
//!
//! The session manager never talks to a browser directly. Full-page
//! redirects (login, logout) go through a [`Navigator`]; the non-interactive
//! `prompt=none` round trip used for silent renewal goes through a
//! [`SilentNavigator`], which resolves with the URL the provider finally
//! redirected to.

use async_trait::async_trait;
use reqwest::header::LOCATION;
use url::Url;

use crate::error::{OidcError, Result};

/// Maximum redirects followed during one silent round trip.
const MAX_SILENT_REDIRECTS: usize = 10;

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

/// Sends the user agent to a URL.
#[cfg_attr(test, mockall::automock)]
pub trait Navigator: Send + Sync {
    /// Navigates to `url`. Returns once the navigation has been issued.
    fn redirect(&self, url: &Url) -> Result<()>;
}

/// Prints the URL and, when enabled, opens it in the system browser.
#[derive(Debug, Clone, Copy)]
pub struct BrowserNavigator {
    open_browser: bool,
}

impl BrowserNavigator {
    /// Creates a navigator; `open_browser = false` only prints the URL.
    pub fn new(open_browser: bool) -> Self {
        Self { open_browser }
    }
}

impl Default for BrowserNavigator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Navigator for BrowserNavigator {
    fn redirect(&self, url: &Url) -> Result<()> {
        eprintln!("Open the following URL in your browser:\n{url}");
        if self.open_browser {
            try_open_browser(url);
        }
        Ok(())
    }
}

/// Errors are ignored; the URL has already been printed.
fn try_open_browser(url: &Url) {
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("open").arg(url.as_str()).spawn();
    }
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("xdg-open")
            .arg(url.as_str())
            .spawn();
    }
    #[cfg(target_os = "windows")]
    {
        let _ = std::process::Command::new("cmd")
            .args(["/C", "start", "", url.as_str()])
            .spawn();
    }
}

/// Records redirects without navigating anywhere.
///
/// Used by headless hosts that hand the URL to another process.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    visited: std::sync::Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs navigated to so far, oldest first.
    pub fn visited(&self) -> Vec<Url> {
        self.visited
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &Url) -> Result<()> {
        self.visited
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(url.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SilentNavigator
// ---------------------------------------------------------------------------

/// Performs a `prompt=none` authorization round trip.
#[async_trait]
pub trait SilentNavigator: Send + Sync {
    /// Loads `url` without user interaction and returns the callback URL
    /// the provider redirected to.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::RenewalFailure`] when the round trip does not
    /// reach the silent redirect URI.
    async fn navigate(&self, url: Url) -> Result<String>;
}

/// Silent navigator that follows provider redirects over HTTP.
///
/// Works against providers that recognise the user from the request alone;
/// otherwise the provider answers with `error=login_required`, which is
/// returned as a normal callback.
#[derive(Debug, Clone)]
pub struct HttpSilentNavigator {
    http: reqwest::Client,
    redirect_uri: Url,
}

impl HttpSilentNavigator {
    /// Creates a navigator that stops at `redirect_uri`.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Http`] when the client cannot be built.
    pub fn new(redirect_uri: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(OidcError::Http)?;
        Ok(Self { http, redirect_uri })
    }

    fn is_callback(&self, url: &Url) -> bool {
        url.origin() == self.redirect_uri.origin() && url.path() == self.redirect_uri.path()
    }
}

#[async_trait]
impl SilentNavigator for HttpSilentNavigator {
    async fn navigate(&self, url: Url) -> Result<String> {
        let mut current = url;
        for _ in 0..MAX_SILENT_REDIRECTS {
            let resp = self
                .http
                .get(current.clone())
                .send()
                .await
                .map_err(OidcError::Http)?;

            if !resp.status().is_redirection() {
                return Err(OidcError::RenewalFailure(format!(
                    "silent request ended with {} before reaching the redirect URI",
                    resp.status()
                ))
                .into());
            }

            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    OidcError::RenewalFailure("redirect without Location header".to_string())
                })?;
            let next = current.join(location).map_err(|e| {
                OidcError::RenewalFailure(format!("invalid redirect location: {e}"))
            })?;

            if self.is_callback(&next) {
                return Ok(next.to_string());
            }
            current = next;
        }

        Err(OidcError::RenewalFailure("too many redirects during silent renewal".to_string()).into())
    }
}
