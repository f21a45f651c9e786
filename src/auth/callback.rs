//! Authorization response parsing
//!
//! The provider returns its response either in the URL fragment (implicit
//! and hybrid flows) or in the query string (code flow). The parser accepts
//! a full redirect URL, a bare `#fragment` or `?query`, or an unprefixed
//! `key=value&...` string.

use url::form_urlencoded;

/// Parameters of an authorization response.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// Echoed anti-CSRF value.
    pub state: Option<String>,
    /// Authorization code (code and hybrid flows).
    pub code: Option<String>,
    /// Identity token (implicit and hybrid flows).
    pub id_token: Option<String>,
    /// Access token (implicit flow).
    pub access_token: Option<String>,
    /// Token type accompanying `access_token`.
    pub token_type: Option<String>,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: Option<u64>,
    /// Granted scopes.
    pub scope: Option<String>,
    /// Provider session identifier.
    pub session_state: Option<String>,
    /// OAuth error code.
    pub error: Option<String>,
    /// Human-readable error description.
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parses an authorization response.
    ///
    /// A non-empty fragment takes precedence over the query string. Unknown
    /// parameters are ignored and an unparseable `expires_in` is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidc_session::auth::callback::CallbackParams;
    ///
    /// let params = CallbackParams::parse(
    ///     "https://app.example.com/callback#access_token=at&state=xyz&expires_in=3600",
    /// );
    /// assert_eq!(params.state.as_deref(), Some("xyz"));
    /// assert_eq!(params.expires_in, Some(3600));
    ///
    /// let params = CallbackParams::parse("?error=access_denied&state=xyz");
    /// assert_eq!(params.error.as_deref(), Some("access_denied"));
    /// ```
    pub fn parse(input: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(response_part(input.trim()).as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "state" => params.state = Some(value),
                "code" => params.code = Some(value),
                "id_token" => params.id_token = Some(value),
                "access_token" => params.access_token = Some(value),
                "token_type" => params.token_type = Some(value),
                "expires_in" => match value.parse() {
                    Ok(secs) => params.expires_in = Some(secs),
                    Err(_) => tracing::warn!(value = %value, "Ignoring malformed expires_in"),
                },
                "scope" => params.scope = Some(value),
                "session_state" => params.session_state = Some(value),
                "error" => params.error = Some(value),
                "error_description" => params.error_description = Some(value),
                _ => {}
            }
        }
        params
    }

    /// Whether the response carries no recognised parameter at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Picks the parameter-bearing part of a callback string.
fn response_part(input: &str) -> &str {
    let (before_fragment, fragment) = match input.split_once('#') {
        Some((before, fragment)) => (before, Some(fragment)),
        None => (input, None),
    };
    if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
        return fragment;
    }
    match before_fragment.split_once('?') {
        Some((_, query)) => query,
        None if before_fragment.contains("://") => "",
        None => before_fragment,
    }
}

impl std::fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = |v: &Option<String>| v.as_ref().map(|_| "<present>");
        f.debug_struct("CallbackParams")
            .field("state", &present(&self.state))
            .field("code", &present(&self.code))
            .field("id_token", &present(&self.id_token))
            .field("access_token", &present(&self.access_token))
            .field("expires_in", &self.expires_in)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
