//! OpenID Connect protocol requests
//!
//! [`OidcClient`] builds the URLs the user agent is sent to (authorization
//! and end-session) and performs the back-channel token endpoint exchanges
//! (authorization code with PKCE, refresh token). It holds no session state;
//! correlation values are supplied by the session manager.
//!
//! # References
//!
//! - OpenID Connect Core 1.0 <https://openid.net/specs/openid-connect-core-1_0.html>
//! - RP-Initiated Logout 1.0 <https://openid.net/specs/openid-connect-rpinitiated-1_0.html>
//! - RFC 7636 PKCE <https://www.rfc-editor.org/rfc/rfc7636>

use serde::Deserialize;
use url::Url;

use crate::auth::discovery::ProviderMetadata;
use crate::config::{OidcConfig, ResponseType};
use crate::error::{OidcError, Result};

// ---------------------------------------------------------------------------
// Token endpoint response
// ---------------------------------------------------------------------------

/// Successful token endpoint response.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    /// Issued access token.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// New refresh token, when rotated or first issued.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Identity token, always present on code exchange.
    #[serde(default)]
    pub id_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// OAuth error body (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// AuthorizeRequest
// ---------------------------------------------------------------------------

/// Per-attempt parameters of an authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest<'a> {
    /// Anti-CSRF value.
    pub state: &'a str,
    /// Replay-protection value.
    pub nonce: &'a str,
    /// PKCE S256 challenge for code-based response types.
    pub code_challenge: Option<&'a str>,
    /// Where the provider should send the response.
    pub redirect_uri: &'a Url,
    /// `prompt` parameter; `Some("none")` for silent renewal.
    pub prompt: Option<&'a str>,
    /// Current identity token, hinting which user to renew.
    pub id_token_hint: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// OidcClient
// ---------------------------------------------------------------------------

/// Stateless OpenID Connect relying-party client.
#[derive(Debug, Clone)]
pub struct OidcClient {
    http: reqwest::Client,
    client_id: String,
    scope: String,
    response_type: String,
    response_kind: ResponseType,
    post_logout_redirect_uri: Option<Url>,
}

impl OidcClient {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] for an invalid response type or
    /// post-logout redirect URI.
    pub fn from_config(http: reqwest::Client, config: &OidcConfig) -> Result<Self> {
        let post_logout_redirect_uri = config
            .post_logout_redirect_uri
            .as_deref()
            .map(|uri| {
                Url::parse(uri).map_err(|e| {
                    OidcError::Configuration(format!("invalid post_logout_redirect_uri: {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
            response_type: config.response_type.clone(),
            response_kind: config.response_kind()?,
            post_logout_redirect_uri,
        })
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Parsed response type.
    pub fn response_kind(&self) -> ResponseType {
        self.response_kind
    }

    /// Configured post-logout redirect URI.
    pub fn post_logout_redirect_uri(&self) -> Option<&Url> {
        self.post_logout_redirect_uri.as_ref()
    }

    /// Builds the authorization request URL.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] when the provider's authorization
    /// endpoint is not a URL.
    pub fn authorize_url(
        &self,
        metadata: &ProviderMetadata,
        request: &AuthorizeRequest<'_>,
    ) -> Result<Url> {
        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            OidcError::Configuration(format!("invalid authorization endpoint URL: {e}"))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", request.redirect_uri.as_str());
            query.append_pair("response_type", &self.response_type);
            query.append_pair("scope", &self.scope);
            query.append_pair("state", request.state);
            query.append_pair("nonce", request.nonce);
            if let Some(challenge) = request.code_challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair("code_challenge_method", "S256");
            }
            if let Some(prompt) = request.prompt {
                query.append_pair("prompt", prompt);
            }
            if let Some(hint) = request.id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
        }

        Ok(url)
    }

    /// Builds the RP-initiated logout URL, or `None` when the provider has no
    /// end-session endpoint.
    pub fn end_session_url(
        &self,
        metadata: &ProviderMetadata,
        id_token_hint: Option<&str>,
    ) -> Option<Url> {
        let endpoint = metadata.end_session_endpoint.as_deref()?;
        let mut url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid end_session_endpoint");
                return None;
            }
        };

        {
            let mut query = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(post_logout) = &self.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", post_logout.as_str());
            }
            query.append_pair("client_id", &self.client_id);
        }

        Some(url)
    }

    /// Exchanges an authorization code at the token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Provider`] when the endpoint rejects the request
    /// and [`OidcError::Http`] on transport failure.
    pub async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: &Url,
    ) -> Result<TokenResponse> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }
        self.token_request(metadata, &params).await
    }

    /// Exchanges a refresh token at the token endpoint.
    ///
    /// # Errors
    ///
    /// Same as [`exchange_code`](Self::exchange_code).
    pub async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
        ];
        self.token_request(metadata, &params).await
    }

    async fn token_request(
        &self,
        metadata: &ProviderMetadata,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse> {
        let endpoint = metadata.token_endpoint_url()?;
        let resp = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(OidcError::Http)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let (error, description) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => (err.error, err.error_description),
                Err(_) => (
                    "server_error".to_string(),
                    Some(format!("token endpoint returned {status}")),
                ),
            };
            tracing::warn!(%status, error = %error, "Token endpoint rejected request");
            return Err(OidcError::Provider { error, description }.into());
        }

        resp.json()
            .await
            .map_err(|e| OidcError::Provider {
                error: "invalid_response".to_string(),
                description: Some(format!("failed to parse token response: {e}")),
            })
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_utils::static_metadata;
    use std::collections::HashMap;

    fn client(response_type: &str) -> OidcClient {
        let mut config = Config::default().oidc;
        config.response_type = response_type.to_string();
        OidcClient::from_config(reqwest::Client::new(), &config).unwrap()
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn test_authorize_url_contains_correlation_values() {
        let client = client("id_token token");
        let redirect = Url::parse("https://app.example.com/callback").unwrap();
        let url = client
            .authorize_url(
                &static_metadata("https://idp.example.com"),
                &AuthorizeRequest {
                    state: "st",
                    nonce: "no",
                    code_challenge: None,
                    redirect_uri: &redirect,
                    prompt: None,
                    id_token_hint: None,
                },
            )
            .unwrap();

        let query = query_map(&url);
        assert_eq!(url.path(), "/connect/authorize");
        assert_eq!(query["client_id"], "ng-oidc-client-identity");
        assert_eq!(query["response_type"], "id_token token");
        assert_eq!(query["state"], "st");
        assert_eq!(query["nonce"], "no");
        assert_eq!(query["redirect_uri"], "https://app.example.com/callback");
        assert!(!query.contains_key("code_challenge"));
        assert!(!query.contains_key("prompt"));
    }

    #[test]
    fn test_silent_authorize_url_has_prompt_none_and_pkce() {
        let client = client("code");
        let redirect = Url::parse("https://app.example.com/silent").unwrap();
        let url = client
            .authorize_url(
                &static_metadata("https://idp.example.com"),
                &AuthorizeRequest {
                    state: "st",
                    nonce: "no",
                    code_challenge: Some("chal"),
                    redirect_uri: &redirect,
                    prompt: Some("none"),
                    id_token_hint: Some("a.b.c"),
                },
            )
            .unwrap();

        let query = query_map(&url);
        assert_eq!(query["prompt"], "none");
        assert_eq!(query["code_challenge"], "chal");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["id_token_hint"], "a.b.c");
    }

    #[test]
    fn test_invalid_authorization_endpoint_is_configuration_error() {
        let client = client("code");
        let mut metadata = static_metadata("https://idp.example.com");
        metadata.authorization_endpoint = "::not a url::".to_string();
        let redirect = Url::parse("https://app.example.com/callback").unwrap();
        let err = client
            .authorize_url(
                &metadata,
                &AuthorizeRequest {
                    state: "s",
                    nonce: "n",
                    code_challenge: None,
                    redirect_uri: &redirect,
                    prompt: None,
                    id_token_hint: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OidcError::Configuration(_))
        ));
    }

    #[test]
    fn test_end_session_url_with_hint_and_post_logout() {
        let client = client("id_token token");
        let url = client
            .end_session_url(&static_metadata("https://idp.example.com"), Some("a.b.c"))
            .unwrap();
        let query = query_map(&url);
        assert_eq!(query["id_token_hint"], "a.b.c");
        assert_eq!(
            query["post_logout_redirect_uri"],
            "https://ng-oidc-client.stackblitz.io/signout-callback.html"
        );
    }

    #[test]
    fn test_end_session_url_absent_without_endpoint() {
        let client = client("id_token token");
        let mut metadata = static_metadata("https://idp.example.com");
        metadata.end_session_endpoint = None;
        assert!(client.end_session_url(&metadata, None).is_none());
    }

    #[test]
    fn test_token_response_debug_hides_tokens() {
        let resp: TokenResponse = serde_json::from_str(
            r#"{"access_token":"secret-at","refresh_token":"secret-rt","expires_in":60}"#,
        )
        .unwrap();
        assert_eq!(resp.token_type, "Bearer");
        let debug = format!("{resp:?}");
        assert!(!debug.contains("secret"));
    }
}
