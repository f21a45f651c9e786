//! OpenID Provider discovery
//!
//! Fetches the provider's metadata document from
//! `<authority>/.well-known/openid-configuration` (OpenID Connect Discovery
//! 1.0) and the JSON Web Key Set referenced by its `jwks_uri`.
//!
//! [`Discovery`] caches both for the lifetime of the session manager. The key
//! set is fetched again once when an identity token names a `kid` that is not
//! in the cached set, which covers provider key rotation.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use url::Url;

use crate::error::{OidcError, Result};

// ---------------------------------------------------------------------------
// ProviderMetadata
// ---------------------------------------------------------------------------

/// OpenID Provider metadata.
///
/// # Examples
///
/// ```
/// use oidc_session::auth::discovery::ProviderMetadata;
///
/// let json = r#"{
///     "issuer": "https://idp.example.com",
///     "authorization_endpoint": "https://idp.example.com/connect/authorize",
///     "token_endpoint": "https://idp.example.com/connect/token",
///     "jwks_uri": "https://idp.example.com/.well-known/jwks",
///     "end_session_endpoint": "https://idp.example.com/connect/endsession"
/// }"#;
///
/// let meta: ProviderMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.issuer, "https://idp.example.com");
/// assert!(meta.end_session_endpoint.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier; identity tokens must carry it as `iss`.
    pub issuer: String,

    /// Authorization endpoint for interactive and `prompt=none` requests.
    pub authorization_endpoint: String,

    /// Token endpoint for code exchange and refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// Location of the provider's signing keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// UserInfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// Supported `response_type` values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types_supported: Vec<String>,

    /// Supported PKCE methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProviderMetadata {
    /// Parsed token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Discovery`] when the provider advertises none or
    /// it is not a URL.
    pub fn token_endpoint_url(&self) -> Result<Url> {
        let raw = self.token_endpoint.as_deref().ok_or_else(|| {
            OidcError::Discovery("provider does not advertise a token_endpoint".to_string())
        })?;
        Url::parse(raw)
            .map_err(|e| OidcError::Discovery(format!("invalid token_endpoint: {e}")).into())
    }
}

// ---------------------------------------------------------------------------
// Fetch helpers
// ---------------------------------------------------------------------------

/// Builds `<authority>/.well-known/openid-configuration`, keeping any path
/// component of the authority.
pub fn configuration_url(authority: &Url) -> Url {
    let mut url = authority.clone();
    let path = format!(
        "{}/.well-known/openid-configuration",
        authority.path().trim_end_matches('/')
    );
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Fetches and checks the provider metadata document.
///
/// # Arguments
///
/// * `http` - HTTP client.
/// * `authority` - Issuer base URL from configuration.
///
/// # Errors
///
/// Returns [`OidcError::Discovery`] when the request fails, the document
/// cannot be parsed, or its `issuer` differs from `authority`.
pub async fn fetch_provider_metadata(
    http: &reqwest::Client,
    authority: &Url,
) -> Result<ProviderMetadata> {
    let url = configuration_url(authority);
    tracing::debug!(url = %url, "Fetching provider metadata");

    let resp = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| OidcError::Discovery(format!("metadata fetch failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(OidcError::Discovery(format!(
            "metadata endpoint {url} returned {}",
            resp.status()
        ))
        .into());
    }

    let metadata: ProviderMetadata = resp
        .json()
        .await
        .map_err(|e| OidcError::Discovery(format!("failed to parse provider metadata: {e}")))?;

    if metadata.issuer.trim_end_matches('/') != authority.as_str().trim_end_matches('/') {
        return Err(OidcError::Discovery(format!(
            "issuer mismatch: expected {authority}, provider reports {}",
            metadata.issuer
        ))
        .into());
    }

    Ok(metadata)
}

/// Fetches a JSON Web Key Set.
///
/// # Errors
///
/// Returns [`OidcError::Discovery`] when the request fails or the body is not
/// a key set.
pub async fn fetch_jwks(http: &reqwest::Client, jwks_uri: &str) -> Result<JwkSet> {
    tracing::debug!(url = %jwks_uri, "Fetching signing keys");
    let resp = http
        .get(jwks_uri)
        .send()
        .await
        .map_err(|e| OidcError::Discovery(format!("jwks fetch failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(OidcError::Discovery(format!(
            "jwks endpoint returned {}",
            resp.status()
        ))
        .into());
    }

    resp.json()
        .await
        .map_err(|e| OidcError::Discovery(format!("failed to parse jwks: {e}")).into())
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Cached access to provider metadata and signing keys.
pub struct Discovery {
    http: reqwest::Client,
    authority: Url,
    metadata: OnceCell<Arc<ProviderMetadata>>,
    keys: RwLock<Option<Arc<JwkSet>>>,
}

impl Discovery {
    /// Creates a discovery client that fetches lazily from `authority`.
    pub fn new(http: reqwest::Client, authority: Url) -> Self {
        Self {
            http,
            authority,
            metadata: OnceCell::new(),
            keys: RwLock::new(None),
        }
    }

    /// Uses fixed metadata instead of fetching the discovery document.
    pub fn with_metadata(self, metadata: ProviderMetadata) -> Self {
        Self {
            metadata: OnceCell::new_with(Some(Arc::new(metadata))),
            ..self
        }
    }

    /// Uses a fixed key set until a token names an unknown `kid`.
    pub fn with_keys(self, keys: JwkSet) -> Self {
        Self {
            keys: RwLock::new(Some(Arc::new(keys))),
            ..self
        }
    }

    /// The configured authority.
    pub fn authority(&self) -> &Url {
        &self.authority
    }

    /// Returns the provider metadata, fetching it on first use.
    ///
    /// A failed fetch is not cached; the next call tries again.
    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>> {
        self.metadata
            .get_or_try_init(|| async {
                fetch_provider_metadata(&self.http, &self.authority)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Returns the key matching `kid`.
    ///
    /// Without a `kid` the set must contain exactly one key. When the cached
    /// set lacks the requested key it is fetched again once.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::TokenValidation`] when no matching key exists and
    /// [`OidcError::Discovery`] when the key set cannot be fetched.
    pub async fn signing_key(&self, kid: Option<&str>) -> Result<Jwk> {
        if let Some(keys) = self.keys.read().await.clone() {
            if let Some(jwk) = select_key(&keys, kid) {
                return Ok(jwk);
            }
            tracing::debug!(kid = ?kid, "Signing key not cached; refreshing key set");
        }

        let fresh = Arc::new(self.fetch_keys().await?);
        *self.keys.write().await = Some(Arc::clone(&fresh));

        select_key(&fresh, kid).ok_or_else(|| {
            OidcError::TokenValidation(format!("no signing key matches kid {kid:?}")).into()
        })
    }

    async fn fetch_keys(&self) -> Result<JwkSet> {
        let metadata = self.metadata().await?;
        let jwks_uri = metadata.jwks_uri.as_deref().ok_or_else(|| {
            OidcError::Discovery("provider does not advertise a jwks_uri".to_string())
        })?;
        fetch_jwks(&self.http, jwks_uri).await
    }
}

fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => keys.find(kid).cloned(),
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("authority", &self.authority.as_str())
            .field("metadata_cached", &self.metadata.initialized())
            .finish_non_exhaustive()
    }
}
