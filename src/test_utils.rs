//! Test utilities for oidc-session
//!
//! Provides a signing key matching `tests/fixtures/jwks.json`, an identity
//! token builder, static provider metadata, and a fully wired
//! [`SessionManager`] harness driven by a fake provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use url::Url;
use uuid::Uuid;

use crate::auth::clock::{AnchoredClock, Clock};
use crate::auth::discovery::{Discovery, ProviderMetadata};
use crate::auth::id_token::{token_hash, IdTokenClaims};
use crate::auth::manager::{CallbackResult, SessionManager};
use crate::auth::navigator::{Navigator, RecordingNavigator, SilentNavigator};
use crate::auth::session::{PendingLogin, Session, UserProfile};
use crate::auth::token_store::{MemoryStateStore, StateStore, TokenStore};
use crate::config::{Config, OidcConfig, StoreBackend};
use crate::error::Result;

/// Issuer used by test tokens and metadata.
pub const TEST_ISSUER: &str = "https://idp.example.com";

/// Client id used by test tokens and configuration.
pub const TEST_CLIENT_ID: &str = "spa-client";

const SIGNING_KEY_PEM: &str = include_str!("../tests/fixtures/rsa_private.pem");
const JWKS_JSON: &str = include_str!("../tests/fixtures/jwks.json");
const TEST_KID: &str = "test-key-1";

/// Whole-second start time so expiry arithmetic stays exact.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Public key set matching the test signing key.
pub fn test_jwks() -> JwkSet {
    serde_json::from_str(JWKS_JSON).expect("fixture jwks.json is valid")
}

/// The single key from [`test_jwks`].
pub fn signing_jwk() -> Jwk {
    test_jwks().keys.remove(0)
}

/// Provider metadata with endpoints under `issuer`.
pub fn static_metadata(issuer: &str) -> ProviderMetadata {
    let base = issuer.trim_end_matches('/');
    ProviderMetadata {
        issuer: issuer.to_string(),
        authorization_endpoint: format!("{base}/connect/authorize"),
        token_endpoint: Some(format!("{base}/connect/token")),
        jwks_uri: Some(format!("{base}/.well-known/jwks")),
        end_session_endpoint: Some(format!("{base}/connect/endsession")),
        userinfo_endpoint: Some(format!("{base}/connect/userinfo")),
        response_types_supported: vec![
            "code".to_string(),
            "id_token token".to_string(),
        ],
        code_challenge_methods_supported: Some(vec!["S256".to_string()]),
        extra: HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Identity tokens
// ---------------------------------------------------------------------------

/// Builds RS256-signed identity tokens.
#[derive(Debug, Clone)]
pub struct IdTokenBuilder {
    iss: String,
    sub: String,
    aud: serde_json::Value,
    iat: DateTime<Utc>,
    lifetime: i64,
    nonce: Option<String>,
    at_hash: Option<String>,
    azp: Option<String>,
}

impl IdTokenBuilder {
    /// Token for `alice` issued at `iat`, valid for one hour.
    pub fn new(iat: DateTime<Utc>) -> Self {
        Self {
            iss: TEST_ISSUER.to_string(),
            sub: "alice".to_string(),
            aud: serde_json::json!(TEST_CLIENT_ID),
            iat,
            lifetime: 3600,
            nonce: None,
            at_hash: None,
            azp: None,
        }
    }

    pub fn issuer(mut self, iss: &str) -> Self {
        self.iss = iss.to_string();
        self
    }

    pub fn subject(mut self, sub: &str) -> Self {
        self.sub = sub.to_string();
        self
    }

    pub fn audience(mut self, aud: &str) -> Self {
        self.aud = serde_json::json!(aud);
        self
    }

    pub fn audiences(mut self, auds: &[&str]) -> Self {
        self.aud = serde_json::json!(auds);
        self
    }

    pub fn nonce(mut self, nonce: &str) -> Self {
        self.nonce = Some(nonce.to_string());
        self
    }

    pub fn at_hash_for(mut self, access_token: &str) -> Self {
        self.at_hash = Some(token_hash(Algorithm::RS256, access_token));
        self
    }

    pub fn lifetime_secs(mut self, secs: i64) -> Self {
        self.lifetime = secs;
        self
    }

    pub fn authorized_party(mut self, azp: &str) -> Self {
        self.azp = Some(azp.to_string());
        self
    }

    /// Signs the token with the fixture key.
    pub fn sign(self) -> String {
        let mut claims = serde_json::json!({
            "iss": self.iss,
            "sub": self.sub,
            "aud": self.aud,
            "iat": self.iat.timestamp(),
            "exp": self.iat.timestamp() + self.lifetime,
            "name": "Alice Example",
            "email": "alice@example.com",
        });
        if let Some(nonce) = self.nonce {
            claims["nonce"] = serde_json::json!(nonce);
        }
        if let Some(at_hash) = self.at_hash {
            claims["at_hash"] = serde_json::json!(at_hash);
        }
        if let Some(azp) = self.azp {
            claims["azp"] = serde_json::json!(azp);
        }

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KID.to_string());
        let key = EncodingKey::from_rsa_pem(SIGNING_KEY_PEM.as_bytes())
            .expect("fixture key is valid PEM");
        jsonwebtoken::encode(&header, &claims, &key).expect("token signs")
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A session for `alice` expiring one hour after `now`.
pub fn sample_session(now: DateTime<Utc>) -> Session {
    let expires_at = now + chrono::Duration::hours(1);
    let claims: IdTokenClaims = serde_json::from_value(serde_json::json!({
        "iss": TEST_ISSUER,
        "sub": "alice",
        "aud": TEST_CLIENT_ID,
        "iat": now.timestamp(),
        "exp": expires_at.timestamp(),
        "name": "Alice Example",
    }))
    .expect("claims deserialize");

    Session {
        id: Uuid::new_v4(),
        identity_token: IdTokenBuilder::new(now).sign(),
        access_token: "sample-access-token".to_string(),
        refresh_token: Some("sample-refresh-token".to_string()),
        token_type: "Bearer".to_string(),
        scope: Some("openid profile api1".to_string()),
        session_state: None,
        expires_at,
        profile: UserProfile::from_claims(&claims),
    }
}

/// A pending login created at `now`.
pub fn sample_pending(now: DateTime<Utc>) -> PendingLogin {
    PendingLogin {
        state: "sample-state".to_string(),
        nonce: "sample-nonce".to_string(),
        code_verifier: None,
        redirect_uri: Url::parse("https://app.example.com/callback").unwrap(),
        return_to: Some("/protected".to_string()),
        authorize_url: Url::parse("https://idp.example.com/connect/authorize?state=sample-state")
            .unwrap(),
        created_at: now,
    }
}

/// Client configuration against [`TEST_ISSUER`] with a 60 second margin.
pub fn test_config() -> OidcConfig {
    let mut config = Config::default().oidc;
    config.authority = TEST_ISSUER.to_string();
    config.client_id = TEST_CLIENT_ID.to_string();
    config.redirect_uri = "https://app.example.com/callback".to_string();
    config.silent_redirect_uri = Some("https://app.example.com/silent-renew".to_string());
    config.post_logout_redirect_uri = Some("https://app.example.com/signed-out".to_string());
    config.response_type = "id_token token".to_string();
    config.scope = "openid profile api1".to_string();
    config.access_token_expiring_notification_time = 60;
    config.silent_request_timeout = 10;
    config.user_store.backend = StoreBackend::Memory;
    config.metadata = Some(static_metadata(TEST_ISSUER));
    config
}

// ---------------------------------------------------------------------------
// Fake provider
// ---------------------------------------------------------------------------

fn query_value(url: &Url, key: &str) -> String {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Builds the implicit-flow callback a provider would send for the
/// authorization request `url`.
fn mint_callback(
    url: &Url,
    now: DateTime<Utc>,
    expires_in: u64,
    nonce: &str,
    subject: &str,
    id_token_lifetime: i64,
) -> String {
    let access_token = format!("at-{}", Uuid::new_v4());
    let id_token = IdTokenBuilder::new(now)
        .subject(subject)
        .nonce(nonce)
        .at_hash_for(&access_token)
        .lifetime_secs(id_token_lifetime)
        .sign();
    let fragment = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("id_token", &id_token)
        .append_pair("access_token", &access_token)
        .append_pair("token_type", "Bearer")
        .append_pair("expires_in", &expires_in.to_string())
        .append_pair("scope", "openid profile api1")
        .append_pair("state", &query_value(url, "state"))
        .finish();
    format!("{}#{fragment}", query_value(url, "redirect_uri"))
}

/// Successful callback for `url` with an access token living `expires_in`
/// seconds and an identity token living one hour.
pub fn implicit_callback(url: &Url, clock: &AnchoredClock, expires_in: u64) -> String {
    mint_callback(url, clock.now(), expires_in, &query_value(url, "nonce"), "alice", 3600)
}

/// Like [`implicit_callback`] but with a foreign nonce in the identity token.
pub fn implicit_callback_with_nonce(
    url: &Url,
    clock: &AnchoredClock,
    expires_in: u64,
    nonce: &str,
) -> String {
    mint_callback(url, clock.now(), expires_in, nonce, "alice", 3600)
}

/// How the fake provider answers `prompt=none` requests.
#[derive(Debug, Clone)]
pub enum SilentBehavior {
    Succeed { expires_in: u64 },
    Delay { secs: u64, expires_in: u64 },
    Reject(&'static str),
    Hang,
    WrongSubject,
}

/// Silent navigator that answers like a provider with an active session.
#[derive(Debug)]
pub struct FakeProvider {
    clock: AnchoredClock,
    behavior: SilentBehavior,
    /// Number of round trips performed.
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(clock: AnchoredClock, behavior: SilentBehavior) -> Self {
        Self {
            clock,
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    fn success(&self, url: &Url, expires_in: u64, subject: &str) -> String {
        mint_callback(
            url,
            self.clock.now(),
            expires_in,
            &query_value(url, "nonce"),
            subject,
            expires_in as i64,
        )
    }
}

#[async_trait]
impl SilentNavigator for FakeProvider {
    async fn navigate(&self, url: Url) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(query_value(&url, "prompt"), "none");

        match &self.behavior {
            SilentBehavior::Succeed { expires_in } => Ok(self.success(&url, *expires_in, "alice")),
            SilentBehavior::Delay { secs, expires_in } => {
                tokio::time::sleep(Duration::from_secs(*secs)).await;
                Ok(self.success(&url, *expires_in, "alice"))
            }
            SilentBehavior::Reject(error) => Ok(format!(
                "{}#error={error}&state={}",
                query_value(&url, "redirect_uri"),
                query_value(&url, "state")
            )),
            SilentBehavior::Hang => std::future::pending().await,
            SilentBehavior::WrongSubject => Ok(self.success(&url, 3600, "mallory")),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A manager wired to in-memory collaborators.
pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub navigator: Arc<RecordingNavigator>,
    pub provider: Arc<FakeProvider>,
    pub clock: AnchoredClock,
}

impl Harness {
    /// Runs a full interactive login.
    pub async fn login(&self, return_to: Option<&str>) -> CallbackResult {
        let url = self.manager.initiate_login(return_to).await.unwrap();
        self.manager
            .handle_callback(&implicit_callback(&url, &self.clock, 3600))
            .await
            .unwrap()
    }
}

fn build_harness(
    config: OidcConfig,
    backend: Arc<dyn StateStore>,
    behavior: SilentBehavior,
    custom_navigator: Option<Arc<dyn Navigator>>,
) -> Harness {
    let clock = AnchoredClock::starting_at(test_epoch());
    let navigator = Arc::new(RecordingNavigator::new());
    let provider = Arc::new(FakeProvider::new(clock.clone(), behavior));
    let authority = Url::parse(&config.authority).unwrap();
    let mut discovery = Discovery::new(reqwest::Client::new(), authority).with_keys(test_jwks());
    if let Some(metadata) = config.metadata.clone() {
        discovery = discovery.with_metadata(metadata);
    }
    let store = TokenStore::new(backend, &config.authority, &config.client_id);

    let manager = SessionManager::builder(config)
        .store(store)
        .discovery(discovery)
        .navigator(custom_navigator.unwrap_or_else(|| navigator.clone()))
        .silent_navigator(provider.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    Harness {
        manager,
        navigator,
        provider,
        clock,
    }
}

/// Harness over [`test_config`] adjusted by `configure`.
pub fn test_manager(behavior: SilentBehavior, configure: impl FnOnce(&mut OidcConfig)) -> Harness {
    let mut config = test_config();
    configure(&mut config);
    build_harness(config, Arc::new(MemoryStateStore::new()), behavior, None)
}

/// Harness over [`test_config`] persisting into `backend`.
pub fn test_manager_with_backend(backend: Arc<dyn StateStore>, behavior: SilentBehavior) -> Harness {
    build_harness(test_config(), backend, behavior, None)
}

/// Harness over [`test_config`] redirecting through `navigator`.
pub fn test_manager_with_navigator(navigator: Arc<dyn Navigator>, behavior: SilentBehavior) -> Harness {
    build_harness(
        test_config(),
        Arc::new(MemoryStateStore::new()),
        behavior,
        Some(navigator),
    )
}
