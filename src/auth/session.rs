//! Session data model
//!
//! A [`Session`] is the persisted result of a successful login or renewal.
//! The in-memory view handed to callers is a [`SessionSnapshot`], which adds
//! the lifecycle [`SessionState`] and the generation counter used to discard
//! results that arrive after the session they belong to was superseded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::auth::id_token::IdTokenClaims;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle state of the single live session.
///
/// ```text
/// Unauthenticated -> Authenticating -> Authenticated -> Renewing -> Authenticated
///                                                       Renewing -> Expired | Error
/// Expired | Error -> Unauthenticated (logout) | Authenticating (new login)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session and no login in progress.
    #[default]
    Unauthenticated,
    /// A login redirect has been issued and the callback is awaited.
    Authenticating,
    /// Tokens are held and were unexpired when last evaluated.
    Authenticated,
    /// A silent renewal attempt is in flight.
    Renewing,
    /// The tokens expired and no renewal succeeded.
    Expired,
    /// The last login attempt failed validation.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Renewing => "renewing",
            Self::Expired => "expired",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// UserProfile
// ---------------------------------------------------------------------------

/// Validated identity claims of the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Subject identifier, stable for the user at this provider.
    pub sub: String,
    /// Issuer that asserted the identity.
    pub iss: String,
    /// Audiences the identity token was issued for.
    pub aud: Vec<String>,
    /// Issued-at time (seconds since the epoch).
    pub iat: i64,
    /// Identity token expiry (seconds since the epoch).
    pub exp: i64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// E-mail address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Preferred user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Remaining claims.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub claims: HashMap<String, serde_json::Value>,
}

impl UserProfile {
    /// Builds a profile from validated identity token claims.
    ///
    /// Protocol-only claims (`nonce`, `at_hash`, `c_hash`, `azp`) are dropped.
    pub fn from_claims(claims: &IdTokenClaims) -> Self {
        let mut extra = claims.extra.clone();
        let take = |extra: &mut HashMap<String, serde_json::Value>, key: &str| {
            extra
                .remove(key)
                .and_then(|v| v.as_str().map(str::to_string))
        };
        let name = take(&mut extra, "name");
        let email = take(&mut extra, "email");
        let preferred_username = take(&mut extra, "preferred_username");
        extra.remove("c_hash");

        Self {
            sub: claims.sub.clone(),
            iss: claims.iss.clone(),
            aud: claims.aud.to_vec(),
            iat: claims.iat,
            exp: claims.exp,
            name,
            email,
            preferred_username,
            claims: extra,
        }
    }

    /// Best human-readable label for the user.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.preferred_username.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(&self.sub)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Tokens and metadata of an authenticated session.
///
/// `Debug` output redacts every token value.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use oidc_session::auth::session::{Session, UserProfile};
///
/// let now = Utc::now();
/// let session = Session {
///     id: uuid::Uuid::new_v4(),
///     identity_token: "eyJ...".to_string(),
///     access_token: "secret-access".to_string(),
///     refresh_token: None,
///     token_type: "Bearer".to_string(),
///     scope: Some("openid profile".to_string()),
///     session_state: None,
///     expires_at: now + Duration::hours(1),
///     profile: UserProfile {
///         sub: "alice".to_string(),
///         iss: "https://idp.example.com".to_string(),
///         aud: vec!["spa".to_string()],
///         iat: now.timestamp(),
///         exp: (now + Duration::hours(1)).timestamp(),
///         name: None,
///         email: None,
///         preferred_username: None,
///         claims: Default::default(),
///     },
/// };
///
/// assert!(!session.is_expired_at(now));
/// assert!(!format!("{session:?}").contains("secret-access"));
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Correlation identifier of this session.
    pub id: Uuid,
    /// Signed identity token (compact JWS).
    ///
    /// A refresh response without a new identity token keeps this one, so it
    /// may expire before [`Session::expires_at`]. Check
    /// [`Session::identity_token_expired_at`] before presenting it to an API
    /// that validates its `exp`.
    pub identity_token: String,
    /// Bearer credential for the protected API.
    pub access_token: String,
    /// Long-lived credential for non-interactive renewal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type reported by the provider, normally `Bearer`.
    pub token_type: String,
    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Provider session identifier, when returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,
    /// Instant after which the session must not be used.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    /// Validated identity claims.
    pub profile: UserProfile,
}

impl Session {
    /// Whether the session has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until expiry; negative once expired.
    pub fn expires_in(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    /// Expiry of the identity token itself, from its `exp` claim.
    pub fn identity_token_expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.profile.exp, 0)
    }

    /// Whether the identity token is past its `exp` at `now`, independent of
    /// the session's own expiry.
    pub fn identity_token_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.identity_token_expires_at().map_or(true, |exp| now >= exp)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity_token", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .field("sub", &self.profile.sub)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the session manager's state.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Lifecycle state.
    pub state: SessionState,
    /// The live session, when one is held.
    pub session: Option<Arc<Session>>,
    /// Bumped on every login, logout and renewal completion.
    pub generation: u64,
    /// Display string of the last login or renewal failure.
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// `true` iff the state is `Authenticated` and the session is unexpired
    /// at `now`.
    pub fn is_authenticated_at(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Authenticated
            && self
                .session
                .as_ref()
                .is_some_and(|session| !session.is_expired_at(now))
    }
}

// ---------------------------------------------------------------------------
// PendingLogin
// ---------------------------------------------------------------------------

/// Correlation data persisted between the login redirect and its callback.
#[derive(Clone, Serialize, Deserialize)]
pub struct PendingLogin {
    /// Anti-CSRF value echoed back by the provider.
    pub state: String,
    /// Replay-protection value expected inside the identity token.
    pub nonce: String,
    /// PKCE verifier for code-based response types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    /// Redirect URI the authorization request was built with.
    pub redirect_uri: Url,
    /// Application path to resume after login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
    /// The authorization URL the user was sent to.
    pub authorize_url: Url,
    /// When the attempt started.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl PendingLogin {
    /// Whether the attempt is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.created_at > max_age
    }
}

impl fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLogin")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("return_to", &self.return_to)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notifications broadcast by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session was established or renewed.
    UserLoaded {
        /// Correlation identifier of the new session.
        session_id: Uuid,
    },
    /// The session was cleared by logout.
    UserUnloaded,
    /// The renewal window opened; a renewal attempt follows.
    AccessTokenExpiring {
        /// Expiry of the current tokens.
        expires_at: DateTime<Utc>,
    },
    /// The tokens expired without renewal.
    AccessTokenExpired,
    /// A silent renewal attempt failed.
    SilentRenewError {
        /// Failure description.
        message: String,
    },
    /// Callback processing failed.
    LoginError {
        /// Failure description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_session(expires_at: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            identity_token: "header.payload.sig".to_string(),
            access_token: "at-secret".to_string(),
            refresh_token: Some("rt-secret".to_string()),
            token_type: "Bearer".to_string(),
            scope: Some("openid".to_string()),
            session_state: None,
            expires_at,
            profile: UserProfile {
                sub: "alice".to_string(),
                iss: "https://idp.example.com".to_string(),
                aud: vec!["spa".to_string()],
                iat: 0,
                exp: expires_at.timestamp(),
                name: None,
                email: Some("alice@example.com".to_string()),
                preferred_username: None,
                claims: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_session_debug_redacts_tokens() {
        let session = make_session(Utc::now());
        let debug = format!("{session:?}");
        assert!(!debug.contains("at-secret"));
        assert!(!debug.contains("rt-secret"));
        assert!(!debug.contains("header.payload.sig"));
        assert!(debug.contains("alice"));
    }

    #[test]
    fn test_session_expiry_boundary() {
        let now = Utc::now();
        let session = make_session(now);
        assert!(session.is_expired_at(now));
        assert!(!session.is_expired_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_identity_token_can_expire_before_session() {
        let now = Utc::now();
        let mut session = make_session(now + Duration::seconds(1800));
        // refreshed access token outlives the kept identity token
        session.profile.exp = (now + Duration::seconds(600)).timestamp();

        assert_eq!(
            session.identity_token_expires_at().map(|t| t.timestamp()),
            Some(session.profile.exp)
        );
        assert!(!session.identity_token_expired_at(now));
        let later = now + Duration::seconds(900);
        assert!(session.identity_token_expired_at(later));
        assert!(!session.is_expired_at(later));
    }

    #[test]
    fn test_snapshot_is_authenticated_requires_state_and_time() {
        let now = Utc::now();
        let session = Arc::new(make_session(now + Duration::seconds(60)));

        let mut snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            session: Some(session),
            generation: 1,
            last_error: None,
        };
        assert!(snapshot.is_authenticated_at(now));
        assert!(!snapshot.is_authenticated_at(now + Duration::seconds(60)));

        snapshot.state = SessionState::Renewing;
        assert!(!snapshot.is_authenticated_at(now));
    }

    #[test]
    fn test_default_snapshot_is_unauthenticated() {
        let snapshot = SessionSnapshot::default();
        assert_eq!(snapshot.state, SessionState::Unauthenticated);
        assert!(!snapshot.is_authenticated_at(Utc::now()));
    }

    #[test]
    fn test_session_serialization_keeps_expiry_seconds() {
        let expires_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let session = make_session(expires_at);
        let json = serde_json::to_string(&session).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);
    }

    #[test]
    fn test_pending_login_staleness() {
        let now = Utc::now();
        let pending = PendingLogin {
            state: "s".to_string(),
            nonce: "n".to_string(),
            code_verifier: None,
            redirect_uri: Url::parse("https://app.example.com/callback").unwrap(),
            return_to: Some("/protected".to_string()),
            authorize_url: Url::parse("https://idp.example.com/authorize").unwrap(),
            created_at: now - Duration::seconds(301),
        };
        assert!(pending.is_stale(now, Duration::seconds(300)));
        assert!(!pending.is_stale(now, Duration::seconds(600)));
        assert!(!format!("{pending:?}").contains("nonce: \"n\""));
    }

    #[test]
    fn test_profile_display_name_fallbacks() {
        let mut profile = make_session(Utc::now()).profile;
        assert_eq!(profile.display_name(), "alice@example.com");
        profile.name = Some("Alice".to_string());
        assert_eq!(profile.display_name(), "Alice");
        profile.name = None;
        profile.email = None;
        assert_eq!(profile.display_name(), "alice");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Renewing.to_string(), "renewing");
        assert_eq!(SessionState::default().to_string(), "unauthenticated");
    }
}
