//! Error types for oidc-session
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for ergonomic error handling. Protocol and validation
//! failures are reduced to a small set of user-facing [`AuthOutcome`]s so
//! that the route guard and request decorator never need to interpret
//! error kinds themselves.

use thiserror::Error;

/// Main error type for oidc-session operations
///
/// Every failure the session manager can produce is one of these variants.
/// Functions return [`Result`], an `anyhow` alias, so callers that need the
/// kind recover it with `err.downcast_ref::<OidcError>()`.
#[derive(Error, Debug)]
pub enum OidcError {
    /// Malformed authority, redirect URIs, or other configuration values.
    /// Fatal; surfaced at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The `state` returned by the provider does not match the pending
    /// login attempt (or there is no pending attempt at all).
    #[error("State mismatch in authentication callback")]
    StateMismatch,

    /// The `nonce` inside the identity token does not match the nonce
    /// bound to the login attempt. Replay suspected.
    #[error("Nonce mismatch in identity token")]
    NonceMismatch,

    /// Signature, issuer, audience, expiry or hash checks of the identity
    /// token failed.
    #[error("Token validation error: {0}")]
    TokenValidation(String),

    /// Silent renewal did not complete within the allowed window.
    #[error("Silent renewal timed out after {0} ms")]
    RenewalTimeout(u64),

    /// Silent renewal was rejected by the provider or could not be run.
    #[error("Silent renewal failed: {0}")]
    RenewalFailure(String),

    /// The stored session could not be parsed.
    #[error("Stored session is corrupted: {0}")]
    StorageCorruption(String),

    /// The provider answered with an OAuth `error` parameter.
    #[error("Provider returned error '{error}'{}", description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Provider {
        /// The raw OAuth error code (e.g. `access_denied`).
        error: String,
        /// Optional `error_description` sent alongside the code.
        description: Option<String>,
    },

    /// OpenID Provider metadata or signing keys could not be retrieved.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Backend storage failure other than corruption.
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// JWT decoding errors that are not validation failures
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// What the application shell should do after an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Send the user through interactive login again.
    RedirectToLogin,
    /// Route the user to the dedicated unauthorized/error view.
    Unauthorized,
    /// Nothing user-visible; a silent re-authentication will follow.
    SilentRetry,
}

impl OidcError {
    /// Reduces this error to a user-facing outcome.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidc_session::error::{AuthOutcome, OidcError};
    ///
    /// assert_eq!(OidcError::StateMismatch.outcome(), AuthOutcome::Unauthorized);
    /// assert_eq!(
    ///     OidcError::RenewalTimeout(5000).outcome(),
    ///     AuthOutcome::RedirectToLogin
    /// );
    /// ```
    pub fn outcome(&self) -> AuthOutcome {
        match self {
            Self::StorageCorruption(_) => AuthOutcome::SilentRetry,
            Self::RenewalTimeout(_) | Self::RenewalFailure(_) => AuthOutcome::RedirectToLogin,
            _ => AuthOutcome::Unauthorized,
        }
    }
}

/// Returns the [`OidcError`] carried by an `anyhow` error, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&OidcError> {
    err.downcast_ref::<OidcError>()
}

/// Result type alias for oidc-session operations
///
/// Uses `anyhow::Error` so that context can be attached freely while the
/// typed [`OidcError`] stays recoverable by downcasting.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let error = OidcError::Configuration("authority is not a URL".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: authority is not a URL"
        );
    }

    #[test]
    fn test_provider_error_display_with_description() {
        let error = OidcError::Provider {
            error: "access_denied".to_string(),
            description: Some("user cancelled".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Provider returned error 'access_denied': user cancelled"
        );
    }

    #[test]
    fn test_provider_error_display_without_description() {
        let error = OidcError::Provider {
            error: "login_required".to_string(),
            description: None,
        };
        assert_eq!(error.to_string(), "Provider returned error 'login_required'");
    }

    #[test]
    fn test_renewal_timeout_display() {
        let error = OidcError::RenewalTimeout(1500);
        assert_eq!(error.to_string(), "Silent renewal timed out after 1500 ms");
    }

    #[test]
    fn test_outcomes() {
        assert_eq!(OidcError::StateMismatch.outcome(), AuthOutcome::Unauthorized);
        assert_eq!(OidcError::NonceMismatch.outcome(), AuthOutcome::Unauthorized);
        assert_eq!(
            OidcError::TokenValidation("bad aud".into()).outcome(),
            AuthOutcome::Unauthorized
        );
        assert_eq!(
            OidcError::RenewalFailure("login_required".into()).outcome(),
            AuthOutcome::RedirectToLogin
        );
        assert_eq!(
            OidcError::StorageCorruption("eof".into()).outcome(),
            AuthOutcome::SilentRetry
        );
    }

    #[test]
    fn test_kind_of_recovers_typed_error() {
        let err: anyhow::Error = OidcError::NonceMismatch.into();
        assert!(matches!(kind_of(&err), Some(OidcError::NonceMismatch)));

        let other = anyhow::anyhow!("plain");
        assert!(kind_of(&other).is_none());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let error: OidcError = json_error.into();
        assert!(matches!(error, OidcError::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OidcError>();
    }
}
