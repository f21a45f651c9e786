//! Identity token validation
//!
//! Validates an OpenID Connect identity token (compact JWS) in a fixed
//! order:
//!
//! 1. Signature against the provider's JWKS key.
//! 2. `iss` equals the provider issuer, `aud` contains the client id (and
//!    `azp` names the client when several audiences are present).
//! 3. `exp` and `iat` against the injected clock, allowing `clock_skew`.
//! 4. `nonce` equals the value bound to the login attempt.
//! 5. `at_hash`, when present, matches the access token.
//!
//! Time checks are performed here rather than by `jsonwebtoken` so that they
//! use the same clock as the renewal timer.

use std::collections::HashMap;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{OidcError, Result};

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// The `aud` claim, which may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "client"`
    One(String),
    /// `"aud": ["client", "api"]`
    Many(Vec<String>),
}

impl Audience {
    /// Whether `client_id` is one of the audiences.
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::One(aud) => aud == client_id,
            Self::Many(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }

    /// Number of audiences.
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(auds) => auds.len(),
        }
    }

    /// Whether the claim is an empty array.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Audiences as an owned list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(aud) => vec![aud.clone()],
            Self::Many(auds) => auds.clone(),
        }
    }
}

/// Claims of an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    pub sub: String,
    /// Audience.
    pub aud: Audience,
    /// Expiry (seconds since the epoch).
    pub exp: i64,
    /// Issued at (seconds since the epoch).
    pub iat: i64,
    /// Replay-protection value echoed from the authorization request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Left-half hash of the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    /// Authorized party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// Remaining claims.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl IdTokenClaims {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0).ok_or_else(|| {
            OidcError::TokenValidation(format!("exp claim out of range: {}", self.exp)).into()
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// What a token must satisfy to be accepted.
#[derive(Debug, Clone)]
pub struct Expectations<'a> {
    /// Issuer advertised by the provider.
    pub issuer: &'a str,
    /// This client's identifier.
    pub client_id: &'a str,
    /// Allowed clock skew in seconds.
    pub clock_skew: u64,
    /// Nonce bound to the attempt; `None` for refresh-token responses.
    pub nonce: Option<&'a str>,
    /// Access token issued alongside, for `at_hash` verification.
    pub access_token: Option<&'a str>,
    /// Reject a token without `at_hash`; set for implicit `id_token token`
    /// responses, where the claim binds the access token to the id token.
    pub require_at_hash: bool,
}

/// Returns the `kid` and algorithm from the token header.
///
/// # Errors
///
/// Returns [`OidcError::TokenValidation`] when the header cannot be decoded.
pub fn peek_header(token: &str) -> Result<(Option<String>, Algorithm)> {
    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| OidcError::TokenValidation(format!("malformed identity token: {e}")))?;
    Ok((header.kid, header.alg))
}

/// Validates `token` against `key` and `expected`, evaluated at `now`.
///
/// # Returns
///
/// The decoded claims on success.
///
/// # Errors
///
/// - [`OidcError::TokenValidation`] for signature, issuer, audience, time and
///   `at_hash` failures.
/// - [`OidcError::NonceMismatch`] when the nonce differs or is missing.
pub fn validate(
    token: &str,
    key: &Jwk,
    expected: &Expectations<'_>,
    now: DateTime<Utc>,
) -> Result<IdTokenClaims> {
    let (_, alg) = peek_header(token)?;

    let decoding_key = DecodingKey::from_jwk(key)
        .map_err(|e| OidcError::TokenValidation(format!("unusable signing key: {e}")))?;

    let mut validation = Validation::new(alg);
    validation.set_issuer(&[expected.issuer]);
    validation.set_audience(&[expected.client_id]);
    validation.set_required_spec_claims(&["iss", "aud", "sub", "exp"]);
    validation.validate_exp = false;
    validation.validate_nbf = false;

    let data = jsonwebtoken::decode::<IdTokenClaims>(token, &decoding_key, &validation)
        .map_err(|e| OidcError::TokenValidation(e.to_string()))?;
    let claims = data.claims;

    if claims.aud.len() > 1 && claims.azp.as_deref() != Some(expected.client_id) {
        return Err(OidcError::TokenValidation(
            "azp must name this client when several audiences are present".to_string(),
        )
        .into());
    }

    let skew = i64::try_from(expected.clock_skew).unwrap_or(i64::MAX);
    let now_secs = now.timestamp();
    if claims.exp.saturating_add(skew) <= now_secs {
        return Err(OidcError::TokenValidation("identity token has expired".to_string()).into());
    }
    if claims.iat.saturating_sub(skew) > now_secs {
        return Err(
            OidcError::TokenValidation("identity token issued in the future".to_string()).into(),
        );
    }

    if let Some(nonce) = expected.nonce {
        if claims.nonce.as_deref() != Some(nonce) {
            return Err(OidcError::NonceMismatch.into());
        }
    }

    if expected.require_at_hash && claims.at_hash.is_none() {
        return Err(OidcError::TokenValidation(
            "at_hash is required when an access token is issued with the identity token"
                .to_string(),
        )
        .into());
    }

    if let (Some(at_hash), Some(access_token)) = (claims.at_hash.as_deref(), expected.access_token)
    {
        let computed = token_hash(alg, access_token);
        if computed != at_hash {
            return Err(OidcError::TokenValidation("at_hash does not match".to_string()).into());
        }
    }

    Ok(claims)
}

/// Computes the OIDC `at_hash` / `c_hash` value for `value`: the left half
/// of the hash matching the signing algorithm, base64url-encoded.
pub fn token_hash(alg: Algorithm, value: &str) -> String {
    let digest: Vec<u8> = match alg {
        Algorithm::HS384 | Algorithm::RS384 | Algorithm::PS384 | Algorithm::ES384 => {
            Sha384::digest(value.as_bytes()).to_vec()
        }
        Algorithm::HS512 | Algorithm::RS512 | Algorithm::PS512 => {
            Sha512::digest(value.as_bytes()).to_vec()
        }
        _ => Sha256::digest(value.as_bytes()).to_vec(),
    };
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use crate::test_utils::{signing_jwk, IdTokenBuilder, TEST_CLIENT_ID, TEST_ISSUER};
    use chrono::Duration;

    fn expectations<'a>(nonce: Option<&'a str>, access: Option<&'a str>) -> Expectations<'a> {
        Expectations {
            issuer: TEST_ISSUER,
            client_id: TEST_CLIENT_ID,
            clock_skew: 0,
            nonce,
            access_token: access,
            require_at_hash: false,
        }
    }

    #[test]
    fn test_valid_token_is_accepted() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).nonce("n-1").at_hash_for("at").sign();
        let claims = validate(
            &token,
            &signing_jwk(),
            &expectations(Some("n-1"), Some("at")),
            now,
        )
        .unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.aud.contains(TEST_CLIENT_ID));
    }

    #[test]
    fn test_wrong_issuer_is_rejected() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).issuer("https://evil.example.com").sign();
        let err = validate(&token, &signing_jwk(), &expectations(None, None), now).unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::TokenValidation(_))));
    }

    #[test]
    fn test_wrong_audience_is_rejected() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).audience("someone-else").sign();
        let err = validate(&token, &signing_jwk(), &expectations(None, None), now).unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::TokenValidation(_))));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).sign();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_payload = IdTokenBuilder::new(now).subject("mallory").sign();
        let forged: Vec<&str> = forged_payload.split('.').collect();
        parts[1] = forged[1];
        let tampered = parts.join(".");

        let err =
            validate(&tampered, &signing_jwk(), &expectations(None, None), now).unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::TokenValidation(_))));
    }

    #[test]
    fn test_expired_token_is_rejected_using_supplied_clock() {
        let issued = Utc::now() - Duration::hours(3);
        let token = IdTokenBuilder::new(issued).lifetime_secs(3600).sign();
        let err = validate(
            &token,
            &signing_jwk(),
            &expectations(None, None),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_clock_skew_tolerates_slightly_expired_token() {
        let issued = Utc::now() - Duration::seconds(3630);
        let token = IdTokenBuilder::new(issued).lifetime_secs(3600).sign();
        let mut expected = expectations(None, None);
        expected.clock_skew = 60;
        assert!(validate(&token, &signing_jwk(), &expected, Utc::now()).is_ok());
    }

    #[test]
    fn test_future_iat_is_rejected() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now + Duration::hours(1)).sign();
        let err = validate(&token, &signing_jwk(), &expectations(None, None), now).unwrap_err();
        assert!(err.to_string().contains("future"));
    }

    #[test]
    fn test_nonce_mismatch() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).nonce("other").sign();
        let err = validate(
            &token,
            &signing_jwk(),
            &expectations(Some("expected"), None),
            now,
        )
        .unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::NonceMismatch)));
    }

    #[test]
    fn test_missing_nonce_is_a_mismatch() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).sign();
        let err = validate(
            &token,
            &signing_jwk(),
            &expectations(Some("expected"), None),
            now,
        )
        .unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::NonceMismatch)));
    }

    #[test]
    fn test_at_hash_mismatch() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).at_hash_for("real-token").sign();
        let err = validate(
            &token,
            &signing_jwk(),
            &expectations(None, Some("other-token")),
            now,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at_hash"));
    }

    #[test]
    fn test_missing_at_hash_rejected_when_required() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now).nonce("n-1").sign();
        let mut expected = expectations(Some("n-1"), Some("at"));
        assert!(validate(&token, &signing_jwk(), &expected, now).is_ok());

        expected.require_at_hash = true;
        let err = validate(&token, &signing_jwk(), &expected, now).unwrap_err();
        assert!(matches!(kind_of(&err), Some(OidcError::TokenValidation(_))));
        assert!(err.to_string().contains("at_hash is required"));

        let bound = IdTokenBuilder::new(now).nonce("n-1").at_hash_for("at").sign();
        assert!(validate(&bound, &signing_jwk(), &expected, now).is_ok());
    }

    #[test]
    fn test_multiple_audiences_require_azp() {
        let now = Utc::now();
        let token = IdTokenBuilder::new(now)
            .audiences(&[TEST_CLIENT_ID, "api1"])
            .sign();
        assert!(validate(&token, &signing_jwk(), &expectations(None, None), now).is_err());

        let token = IdTokenBuilder::new(now)
            .audiences(&[TEST_CLIENT_ID, "api1"])
            .authorized_party(TEST_CLIENT_ID)
            .sign();
        assert!(validate(&token, &signing_jwk(), &expectations(None, None), now).is_ok());
    }

    #[test]
    fn test_peek_header_reads_kid() {
        let token = IdTokenBuilder::new(Utc::now()).sign();
        let (kid, alg) = peek_header(&token).unwrap();
        assert_eq!(kid.as_deref(), Some("test-key-1"));
        assert_eq!(alg, Algorithm::RS256);
        assert!(peek_header("not-a-jwt").is_err());
    }

    #[test]
    fn test_token_hash_known_length() {
        // SHA-256 left half is 16 bytes -> 22 base64url characters.
        assert_eq!(token_hash(Algorithm::RS256, "access").len(), 22);
        // SHA-384 left half is 24 bytes -> 32 characters.
        assert_eq!(token_hash(Algorithm::RS384, "access").len(), 32);
    }

    #[test]
    fn test_audience_deserializes_both_forms() {
        let one: Audience = serde_json::from_str("\"spa\"").unwrap();
        let many: Audience = serde_json::from_str("[\"spa\",\"api\"]").unwrap();
        assert!(one.contains("spa"));
        assert_eq!(many.len(), 2);
        assert_eq!(many.to_vec(), vec!["spa".to_string(), "api".to_string()]);
    }
}
