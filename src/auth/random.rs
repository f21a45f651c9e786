//! Per-attempt random values: `state`, `nonce` and the PKCE S256 pair
//!
//! Every login or silent renewal attempt is bound to fresh, unpredictable
//! correlation values. `state` protects the callback against cross-site
//! request forgery, `nonce` ties the identity token to this attempt, and
//! the PKCE verifier (RFC 7636) binds an authorization code to the client
//! that requested it.

use base64::Engine as _;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

/// Number of random bytes behind every generated value.
const RANDOM_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Correlation values
// ---------------------------------------------------------------------------

/// Returns 32 cryptographically random bytes encoded as base64url without
/// padding (43 characters).
///
/// # Examples
///
/// ```
/// use oidc_session::auth::random::random_token;
///
/// let state = random_token();
/// assert_eq!(state.len(), 43);
/// assert_ne!(state, random_token());
/// ```
pub fn random_token() -> String {
    let mut bytes = [0u8; RANDOM_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// PKCE
// ---------------------------------------------------------------------------

/// A PKCE S256 verifier and its derived challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    /// Sent to the token endpoint as `code_verifier`.
    pub verifier: String,
    /// Sent to the authorization endpoint as `code_challenge`.
    pub challenge: String,
}

impl PkcePair {
    /// Generates a fresh verifier and computes its S256 challenge.
    ///
    /// # Examples
    ///
    /// ```
    /// use oidc_session::auth::random::PkcePair;
    ///
    /// let pkce = PkcePair::generate();
    /// assert_eq!(pkce.verifier.len(), 43);
    /// assert_eq!(pkce.challenge.len(), 43);
    /// ```
    pub fn generate() -> Self {
        let verifier = random_token();
        let challenge = s256_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// The challenge method sent alongside the challenge.
    pub fn method(&self) -> &'static str {
        "S256"
    }
}

/// Computes `BASE64URL(SHA256(ASCII(verifier)))`.
pub fn s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}
