use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oidc_session::auth::id_token::token_hash;
use oidc_session::config::{Config, OidcConfig, StoreBackend};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLIENT_ID: &str = "spa-client";

const SIGNING_KEY_PEM: &str = include_str!("../fixtures/rsa_private.pem");
const JWKS_JSON: &str = include_str!("../fixtures/jwks.json");

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Signs an identity token for `sub` with the fixture key.
#[allow(dead_code)]
pub fn sign_id_token(issuer: &str, sub: &str, nonce: Option<&str>, iat: DateTime<Utc>) -> String {
    sign(issuer, sub, nonce, None, iat)
}

/// Signs an identity token bound to `access_token` through `at_hash`, as an
/// implicit `id_token token` response carries it.
#[allow(dead_code)]
pub fn sign_implicit_id_token(
    issuer: &str,
    sub: &str,
    nonce: &str,
    access_token: &str,
    iat: DateTime<Utc>,
) -> String {
    sign(issuer, sub, Some(nonce), Some(access_token), iat)
}

fn sign(
    issuer: &str,
    sub: &str,
    nonce: Option<&str>,
    access_token: Option<&str>,
    iat: DateTime<Utc>,
) -> String {
    let mut claims = json!({
        "iss": issuer,
        "sub": sub,
        "aud": CLIENT_ID,
        "iat": iat.timestamp(),
        "exp": iat.timestamp() + 3600,
        "name": "Alice Example",
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    if let Some(access_token) = access_token {
        claims["at_hash"] = json!(token_hash(Algorithm::RS256, access_token));
    }
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key-1".to_string());
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY_PEM.as_bytes()).expect("fixture key");
    jsonwebtoken::encode(&header, &claims, &key).expect("token signs")
}

#[allow(dead_code)]
pub fn metadata_json(issuer: &str) -> serde_json::Value {
    json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/connect/authorize"),
        "token_endpoint": format!("{issuer}/connect/token"),
        "jwks_uri": format!("{issuer}/.well-known/jwks"),
        "end_session_endpoint": format!("{issuer}/connect/endsession"),
        "response_types_supported": ["code", "id_token token"],
        "code_challenge_methods_supported": ["S256"],
    })
}

/// Serves the discovery document and key set for `server`.
#[allow(dead_code)]
pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata_json(&server.uri())))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_string(JWKS_JSON))
        .mount(server)
        .await;
}

/// Authorization code client against `issuer` with no silent navigator.
#[allow(dead_code)]
pub fn code_flow_config(issuer: &str, store_dir: Option<&Path>) -> OidcConfig {
    let mut config = Config::default().oidc;
    config.authority = issuer.to_string();
    config.client_id = CLIENT_ID.to_string();
    config.redirect_uri = "https://app.example.com/callback".to_string();
    config.response_type = "code".to_string();
    config.scope = "openid profile offline_access api1".to_string();
    config.silent_redirect_uri = None;
    config.post_logout_redirect_uri = Some("https://app.example.com/signed-out".to_string());
    config.access_token_expiring_notification_time = 60;
    match store_dir {
        Some(dir) => {
            config.user_store.backend = StoreBackend::File;
            config.user_store.path = Some(dir.to_path_buf());
        }
        None => config.user_store.backend = StoreBackend::Memory,
    }
    config
}

/// Config file for the CLI with a memory store and static metadata.
#[allow(dead_code)]
pub fn cli_config_yaml(store: &str, store_dir: Option<&Path>) -> String {
    let path_line = store_dir
        .map(|dir| format!("\n    path: {}", dir.display()))
        .unwrap_or_default();
    format!(
        r#"oidc:
  authority: https://idp.example.com
  client_id: {CLIENT_ID}
  redirect_uri: https://app.example.com/callback
  response_type: id_token token
  scope: openid profile api1
  post_logout_redirect_uri: https://app.example.com/signed-out
  user_store:
    backend: {store}{path_line}
  metadata:
    issuer: https://idp.example.com
    authorization_endpoint: https://idp.example.com/connect/authorize
    token_endpoint: https://idp.example.com/connect/token
    jwks_uri: https://idp.example.com/.well-known/jwks
    end_session_endpoint: https://idp.example.com/connect/endsession
api:
  protected:
    - https://api.example.com
routes:
  login_route: /login
logging:
  level: warn
"#
    )
}
