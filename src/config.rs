//! Configuration management for oidc-session
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! Malformed values surface as [`OidcError::Configuration`] at startup.

use crate::auth::discovery::ProviderMetadata;
use crate::error::{OidcError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Main configuration structure
///
/// Holds the OIDC client settings plus the settings consumed by the route
/// guard, the request decorator and the logging setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity provider and client settings
    pub oidc: OidcConfig,
    /// Protected API settings used by the request decorator
    #[serde(default)]
    pub api: ApiConfig,
    /// Route table settings used by the authorization guard
    #[serde(default)]
    pub routes: RouteConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenID Connect client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Issuer base URL of the identity provider
    pub authority: String,

    /// Client identifier registered with the provider
    pub client_id: String,

    /// Where the provider sends the browser after interactive login
    pub redirect_uri: String,

    /// OAuth `response_type`, e.g. `"id_token token"` or `"code"`
    #[serde(default = "default_response_type")]
    pub response_type: String,

    /// Space-separated scopes; must contain `openid`
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Where the provider sends the browser after logout
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    /// Redirect target for the non-interactive renewal round trip
    #[serde(default)]
    pub silent_redirect_uri: Option<String>,

    /// Safety margin in seconds: renewal fires this long before expiry
    #[serde(default = "default_expiring_notification_time")]
    pub access_token_expiring_notification_time: u64,

    /// Renew tokens in the background before they expire
    #[serde(default = "default_automatic_silent_renew")]
    pub automatic_silent_renew: bool,

    /// Upper bound in seconds for one silent renewal attempt
    #[serde(default = "default_silent_request_timeout")]
    pub silent_request_timeout: u64,

    /// Allowed clock skew in seconds when validating token timestamps
    #[serde(default = "default_clock_skew")]
    pub clock_skew: u64,

    /// Seconds after which a pending login attempt is considered abandoned
    #[serde(default = "default_stale_state_age")]
    pub stale_state_age: u64,

    /// Token Store backend selection
    #[serde(default)]
    pub user_store: UserStoreConfig,

    /// Static provider metadata; skips discovery when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProviderMetadata>,
}

fn default_response_type() -> String {
    "id_token token".to_string()
}

fn default_scope() -> String {
    "openid profile".to_string()
}

fn default_expiring_notification_time() -> u64 {
    10
}

fn default_automatic_silent_renew() -> bool {
    true
}

fn default_silent_request_timeout() -> u64 {
    10
}

fn default_clock_skew() -> u64 {
    300
}

fn default_stale_state_age() -> u64 {
    300
}

/// Token Store backend
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process memory; nothing survives a restart
    Memory,
    /// One file per key under a data directory
    #[default]
    File,
    /// OS native credential store
    Keyring,
}

impl std::str::FromStr for StoreBackend {
    type Err = OidcError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            other => Err(OidcError::Configuration(format!(
                "Invalid user_store backend: {other}. Must be one of: memory, file, keyring"
            ))),
        }
    }
}

/// Token Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserStoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the file backend; defaults to the platform data dir
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Protected API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Base URLs (origin plus optional path prefix) that receive bearer tokens
    #[serde(default)]
    pub protected: Vec<String>,
}

/// Route table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Glob patterns of paths that require an authenticated session
    #[serde(default = "default_protected_routes")]
    pub protected: Vec<String>,

    /// Login-initiation view; when unset the guard starts login directly
    #[serde(default)]
    pub login_route: Option<String>,

    /// View shown after unrecoverable authentication failures
    #[serde(default = "default_unauthorized_route")]
    pub unauthorized_route: String,

    /// Where to land after login when no path was preserved
    #[serde(default = "default_route")]
    pub default_route: String,
}

fn default_protected_routes() -> Vec<String> {
    vec!["/protected".to_string(), "/protected/**".to_string()]
}

fn default_unauthorized_route() -> String {
    "/unauthorized".to_string()
}

fn default_route() -> String {
    "/".to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            protected: default_protected_routes(),
            login_route: None,
            unauthorized_route: default_unauthorized_route(),
            default_route: default_route(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Optional file receiving a copy of the log output
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_path: None,
        }
    }
}

/// Parsed form of the `response_type` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseType {
    /// Authorization code is returned
    pub code: bool,
    /// Identity token is returned directly
    pub id_token: bool,
    /// Access token is returned directly
    pub token: bool,
}

impl ResponseType {
    /// Parses a space-separated `response_type` value.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] for unknown components or for
    /// combinations that do not yield both an identity and an access token
    /// (directly or through the code exchange).
    ///
    /// # Examples
    ///
    /// ```
    /// use oidc_session::config::ResponseType;
    ///
    /// let rt = ResponseType::parse("id_token token").unwrap();
    /// assert!(rt.id_token && rt.token && !rt.code);
    /// assert!(ResponseType::parse("token").is_err());
    /// assert!(ResponseType::parse("id_token").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        let mut rt = Self {
            code: false,
            id_token: false,
            token: false,
        };
        for part in value.split_whitespace() {
            match part {
                "code" => rt.code = true,
                "id_token" => rt.id_token = true,
                "token" => rt.token = true,
                other => {
                    return Err(OidcError::Configuration(format!(
                        "Invalid response_type component: {other}"
                    ))
                    .into())
                }
            }
        }
        if !rt.code && !rt.id_token {
            return Err(OidcError::Configuration(format!(
                "response_type '{value}' does not yield an identity token"
            ))
            .into());
        }
        if !rt.code && !rt.token {
            return Err(OidcError::Configuration(format!(
                "response_type '{value}' does not yield an access token"
            ))
            .into());
        }
        Ok(rt)
    }

    /// Whether responses arrive in the URL fragment (any implicit part).
    pub fn uses_fragment(&self) -> bool {
        self.id_token || self.token
    }
}

impl OidcConfig {
    /// Issuer base URL.
    pub fn authority_url(&self) -> Result<Url> {
        parse_url("authority", &self.authority)
    }

    /// Interactive login redirect target.
    pub fn redirect_url(&self) -> Result<Url> {
        parse_url("redirect_uri", &self.redirect_uri)
    }

    /// Parsed response type.
    pub fn response_kind(&self) -> Result<ResponseType> {
        ResponseType::parse(&self.response_type)
    }

    /// Safety margin before expiry at which renewal fires.
    pub fn expiring_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.access_token_expiring_notification_time).unwrap_or(i64::MAX),
        )
    }

    /// Upper bound of one silent renewal attempt.
    pub fn silent_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.silent_request_timeout)
    }

    /// Whether the configured scopes request a refresh token.
    pub fn requests_offline_access(&self) -> bool {
        self.scope.split_whitespace().any(|s| s == "offline_access")
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| OidcError::Configuration(format!("{field} is not a valid URL ({value}): {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        "http" => Err(OidcError::Configuration(format!(
            "{field} must use https unless it points at localhost: {value}"
        ))
        .into()),
        other => Err(OidcError::Configuration(format!(
            "{field} has unsupported scheme '{other}': {value}"
        ))
        .into()),
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
    )
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default_config()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn default_config() -> Self {
        Self {
            oidc: OidcConfig {
                authority: "https://ng-oidc-client.azurewebsites.net".to_string(),
                client_id: "ng-oidc-client-identity".to_string(),
                redirect_uri: "https://ng-oidc-client.stackblitz.io/callback.html".to_string(),
                response_type: default_response_type(),
                scope: "openid profile offline_access api1".to_string(),
                post_logout_redirect_uri: Some(
                    "https://ng-oidc-client.stackblitz.io/signout-callback.html".to_string(),
                ),
                silent_redirect_uri: Some(
                    "https://ng-oidc-client.stackblitz.io/renew-callback.html".to_string(),
                ),
                access_token_expiring_notification_time: default_expiring_notification_time(),
                automatic_silent_renew: default_automatic_silent_renew(),
                silent_request_timeout: default_silent_request_timeout(),
                clock_skew: default_clock_skew(),
                stale_state_age: default_stale_state_age(),
                user_store: UserStoreConfig::default(),
                metadata: None,
            },
            api: ApiConfig {
                protected: vec!["https://ng-oidc-client.azurewebsites.net".to_string()],
            },
            routes: RouteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OidcError::Configuration(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parses configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| OidcError::Configuration(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(authority) = std::env::var("OIDC_SESSION_AUTHORITY") {
            self.oidc.authority = authority;
        }

        if let Ok(client_id) = std::env::var("OIDC_SESSION_CLIENT_ID") {
            self.oidc.client_id = client_id;
        }

        if let Ok(redirect_uri) = std::env::var("OIDC_SESSION_REDIRECT_URI") {
            self.oidc.redirect_uri = redirect_uri;
        }

        if let Ok(response_type) = std::env::var("OIDC_SESSION_RESPONSE_TYPE") {
            self.oidc.response_type = response_type;
        }

        if let Ok(scope) = std::env::var("OIDC_SESSION_SCOPE") {
            self.oidc.scope = scope;
        }

        if let Ok(margin) = std::env::var("OIDC_SESSION_EXPIRING_NOTIFICATION_TIME") {
            if let Ok(value) = margin.parse() {
                self.oidc.access_token_expiring_notification_time = value;
            } else {
                tracing::warn!("Invalid OIDC_SESSION_EXPIRING_NOTIFICATION_TIME: {}", margin);
            }
        }

        if let Ok(renew) = std::env::var("OIDC_SESSION_AUTOMATIC_SILENT_RENEW") {
            if let Ok(value) = renew.parse() {
                self.oidc.automatic_silent_renew = value;
            } else {
                tracing::warn!("Invalid OIDC_SESSION_AUTOMATIC_SILENT_RENEW: {}", renew);
            }
        }

        if let Ok(backend) = std::env::var("OIDC_SESSION_STORE") {
            match backend.parse() {
                Ok(value) => self.oidc.user_store.backend = value,
                Err(e) => tracing::warn!("Invalid OIDC_SESSION_STORE: {}", e),
            }
        }

        if let Ok(store_path) = std::env::var("OIDC_SESSION_STORE_PATH") {
            self.oidc.user_store.path = Some(PathBuf::from(store_path));
        }

        if let Ok(level) = std::env::var("OIDC_SESSION_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if let Some(backend) = cli.store {
            self.oidc.user_store.backend = backend;
        }
        if let Some(path) = &cli.store_path {
            self.oidc.user_store.path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all URLs parse, the response type yields an identity token,
    /// and timing values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let oidc = &self.oidc;

        if oidc.authority.is_empty() {
            return Err(OidcError::Configuration("authority cannot be empty".to_string()).into());
        }
        oidc.authority_url()?;

        if oidc.client_id.is_empty() {
            return Err(OidcError::Configuration("client_id cannot be empty".to_string()).into());
        }

        oidc.redirect_url()?;
        if let Some(uri) = &oidc.post_logout_redirect_uri {
            parse_url("post_logout_redirect_uri", uri)?;
        }
        if let Some(uri) = &oidc.silent_redirect_uri {
            parse_url("silent_redirect_uri", uri)?;
        }

        oidc.response_kind()?;

        if !oidc.scope.split_whitespace().any(|s| s == "openid") {
            return Err(
                OidcError::Configuration("scope must include 'openid'".to_string()).into(),
            );
        }

        if oidc.access_token_expiring_notification_time == 0 {
            return Err(OidcError::Configuration(
                "access_token_expiring_notification_time must be greater than 0".to_string(),
            )
            .into());
        }

        if oidc.silent_request_timeout == 0 {
            return Err(OidcError::Configuration(
                "silent_request_timeout must be greater than 0".to_string(),
            )
            .into());
        }

        if oidc.automatic_silent_renew
            && oidc.silent_redirect_uri.is_none()
            && !oidc.requests_offline_access()
        {
            tracing::warn!(
                "automatic_silent_renew is enabled but neither silent_redirect_uri nor offline_access is configured; renewals will fail"
            );
        }

        for api in &self.api.protected {
            let url = Url::parse(api).map_err(|e| {
                OidcError::Configuration(format!("api.protected entry is not a URL ({api}): {e}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(OidcError::Configuration(format!(
                    "api.protected entry must be http(s): {api}"
                ))
                .into());
            }
        }

        for pattern in &self.routes.protected {
            if !pattern.starts_with('/') {
                return Err(OidcError::Configuration(format!(
                    "routes.protected pattern must start with '/': {pattern}"
                ))
                .into());
            }
        }

        if !self.routes.unauthorized_route.starts_with('/') {
            return Err(OidcError::Configuration(
                "routes.unauthorized_route must start with '/'".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
