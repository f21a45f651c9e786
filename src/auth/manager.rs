//! Session lifecycle manager
//!
//! [`SessionManager`] is the single source of truth for authentication
//! state. It drives the two-phase login protocol, keeps the session in the
//! [`TokenStore`], and renews tokens in the background before they expire.
//!
//! - [`SessionManager::initiate_login`] persists fresh correlation values and
//!   redirects to the provider.
//! - [`SessionManager::handle_callback`] validates the provider's response
//!   against them and establishes the session.
//! - [`SessionManager::schedule_renewal`] arms the renewal timer at
//!   `expires_at - access_token_expiring_notification_time`.
//! - [`SessionManager::signin_silent`] performs one renewal attempt with the
//!   refresh token or through a `prompt=none` round trip.
//! - [`SessionManager::logout`] clears everything locally, then redirects to
//!   the provider's end-session endpoint.
//!
//! # Concurrency
//!
//! State lives in a `tokio::sync::watch` channel, so [`get_session`] and
//! [`is_authenticated`] are synchronous and never block on I/O. Login,
//! callback and renewal attempts are serialised by one async mutex; a renewal
//! triggered while another attempt is in flight joins it instead of starting
//! a second one. Every login, logout and renewal completion bumps the
//! snapshot's generation, and results computed for an older generation are
//! discarded.
//!
//! [`get_session`]: SessionManager::get_session
//! [`is_authenticated`]: SessionManager::is_authenticated

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use tokio::sync::{broadcast, watch, Mutex};
use url::Url;
use uuid::Uuid;

use crate::auth::callback::CallbackParams;
use crate::auth::clock::{Clock, SystemClock};
use crate::auth::discovery::{Discovery, ProviderMetadata};
use crate::auth::flow::{AuthorizeRequest, OidcClient};
use crate::auth::id_token::{self, Expectations, IdTokenClaims};
use crate::auth::navigator::{BrowserNavigator, HttpSilentNavigator, Navigator, SilentNavigator};
use crate::auth::random::{random_token, PkcePair};
use crate::auth::session::{
    PendingLogin, Session, SessionEvent, SessionSnapshot, SessionState, UserProfile,
};
use crate::auth::timer::RenewalTimer;
use crate::auth::token_store::TokenStore;
use crate::config::OidcConfig;
use crate::error::{kind_of, OidcError, Result};

const EVENT_CAPACITY: usize = 32;

/// Shortest wait before an automatic renewal.
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a successful callback.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    /// The established session.
    pub session: Arc<Session>,
    /// Application path preserved by `initiate_login`.
    pub return_to: Option<String>,
}

/// Tokens issued by one authorization or token endpoint response.
struct IssuedTokens {
    id_token: String,
    access_token: String,
    token_type: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
    session_state: Option<String>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`SessionManager`].
///
/// Every collaborator has a production default derived from the
/// configuration; tests replace them.
pub struct SessionManagerBuilder {
    config: OidcConfig,
    http: Option<reqwest::Client>,
    store: Option<TokenStore>,
    discovery: Option<Discovery>,
    navigator: Option<Arc<dyn Navigator>>,
    silent_navigator: Option<Arc<dyn SilentNavigator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SessionManagerBuilder {
    /// HTTP client for discovery and token requests.
    pub fn http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Token Store; defaults to the configured `user_store` backend.
    pub fn store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Provider discovery; defaults to fetching from the authority, or the
    /// configured static metadata.
    pub fn discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Full-page navigation; defaults to [`BrowserNavigator`].
    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Silent renewal round trip; defaults to [`HttpSilentNavigator`] when a
    /// `silent_redirect_uri` is configured.
    pub fn silent_navigator(mut self, navigator: Arc<dyn SilentNavigator>) -> Self {
        self.silent_navigator = Some(navigator);
        self
    }

    /// Clock; defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the manager.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] for malformed URIs or response
    /// type, and storage errors from the default Token Store.
    pub fn build(self) -> Result<Arc<SessionManager>> {
        let config = self.config;
        let authority = config.authority_url()?;
        let redirect_uri = config.redirect_url()?;
        let silent_redirect_uri = config
            .silent_redirect_uri
            .as_deref()
            .map(|uri| {
                Url::parse(uri).map_err(|e| {
                    OidcError::Configuration(format!("invalid silent_redirect_uri: {e}"))
                })
            })
            .transpose()?;

        let http = self.http.unwrap_or_default();
        let client = OidcClient::from_config(http.clone(), &config)?;

        let discovery = match self.discovery {
            Some(discovery) => discovery,
            None => {
                let discovery = Discovery::new(http, authority);
                match config.metadata.clone() {
                    Some(metadata) => discovery.with_metadata(metadata),
                    None => discovery,
                }
            }
        };

        let store = match self.store {
            Some(store) => store,
            None => TokenStore::from_config(&config)?,
        };

        let silent_navigator = match (self.silent_navigator, &silent_redirect_uri) {
            (Some(navigator), _) => Some(navigator),
            (None, Some(uri)) => {
                Some(Arc::new(HttpSilentNavigator::new(uri.clone())?) as Arc<dyn SilentNavigator>)
            }
            (None, None) => None,
        };

        let navigator = self
            .navigator
            .unwrap_or_else(|| Arc::new(BrowserNavigator::default()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (state, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new_cyclic(|this| SessionManager {
            config,
            redirect_uri,
            silent_redirect_uri,
            client,
            discovery,
            store,
            navigator,
            silent_navigator,
            clock,
            state,
            events,
            attempt: Mutex::new(()),
            timer: RenewalTimer::new(),
            this: this.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns the authentication state machine for one client context.
///
/// Created once at application start and shared as `Arc<SessionManager>`
/// with the route guard and request decorator.
///
/// # Examples
///
/// ```no_run
/// use oidc_session::auth::manager::SessionManager;
/// use oidc_session::config::Config;
///
/// # async fn example() -> oidc_session::error::Result<()> {
/// let config = Config::default();
/// let manager = SessionManager::builder(config.oidc).build()?;
/// manager.restore();
///
/// if !manager.is_authenticated() {
///     let url = manager.initiate_login(Some("/protected")).await?;
///     println!("login at {url}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct SessionManager {
    config: OidcConfig,
    redirect_uri: Url,
    silent_redirect_uri: Option<Url>,
    client: OidcClient,
    discovery: Discovery,
    store: TokenStore,
    navigator: Arc<dyn Navigator>,
    silent_navigator: Option<Arc<dyn SilentNavigator>>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    attempt: Mutex<()>,
    timer: RenewalTimer,
    this: Weak<SessionManager>,
}

impl SessionManager {
    /// Starts building a manager for `config`.
    pub fn builder(config: OidcConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            http: None,
            store: None,
            discovery: None,
            navigator: None,
            silent_navigator: None,
            clock: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Client configuration.
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// The Token Store.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Provider metadata, fetched on first use.
    pub async fn provider_metadata(&self) -> Result<Arc<ProviderMetadata>> {
        self.discovery.metadata().await
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribes to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Synchronous read of the in-memory state.
    pub fn get_session(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// `true` iff the state is `Authenticated` and `now < expires_at`.
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated_at(self.clock.now())
    }

    /// The current access token, only while authenticated.
    pub fn access_token(&self) -> Option<String> {
        let now = self.clock.now();
        let snapshot = self.state.borrow();
        if snapshot.is_authenticated_at(now) {
            snapshot.session.as_ref().map(|s| s.access_token.clone())
        } else {
            None
        }
    }

    /// Ticket of the armed renewal timer, if any.
    pub fn renewal_armed(&self) -> bool {
        self.timer.armed_ticket().is_some()
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Loads the persisted session at application start.
    ///
    /// - unexpired session: `Authenticated`, renewal armed
    /// - expired session: `Expired`; with automatic renewal and a refresh
    ///   token a background renewal is started, otherwise the store is
    ///   cleared
    /// - absent or corrupted: `Unauthenticated`
    pub fn restore(&self) -> SessionSnapshot {
        let now = self.clock.now();

        if let Some(pending) = self.store.load_pending() {
            if pending.is_stale(now, self.stale_state_age()) {
                tracing::debug!("Discarding stale pending login");
                self.log_store_error(self.store.clear_pending());
            }
        }

        match self.store.load() {
            None => {
                self.state.send_modify(|snap| {
                    *snap = SessionSnapshot {
                        generation: snap.generation + 1,
                        ..SessionSnapshot::default()
                    };
                });
            }
            Some(session) if !session.is_expired_at(now) => {
                let session = Arc::new(session);
                tracing::info!(session_id = %session.id, "Restored stored session");
                self.set_authenticated(Arc::clone(&session));
                self.emit(SessionEvent::UserLoaded {
                    session_id: session.id,
                });
                self.schedule_renewal();
            }
            Some(session) => {
                let renewable =
                    self.config.automatic_silent_renew && session.refresh_token.is_some();
                tracing::info!(session_id = %session.id, renewable, "Stored session has expired");
                if !renewable {
                    self.log_store_error(self.store.clear_session());
                }
                let retained = renewable.then(|| Arc::new(session));
                self.state.send_modify(|snap| {
                    *snap = SessionSnapshot {
                        state: SessionState::Expired,
                        session: retained,
                        generation: snap.generation + 1,
                        last_error: None,
                    };
                });
                self.emit(SessionEvent::AccessTokenExpired);
                if renewable {
                    self.spawn_background_renewal();
                }
            }
        }

        self.get_session()
    }

    fn spawn_background_renewal(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available; skipping background renewal");
            return;
        };
        let this = self.this.clone();
        handle.spawn(async move {
            if let Some(manager) = this.upgrade() {
                if let Err(e) = manager.signin_silent().await {
                    tracing::debug!(error = %e, "Background renewal failed");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Login
    // -----------------------------------------------------------------------

    /// Starts an interactive login.
    ///
    /// Generates `state`, `nonce` (and a PKCE pair for code-based response
    /// types), persists them as the pending login, moves to
    /// `Authenticating` and redirects through the [`Navigator`]. While a
    /// fresh pending login exists, further calls return its URL without
    /// redirecting again.
    ///
    /// # Arguments
    ///
    /// * `return_to` - Application path to resume after the callback.
    ///
    /// # Returns
    ///
    /// The authorization URL.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Configuration`] when the URL cannot be built,
    /// [`OidcError::Discovery`] when provider metadata is unavailable, and
    /// storage or navigation errors.
    pub async fn initiate_login(&self, return_to: Option<&str>) -> Result<Url> {
        let _attempt = self.attempt.lock().await;
        let now = self.clock.now();

        if let Some(pending) = self.store.load_pending() {
            if !pending.is_stale(now, self.stale_state_age()) {
                tracing::debug!("Login already in progress; reusing pending attempt");
                return Ok(pending.authorize_url);
            }
            tracing::debug!("Replacing stale pending login");
        }

        let metadata = self.discovery.metadata().await?;
        let state = random_token();
        let nonce = random_token();
        let pkce = self.client.response_kind().code.then(PkcePair::generate);

        let url = self.client.authorize_url(
            &metadata,
            &AuthorizeRequest {
                state: &state,
                nonce: &nonce,
                code_challenge: pkce.as_ref().map(|p| p.challenge.as_str()),
                redirect_uri: &self.redirect_uri,
                prompt: None,
                id_token_hint: None,
            },
        )?;

        let pending = PendingLogin {
            state,
            nonce,
            code_verifier: pkce.map(|p| p.verifier),
            redirect_uri: self.redirect_uri.clone(),
            return_to: return_to.map(str::to_string),
            authorize_url: url.clone(),
            created_at: now,
        };
        self.store.save_pending(&pending)?;

        self.timer.cancel();
        self.log_store_error(self.store.clear_session());
        self.state.send_modify(|snap| {
            *snap = SessionSnapshot {
                state: SessionState::Authenticating,
                session: None,
                generation: snap.generation + 1,
                last_error: None,
            };
        });

        increment_counter!("oidc_login_initiated_total");
        tracing::info!(return_to = ?pending.return_to, "Redirecting to identity provider");
        self.navigator.redirect(&url)?;
        Ok(url)
    }

    /// Completes a login from the provider's redirect.
    ///
    /// Validation order: `state` against the pending login, provider
    /// `error`, code exchange, identity token signature and claims, `nonce`,
    /// `at_hash`. The pending login is consumed either way.
    ///
    /// # Arguments
    ///
    /// * `input` - Callback URL, `#fragment`, `?query` or bare parameters.
    ///
    /// # Errors
    ///
    /// On failure nothing is persisted, the state becomes `Error`, a
    /// `LoginError` event is emitted and the typed error is returned
    /// ([`OidcError::StateMismatch`], [`OidcError::Provider`],
    /// [`OidcError::TokenValidation`], [`OidcError::NonceMismatch`], ...).
    /// The exception is a callback whose `state` matches no pending login
    /// while a session is authenticated: it fails with
    /// [`OidcError::StateMismatch`] and the session, store and renewal timer
    /// are left untouched.
    pub async fn handle_callback(&self, input: &str) -> Result<CallbackResult> {
        let _attempt = self.attempt.lock().await;
        let params = CallbackParams::parse(input);
        let now = self.clock.now();
        let pending = self
            .store
            .take_pending()
            .filter(|p| !p.is_stale(now, self.stale_state_age()));

        // An unsolicited callback must not tear down a live session.
        let solicited = pending
            .as_ref()
            .is_some_and(|p| params.state.as_deref() == Some(p.state.as_str()));
        if !solicited && self.is_authenticated() {
            increment_counter!("oidc_login_failure_total", "kind" => "state_mismatch");
            tracing::warn!("Ignoring unsolicited callback; session kept");
            return Err(OidcError::StateMismatch.into());
        }

        match self.complete_login(params, pending).await {
            Ok((session, return_to)) => {
                let session = Arc::new(session);
                self.set_authenticated(Arc::clone(&session));
                increment_counter!("oidc_login_success_total");
                tracing::info!(session_id = %session.id, "Login completed");
                self.emit(SessionEvent::UserLoaded {
                    session_id: session.id,
                });
                self.schedule_renewal();
                Ok(CallbackResult { session, return_to })
            }
            Err(e) => {
                self.timer.cancel();
                self.log_store_error(self.store.clear_session());
                let message = e.to_string();
                self.state.send_modify(|snap| {
                    *snap = SessionSnapshot {
                        state: SessionState::Error,
                        session: None,
                        generation: snap.generation + 1,
                        last_error: Some(message.clone()),
                    };
                });
                increment_counter!("oidc_login_failure_total", "kind" => error_label(&e));
                tracing::warn!(error = %message, "Login callback rejected");
                self.emit(SessionEvent::LoginError { message });
                Err(e)
            }
        }
    }

    async fn complete_login(
        &self,
        params: CallbackParams,
        pending: Option<PendingLogin>,
    ) -> Result<(Session, Option<String>)> {
        let pending = pending.ok_or(OidcError::StateMismatch)?;

        let session = self.session_from_response(params, &pending, None).await?;
        self.store.save(&session)?;
        Ok((session, pending.return_to))
    }

    /// Validates an authorization response bound to `pending` and builds the
    /// resulting session. `previous` is set for silent renewals.
    async fn session_from_response(
        &self,
        params: CallbackParams,
        pending: &PendingLogin,
        previous: Option<&Session>,
    ) -> Result<Session> {
        if params.state.as_deref() != Some(pending.state.as_str()) {
            return Err(OidcError::StateMismatch.into());
        }
        if let Some(error) = params.error {
            tracing::warn!(error = %error, "Identity provider returned an error");
            return Err(OidcError::Provider {
                error,
                description: params.error_description,
            }
            .into());
        }

        let metadata = self.discovery.metadata().await?;
        // Tokens from the authorization endpoint itself must be bound by at_hash.
        let front_channel_token = params.code.is_none() && self.client.response_kind().token;

        let (id_token, access_token, token_type, expires_in, refresh_token, scope) =
            match params.code.as_deref() {
                Some(code) => {
                    let tokens = self
                        .client
                        .exchange_code(
                            &metadata,
                            code,
                            pending.code_verifier.as_deref(),
                            &pending.redirect_uri,
                        )
                        .await?;
                    (
                        tokens.id_token.or(params.id_token),
                        Some(tokens.access_token),
                        tokens.token_type,
                        tokens.expires_in,
                        tokens.refresh_token,
                        tokens.scope.or(params.scope),
                    )
                }
                None => (
                    params.id_token,
                    params.access_token,
                    params.token_type.unwrap_or_else(|| "Bearer".to_string()),
                    params.expires_in,
                    None,
                    params.scope,
                ),
            };

        let id_token = id_token.ok_or_else(|| {
            OidcError::TokenValidation("response carries no id_token".to_string())
        })?;
        let access_token = access_token.ok_or_else(|| {
            OidcError::TokenValidation("response carries no access_token".to_string())
        })?;

        let claims = self
            .validate_id_token(
                &metadata,
                &id_token,
                Some(&pending.nonce),
                Some(&access_token),
                front_channel_token,
            )
            .await?;
        if let Some(previous) = previous {
            ensure_same_subject(previous, &claims)?;
        }

        self.build_session(
            previous.map_or_else(Uuid::new_v4, |p| p.id),
            IssuedTokens {
                id_token,
                access_token,
                token_type,
                expires_in,
                refresh_token: refresh_token.or_else(|| previous.and_then(|p| p.refresh_token.clone())),
                scope,
                session_state: params.session_state,
            },
            &claims,
        )
    }

    async fn validate_id_token(
        &self,
        metadata: &ProviderMetadata,
        token: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
        require_at_hash: bool,
    ) -> Result<IdTokenClaims> {
        let (kid, _) = id_token::peek_header(token)?;
        let key = self.discovery.signing_key(kid.as_deref()).await?;
        id_token::validate(
            token,
            &key,
            &Expectations {
                issuer: &metadata.issuer,
                client_id: self.client.client_id(),
                clock_skew: self.config.clock_skew,
                nonce,
                access_token,
                require_at_hash,
            },
            self.clock.now(),
        )
    }

    /// `expires_at = min(now + expires_in, id_token.exp)`.
    fn build_session(
        &self,
        id: Uuid,
        tokens: IssuedTokens,
        claims: &IdTokenClaims,
    ) -> Result<Session> {
        let now = self.clock.now();
        let id_token_expiry = claims.expires_at()?;
        let expires_at = match tokens.expires_in {
            Some(secs) => (now + seconds(secs)).min(id_token_expiry),
            None => id_token_expiry,
        };
        if expires_at <= now {
            return Err(OidcError::TokenValidation("issued tokens are already expired".to_string()).into());
        }

        Ok(Session {
            id,
            identity_token: tokens.id_token,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            scope: tokens.scope,
            session_state: tokens.session_state,
            expires_at,
            profile: UserProfile::from_claims(claims),
        })
    }

    // -----------------------------------------------------------------------
    // Renewal
    // -----------------------------------------------------------------------

    /// Arms the single renewal timer for the current session.
    ///
    /// Fires at `expires_at - access_token_expiring_notification_time` and
    /// starts a silent renewal. When the token lives no longer than that
    /// margin it fires halfway through the remaining lifetime instead, and
    /// never sooner than [`MIN_RENEWAL_DELAY`]. With
    /// `automatic_silent_renew = false` it fires at `expires_at` and marks the
    /// session `Expired`. Re-arming cancels the
    /// previous timer. Without an authenticated session the timer is
    /// disarmed.
    pub fn schedule_renewal(&self) {
        let target = {
            let snapshot = self.state.borrow();
            match (snapshot.state, snapshot.session.as_ref()) {
                (SessionState::Authenticated, Some(session)) => {
                    Some((snapshot.generation, session.expires_at))
                }
                _ => None,
            }
        };
        let Some((generation, expires_at)) = target else {
            self.timer.cancel();
            return;
        };

        let left = expires_at - self.clock.now();
        let delay = if self.config.automatic_silent_renew {
            renewal_delay(left, self.config.expiring_margin())
        } else {
            left.to_std().unwrap_or(Duration::ZERO)
        };

        let this = self.this.clone();
        self.timer.arm(delay, move |ticket| async move {
            if let Some(manager) = this.upgrade() {
                manager.on_timer(ticket, generation).await;
            }
        });
    }

    async fn on_timer(&self, ticket: u64, generation: u64) {
        if !self.timer.claim(ticket) {
            tracing::trace!(ticket, "Ignoring superseded renewal timer");
            return;
        }
        let expires_at = {
            let snapshot = self.state.borrow();
            if snapshot.generation != generation {
                tracing::debug!(ticket, "Ignoring renewal timer for superseded session");
                return;
            }
            snapshot.session.as_ref().map(|s| s.expires_at)
        };

        if !self.config.automatic_silent_renew {
            self.expire(generation);
            return;
        }

        if let Some(expires_at) = expires_at {
            self.emit(SessionEvent::AccessTokenExpiring { expires_at });
        }
        if let Err(e) = self.signin_silent().await {
            tracing::debug!(error = %e, "Scheduled renewal failed");
        }
    }

    fn expire(&self, generation: u64) {
        let applied = self.state.send_if_modified(|snap| {
            if snap.generation != generation || snap.state != SessionState::Authenticated {
                return false;
            }
            self.log_store_error(self.store.clear_session());
            *snap = SessionSnapshot {
                state: SessionState::Expired,
                session: None,
                generation: generation + 1,
                last_error: Some("access token expired".to_string()),
            };
            true
        });
        if applied {
            tracing::info!("Session expired");
            self.emit(SessionEvent::AccessTokenExpired);
        }
    }

    /// Performs one silent renewal attempt now.
    ///
    /// Uses the refresh token when one is held, otherwise a `prompt=none`
    /// round trip through the [`SilentNavigator`]. The attempt is bounded by
    /// `silent_request_timeout` and, while the session is still valid, ends
    /// before `expires_at`. A call made while another attempt is in flight
    /// waits for it and reports its outcome.
    ///
    /// # Errors
    ///
    /// - [`OidcError::RenewalTimeout`] / [`OidcError::RenewalFailure`]: the
    ///   session becomes `Expired` and the store is cleared.
    /// - [`OidcError::StateMismatch`], [`OidcError::NonceMismatch`],
    ///   [`OidcError::TokenValidation`]: the session becomes `Error`.
    pub async fn signin_silent(&self) -> Result<()> {
        let _attempt = match self.attempt.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Attempt already in flight; joining");
                let _joined = self.attempt.lock().await;
                return self.joined_outcome();
            }
        };
        self.renew_locked().await
    }

    fn joined_outcome(&self) -> Result<()> {
        let snapshot = self.get_session();
        if snapshot.is_authenticated_at(self.clock.now()) {
            Ok(())
        } else {
            Err(OidcError::RenewalFailure(
                snapshot
                    .last_error
                    .unwrap_or_else(|| format!("session is {}", snapshot.state)),
            )
            .into())
        }
    }

    async fn renew_locked(&self) -> Result<()> {
        let current = {
            let snapshot = self.state.borrow();
            match (snapshot.state, snapshot.session.as_ref()) {
                (
                    SessionState::Authenticated | SessionState::Renewing | SessionState::Expired,
                    Some(session),
                ) => Some((snapshot.generation, Arc::clone(session))),
                _ => None,
            }
        };
        let Some((generation, session)) = current else {
            return Err(OidcError::RenewalFailure("no session to renew".to_string()).into());
        };

        let budget = self.renewal_budget(&session);
        self.state.send_if_modified(|snap| {
            if snap.generation == generation {
                snap.state = SessionState::Renewing;
                true
            } else {
                false
            }
        });

        increment_counter!("oidc_renewal_attempts_total");
        tracing::info!(
            session_id = %session.id,
            budget_ms = budget.as_millis() as u64,
            refresh_token = session.refresh_token.is_some(),
            "Starting silent renewal"
        );

        match tokio::time::timeout(budget, self.perform_renewal(&session)).await {
            Ok(Ok(renewed)) => {
                self.commit_renewal(generation, renewed);
                Ok(())
            }
            Ok(Err(e)) => {
                let protocol = matches!(
                    kind_of(&e),
                    Some(
                        OidcError::StateMismatch
                            | OidcError::NonceMismatch
                            | OidcError::TokenValidation(_)
                    )
                );
                let typed = matches!(
                    kind_of(&e),
                    Some(OidcError::RenewalFailure(_) | OidcError::RenewalTimeout(_))
                );
                let (state, err) = if protocol {
                    (SessionState::Error, e)
                } else if typed {
                    (SessionState::Expired, e)
                } else {
                    (
                        SessionState::Expired,
                        OidcError::RenewalFailure(e.to_string()).into(),
                    )
                };
                Err(self.fail_renewal(generation, state, err))
            }
            Err(_) => {
                let err = OidcError::RenewalTimeout(budget.as_millis() as u64).into();
                Err(self.fail_renewal(generation, SessionState::Expired, err))
            }
        }
    }

    /// `min(silent_request_timeout, time left - guard)`, where the guard is
    /// one second or half the time left, whichever is smaller. Already
    /// expired sessions get the full timeout.
    fn renewal_budget(&self, session: &Session) -> Duration {
        let timeout = self.config.silent_timeout();
        match session.expires_in(self.clock.now()).to_std() {
            Ok(left) if !left.is_zero() => {
                let guard = Duration::from_secs(1).min(left / 2);
                timeout.min(left - guard)
            }
            _ => timeout,
        }
    }

    async fn perform_renewal(&self, session: &Session) -> Result<Session> {
        let metadata = self.discovery.metadata().await?;

        if let Some(refresh_token) = session.refresh_token.as_deref() {
            tracing::debug!("Renewing with refresh token");
            let tokens = self.client.refresh(&metadata, refresh_token).await?;
            let refresh_token = tokens
                .refresh_token
                .clone()
                .or_else(|| session.refresh_token.clone());
            let scope = tokens.scope.clone().or_else(|| session.scope.clone());

            return match tokens.id_token {
                Some(id_token) => {
                    let claims = self
                        .validate_id_token(
                            &metadata,
                            &id_token,
                            None,
                            Some(&tokens.access_token),
                            false,
                        )
                        .await?;
                    ensure_same_subject(session, &claims)?;
                    self.build_session(
                        session.id,
                        IssuedTokens {
                            id_token,
                            access_token: tokens.access_token,
                            token_type: tokens.token_type,
                            expires_in: tokens.expires_in,
                            refresh_token,
                            scope,
                            session_state: session.session_state.clone(),
                        },
                        &claims,
                    )
                }
                None => {
                    let expires_in = tokens.expires_in.ok_or_else(|| {
                        OidcError::RenewalFailure(
                            "refresh response carries neither id_token nor expires_in".to_string(),
                        )
                    })?;
                    Ok(Session {
                        id: session.id,
                        identity_token: session.identity_token.clone(),
                        access_token: tokens.access_token,
                        refresh_token,
                        token_type: tokens.token_type,
                        scope,
                        session_state: session.session_state.clone(),
                        expires_at: self.clock.now() + seconds(expires_in),
                        profile: session.profile.clone(),
                    })
                }
            };
        }

        let navigator = self.silent_navigator.as_ref().ok_or_else(|| {
            OidcError::RenewalFailure(
                "no refresh token and no silent navigator configured".to_string(),
            )
        })?;
        let redirect_uri = self.silent_redirect_uri.clone().ok_or_else(|| {
            OidcError::RenewalFailure("silent_redirect_uri is not configured".to_string())
        })?;

        tracing::debug!("Renewing through prompt=none round trip");
        let state = random_token();
        let nonce = random_token();
        let pkce = self.client.response_kind().code.then(PkcePair::generate);
        let url = self.client.authorize_url(
            &metadata,
            &AuthorizeRequest {
                state: &state,
                nonce: &nonce,
                code_challenge: pkce.as_ref().map(|p| p.challenge.as_str()),
                redirect_uri: &redirect_uri,
                prompt: Some("none"),
                id_token_hint: Some(&session.identity_token),
            },
        )?;
        let pending = PendingLogin {
            state,
            nonce,
            code_verifier: pkce.map(|p| p.verifier),
            redirect_uri,
            return_to: None,
            authorize_url: url.clone(),
            created_at: self.clock.now(),
        };

        let callback = navigator.navigate(url).await?;
        let params = CallbackParams::parse(&callback);
        self.session_from_response(params, &pending, Some(session))
            .await
    }

    fn commit_renewal(&self, generation: u64, renewed: Session) {
        let session = Arc::new(renewed);
        let committed = self.state.send_if_modified(|snap| {
            if snap.generation != generation {
                return false;
            }
            self.log_store_error(self.store.save(&session));
            *snap = SessionSnapshot {
                state: SessionState::Authenticated,
                session: Some(Arc::clone(&session)),
                generation: generation + 1,
                last_error: None,
            };
            true
        });

        if !committed {
            increment_counter!("oidc_renewal_discarded_total");
            tracing::debug!("Discarding renewal result for superseded session");
            return;
        }

        increment_counter!("oidc_renewal_success_total");
        tracing::info!(session_id = %session.id, expires_at = %session.expires_at, "Silent renewal succeeded");
        self.emit(SessionEvent::UserLoaded {
            session_id: session.id,
        });
        self.schedule_renewal();
    }

    fn fail_renewal(
        &self,
        generation: u64,
        state: SessionState,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let message = err.to_string();
        let applied = self.state.send_if_modified(|snap| {
            if snap.generation != generation {
                return false;
            }
            self.log_store_error(self.store.clear_session());
            *snap = SessionSnapshot {
                state,
                session: None,
                generation: generation + 1,
                last_error: Some(message.clone()),
            };
            true
        });

        if applied {
            self.timer.cancel();
            increment_counter!("oidc_renewal_failure_total", "kind" => error_label(&err));
            tracing::warn!(error = %message, state = %state, "Silent renewal failed");
            self.emit(SessionEvent::SilentRenewError { message });
        } else {
            tracing::debug!("Discarding renewal failure for superseded session");
        }
        err
    }

    /// Waits until no renewal is in flight.
    pub async fn wait_for_renewal(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|snapshot| snapshot.state != SessionState::Renewing)
            .await;
    }

    /// Out-of-band renewal after the protected API answered `401`.
    ///
    /// Returns `true` when the session is authenticated afterwards.
    pub async fn handle_unauthorized(&self) -> bool {
        let renewable = {
            let snapshot = self.state.borrow();
            snapshot.session.is_some()
                && matches!(
                    snapshot.state,
                    SessionState::Authenticated | SessionState::Renewing | SessionState::Expired
                )
        };
        if !renewable {
            return false;
        }

        tracing::info!("Protected API rejected the access token; renewing");
        match self.signin_silent().await {
            Ok(()) => self.is_authenticated(),
            Err(e) => {
                tracing::warn!(error = %e, "Out-of-band renewal failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Logout
    // -----------------------------------------------------------------------

    /// Ends the session.
    ///
    /// Cancels the renewal timer, clears the Token Store, moves to
    /// `Unauthenticated` and emits `UserUnloaded` before contacting the
    /// provider. Then redirects to the end-session endpoint with
    /// `id_token_hint`, or to `post_logout_redirect_uri` when the provider
    /// has no such endpoint or its metadata is unavailable.
    ///
    /// # Returns
    ///
    /// The URL navigated to, if any.
    ///
    /// # Errors
    ///
    /// Only navigation errors are returned; local clearing always happens.
    pub async fn logout(&self) -> Result<Option<Url>> {
        self.timer.cancel();
        let id_token_hint = self
            .state
            .borrow()
            .session
            .as_ref()
            .map(|s| s.identity_token.clone());

        self.state.send_modify(|snap| {
            self.log_store_error(self.store.clear());
            *snap = SessionSnapshot {
                generation: snap.generation + 1,
                ..SessionSnapshot::default()
            };
        });
        increment_counter!("oidc_logout_total");
        tracing::info!("Session cleared by logout");
        self.emit(SessionEvent::UserUnloaded);

        let end_session = match self.discovery.metadata().await {
            Ok(metadata) => self
                .client
                .end_session_url(&metadata, id_token_hint.as_deref()),
            Err(e) => {
                tracing::warn!(error = %e, "Provider metadata unavailable; skipping end-session endpoint");
                None
            }
        };
        let target = end_session.or_else(|| self.client.post_logout_redirect_uri().cloned());

        if let Some(url) = &target {
            self.navigator.redirect(url)?;
        }
        Ok(target)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn set_authenticated(&self, session: Arc<Session>) {
        self.state.send_modify(|snap| {
            *snap = SessionSnapshot {
                state: SessionState::Authenticated,
                session: Some(session),
                generation: snap.generation + 1,
                last_error: None,
            };
        });
    }

    fn stale_state_age(&self) -> chrono::Duration {
        seconds(self.config.stale_state_age)
    }

    fn emit(&self, event: SessionEvent) {
        tracing::trace!(?event, "Session event");
        let _ = self.events.send(event);
    }

    fn log_store_error(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Token store operation failed");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.state.borrow();
        f.debug_struct("SessionManager")
            .field("client_id", &self.config.client_id)
            .field("state", &snapshot.state)
            .field("generation", &snapshot.generation)
            .finish_non_exhaustive()
    }
}

fn ensure_same_subject(previous: &Session, claims: &IdTokenClaims) -> Result<()> {
    if previous.profile.sub == claims.sub {
        Ok(())
    } else {
        Err(OidcError::TokenValidation("subject changed during renewal".to_string()).into())
    }
}

/// Wait before renewing a token with `left` lifetime: the larger of
/// `left - margin` and `left / 2`, floored at [`MIN_RENEWAL_DELAY`].
fn renewal_delay(left: chrono::Duration, margin: chrono::Duration) -> Duration {
    let before_margin = (left - margin).to_std().unwrap_or(Duration::ZERO);
    let halfway = (left / 2).to_std().unwrap_or(Duration::ZERO);
    before_margin.max(halfway).max(MIN_RENEWAL_DELAY)
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn error_label(err: &anyhow::Error) -> &'static str {
    match kind_of(err) {
        Some(OidcError::Configuration(_)) => "configuration",
        Some(OidcError::StateMismatch) => "state_mismatch",
        Some(OidcError::NonceMismatch) => "nonce_mismatch",
        Some(OidcError::TokenValidation(_)) => "token_validation",
        Some(OidcError::RenewalTimeout(_)) => "renewal_timeout",
        Some(OidcError::RenewalFailure(_)) => "renewal_failure",
        Some(OidcError::Provider { .. }) => "provider",
        Some(OidcError::Discovery(_)) => "discovery",
        Some(_) => "transport",
        None => "other",
    }
}
