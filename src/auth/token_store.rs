//! Session persistence
//!
//! [`TokenStore`] is the only component that reads or writes persisted
//! session data. It serializes the [`Session`] and the in-flight
//! [`PendingLogin`] to JSON and hands them to a pluggable [`StateStore`]
//! backend under keys scoped to the authority and client id:
//!
//! ```text
//! oidc.user:<authority>:<client_id>
//! oidc.pending:<authority>:<client_id>
//! ```
//!
//! Unparseable values are logged (never their contents), removed, and
//! reported as absent so that the session manager re-authenticates instead
//! of failing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::session::{PendingLogin, Session};
use crate::config::{OidcConfig, StoreBackend};
use crate::error::{kind_of, OidcError, Result};

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Synchronous string key/value backend.
pub trait StateStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value in a single
    /// write.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One file per key below a data directory.
///
/// File names are the base64url encoding of the key, so any key maps to a
/// valid, collision-free file name. Writes go to a temporary sibling that is
/// then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Uses `dir` as the data directory, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Storage`] when the directory cannot be created.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            OidcError::Storage(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    /// Uses the platform data directory for `oidc-session`.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Storage`] when no home directory can be
    /// determined.
    pub fn in_default_location() -> Result<Self> {
        let dirs = ProjectDirs::from("com", "oidc-session", "oidc-session").ok_or_else(|| {
            OidcError::Storage("Could not determine data directory".to_string())
        })?;
        Self::new(dirs.data_dir().join("sessions"))
    }

    /// The data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.dir.join(format!("{name}.json"))
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => String::from_utf8(bytes).map(Some).map_err(|_| {
                OidcError::StorageCorruption(format!("{key} is not valid UTF-8")).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OidcError::Io(e).into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let target = self.path_for(key);
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, value)?;
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(OidcError::Io(e).into());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OidcError::Io(e).into()),
        }
    }
}

/// OS native credential store (Keychain, Secret Service, Credential
/// Manager).
#[derive(Debug, Clone)]
pub struct KeyringStateStore {
    service: String,
}

impl KeyringStateStore {
    /// Stores entries under the given keyring service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key).map_err(|e| OidcError::Keyring(e).into())
    }
}

impl Default for KeyringStateStore {
    fn default() -> Self {
        Self::new("oidc-session")
    }
}

impl StateStore for KeyringStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(OidcError::Keyring(e).into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| OidcError::Keyring(e).into())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(OidcError::Keyring(e).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// Origin-scoped persistence for the current session and pending login.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use oidc_session::auth::token_store::{MemoryStateStore, TokenStore};
///
/// let store = TokenStore::new(
///     Arc::new(MemoryStateStore::new()),
///     "https://idp.example.com",
///     "spa",
/// );
/// assert_eq!(store.user_key(), "oidc.user:https://idp.example.com:spa");
/// assert!(store.load().is_none());
/// store.clear().unwrap();
/// ```
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn StateStore>,
    user_key: String,
    pending_key: String,
}

impl TokenStore {
    /// Creates a store scoped to `authority` and `client_id`.
    pub fn new(backend: Arc<dyn StateStore>, authority: &str, client_id: &str) -> Self {
        let authority = authority.trim_end_matches('/');
        Self {
            backend,
            user_key: format!("oidc.user:{authority}:{client_id}"),
            pending_key: format!("oidc.pending:{authority}:{client_id}"),
        }
    }

    /// Creates the backend selected by `user_store` and scopes it to the
    /// configured client.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Storage`] when the file backend's directory
    /// cannot be prepared.
    pub fn from_config(config: &OidcConfig) -> Result<Self> {
        let backend: Arc<dyn StateStore> = match config.user_store.backend {
            StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
            StoreBackend::File => match &config.user_store.path {
                Some(dir) => Arc::new(FileStateStore::new(dir)?),
                None => Arc::new(FileStateStore::in_default_location()?),
            },
            StoreBackend::Keyring => Arc::new(KeyringStateStore::default()),
        };
        tracing::debug!(backend = ?config.user_store.backend, "Token store initialised");
        Ok(Self::new(backend, &config.authority, &config.client_id))
    }

    /// Key under which the session is stored.
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Key under which the pending login is stored.
    pub fn pending_key(&self) -> &str {
        &self.pending_key
    }

    /// Persists `session`, replacing any stored session.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when the write fails.
    pub fn save(&self, session: &Session) -> Result<()> {
        self.write(&self.user_key, session)
    }

    /// Loads the stored session; absent, unreadable and corrupted values all
    /// yield `None`.
    pub fn load(&self) -> Option<Session> {
        self.read(&self.user_key)
    }

    /// Removes the stored session and any pending login. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; both keys are attempted regardless.
    pub fn clear(&self) -> Result<()> {
        let user = self.backend.remove(&self.user_key);
        let pending = self.backend.remove(&self.pending_key);
        user.and(pending)
    }

    /// Removes only the stored session.
    pub fn clear_session(&self) -> Result<()> {
        self.backend.remove(&self.user_key)
    }

    /// Persists the correlation data of a login attempt.
    pub fn save_pending(&self, pending: &PendingLogin) -> Result<()> {
        self.write(&self.pending_key, pending)
    }

    /// Loads the pending login without consuming it.
    pub fn load_pending(&self) -> Option<PendingLogin> {
        self.read(&self.pending_key)
    }

    /// Loads and removes the pending login.
    pub fn take_pending(&self) -> Option<PendingLogin> {
        let pending = self.read(&self.pending_key);
        if let Err(e) = self.backend.remove(&self.pending_key) {
            tracing::warn!(key = %self.pending_key, error = %e, "Failed to remove pending login");
        }
        pending
    }

    /// Removes the pending login.
    pub fn clear_pending(&self) -> Result<()> {
        self.backend.remove(&self.pending_key)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.backend.set(key, &json)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Stored value unreadable; treating as absent");
                if matches!(kind_of(&e), Some(OidcError::StorageCorruption(_))) {
                    self.discard(key);
                }
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                let err = OidcError::StorageCorruption(e.to_string());
                tracing::warn!(key = %key, error = %err, "Discarding corrupted stored value");
                metrics::increment_counter!("oidc_storage_corruption_total");
                self.discard(key);
                None
            }
        }
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            tracing::warn!(key = %key, error = %e, "Failed to remove stored value");
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("user_key", &self.user_key)
            .field("pending_key", &self.pending_key)
            .finish_non_exhaustive()
    }
}
