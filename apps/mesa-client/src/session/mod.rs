//! The process-wide session: current credential, display identity, and
//! resolved role, persisted through an injected [`KeyValueStore`].
//!
//! There is deliberately no global here; one `SessionStore` is constructed per
//! app session and handed to every consumer that needs it.

pub mod backend;

pub use backend::{FileStore, KeyValueStore, MemoryStore};

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use mesa_token::{self as token, RoleIdTable, RoleKind};

pub const TOKEN_KEY: &str = "auth_token";
pub const USERNAME_KEY: &str = "username";
pub const ROLE_KEY: &str = "user_role";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for SessionError {
    fn from(value: toml::de::Error) -> Self {
        SessionError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(value: toml::ser::Error) -> Self {
        SessionError::Toml(value.to_string())
    }
}

pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    role_ids: RoleIdTable,
    // Serializes every reader and writer so that clear() is atomic from the
    // perspective of any other SessionStore caller: nobody observes the token
    // gone while the role lingers, or the reverse.
    guard: Mutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_role_ids(backend, RoleIdTable::default())
    }

    pub fn with_role_ids(backend: Arc<dyn KeyValueStore>, role_ids: RoleIdTable) -> Self {
        Self {
            backend,
            role_ids,
            guard: Mutex::new(()),
        }
    }

    /// Persist a freshly issued credential and opportunistically decode it to
    /// keep identity and role alongside. A credential that cannot be parsed
    /// for metadata may still be a usable bearer token, so decode failures
    /// are logged and swallowed rather than raised.
    pub fn save_token(&self, credential: &str) -> Result<(), SessionError> {
        let _guard = self.guard.lock();
        self.backend.put(TOKEN_KEY, credential)?;
        match token::decode(credential) {
            Ok(claims) => {
                if let Some(identity) = claims.identity() {
                    self.backend.put(USERNAME_KEY, identity)?;
                }
                if let Some(role) = token::resolve_role(&claims, &self.role_ids) {
                    self.backend.put(ROLE_KEY, role.as_str())?;
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "mesa::session",
                    error = %err,
                    "credential metadata unavailable; keeping bearer token"
                );
            }
        }
        Ok(())
    }

    pub fn token(&self) -> Option<String> {
        let _guard = self.guard.lock();
        self.read(TOKEN_KEY)
    }

    pub fn username(&self) -> Option<String> {
        let _guard = self.guard.lock();
        self.read(USERNAME_KEY)
    }

    pub fn role(&self) -> Option<RoleKind> {
        let _guard = self.guard.lock();
        self.read(ROLE_KEY)
            .and_then(|raw| RoleKind::from_stored(&raw))
    }

    pub fn save_role(&self, role: RoleKind) -> Result<(), SessionError> {
        let _guard = self.guard.lock();
        self.backend.put(ROLE_KEY, role.as_str())
    }

    /// Remove credential, identity, and role together.
    pub fn clear(&self) -> Result<(), SessionError> {
        let _guard = self.guard.lock();
        self.clear_locked()
    }

    /// A session is fully authenticated only when a non-expired credential
    /// AND an identity are both present. A valid credential without any
    /// identity is torn down on the spot instead of leaving the process
    /// running as an unnamed user.
    pub fn is_authenticated(&self) -> bool {
        let _guard = self.guard.lock();
        let Some(credential) = self.read(TOKEN_KEY) else {
            return false;
        };
        if !token::is_valid(&credential) {
            return false;
        }

        let identity = self
            .read(USERNAME_KEY)
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                token::decode(&credential)
                    .ok()
                    .and_then(|claims| claims.identity().map(str::to_owned))
            });
        if identity.is_none() {
            tracing::warn!(
                target: "mesa::session",
                "valid credential without identity; tearing the session down"
            );
            if let Err(err) = self.clear_locked() {
                tracing::warn!(target: "mesa::session", error = %err, "failed to clear session");
            }
            return false;
        }
        true
    }

    /// Whether the held credential is inside its refresh window (or too
    /// corrupt to judge). With no credential there is nothing to refresh.
    pub fn should_refresh(&self) -> bool {
        match self.token() {
            Some(credential) => token::should_refresh(&credential),
            None => false,
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: "mesa::session", error = %err, key, "session read failed");
                None
            }
        }
    }

    fn clear_locked(&self) -> Result<(), SessionError> {
        self.backend.remove(TOKEN_KEY)?;
        self.backend.remove(USERNAME_KEY)?;
        self.backend.remove(ROLE_KEY)?;
        Ok(())
    }
}
