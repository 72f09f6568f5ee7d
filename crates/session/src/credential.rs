//! Credential storage for the current session
//!
//! The store is the single source of truth for the bearer token. Every write
//! bumps a generation counter so readers can tell whether the credential they
//! sent is still the current one. The lock is never held across an await, so
//! a reader can never observe a half-applied update.

use common::Secret;
use parking_lot::RwLock;
use tracing::debug;

/// Opaque session token. Redacted in Debug output and wiped on drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    /// Raw token value (use sparingly)
    pub fn token(&self) -> &str {
        self.0.expose()
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }
}

impl From<Secret<String>> for Credential {
    fn from(secret: Secret<String>) -> Self {
        Self(secret)
    }
}

/// Credential together with the generation it was read at.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub credential: Option<Credential>,
    pub generation: u64,
}

/// Thread-safe holder of the current credential.
///
/// Generation starts at 0 for an empty store and increases by one on every
/// `set`, effective `clear` or successful `clear_if_current`.
pub struct CredentialStore {
    state: RwLock<CredentialSnapshot>,
}

impl CredentialStore {
    /// Empty store (no session yet).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CredentialSnapshot {
                credential: None,
                generation: 0,
            }),
        }
    }

    /// Store seeded with an initial credential at generation 1.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: RwLock::new(CredentialSnapshot {
                credential: Some(credential),
                generation: 1,
            }),
        }
    }

    /// Current credential, if a session is active.
    pub fn get(&self) -> Option<Credential> {
        self.state.read().credential.clone()
    }

    pub fn snapshot(&self) -> CredentialSnapshot {
        self.state.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn is_active(&self) -> bool {
        self.state.read().credential.is_some()
    }

    /// Replace the credential wholesale. Returns the new generation.
    pub fn set(&self, credential: Credential) -> u64 {
        let mut state = self.state.write();
        state.credential = Some(credential);
        state.generation += 1;
        debug!(generation = state.generation, "credential replaced");
        state.generation
    }

    /// Drop the credential. Returns the generation after the call.
    pub fn clear(&self) -> u64 {
        let mut state = self.state.write();
        if state.credential.take().is_some() {
            state.generation += 1;
            debug!(generation = state.generation, "credential cleared");
        }
        state.generation
    }

    /// Clear only if nothing has replaced the credential since `generation`.
    ///
    /// The generation advances even when the store was already empty, so
    /// requests sent before the call are recognisably stale afterwards.
    /// Returns true when `generation` was current.
    pub fn clear_if_current(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        state.credential = None;
        state.generation += 1;
        debug!(generation = state.generation, "credential cleared");
        true
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
