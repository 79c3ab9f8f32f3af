//! Session identity collaborator.

use crate::error::{EngineError, Result};
use crate::types::{Identity, Profile};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The external session/identity service.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in identity, if any.
    fn current_identity(&self) -> Option<Identity>;

    /// One-shot profile lookup. May block; the engine never holds its lock
    /// while calling it.
    fn resolve_profile(&self, identity: &Identity) -> Result<Profile>;
}

/// Identity provider backed by an in-memory profile table.
#[derive(Default)]
pub struct StaticIdentityProvider {
    current: RwLock<Option<Identity>>,
    profiles: RwLock<HashMap<Identity, Profile>>,
    delay: RwLock<Option<Duration>>,
    lookups: AtomicU64,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, identity: Identity, profile: Profile) -> Self {
        self.profiles.write().insert(identity, profile);
        self
    }

    pub fn insert_profile(&self, identity: Identity, profile: Profile) {
        self.profiles.write().insert(identity, profile);
    }

    pub fn remove_profile(&self, identity: &Identity) {
        self.profiles.write().remove(identity);
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.current.write() = Some(identity);
    }

    pub fn sign_out(&self) {
        *self.current.write() = None;
    }

    /// Make every lookup take at least this long.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.current.read().clone()
    }

    fn resolve_profile(&self, identity: &Identity) -> Result<Profile> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.profiles
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| EngineError::ProfileResolution(format!("no profile for {}", identity)))
    }
}
