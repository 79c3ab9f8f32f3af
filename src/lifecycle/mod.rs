//! Session lifecycle and the aggregation engine.
//!
//! An [`Aggregator`] owns at most one session at a time and moves through
//! `Idle → Initializing → Active → TearingDown → Idle`:
//! - Subscriptions open only after the profile for the identity resolved
//! - A second initialization while one is in flight is refused
//! - Teardown disposes subscriptions and cancels the pending publish, and
//!   can be called any number of times from any thread

mod controller;
mod identity;
mod listeners;

pub use controller::Aggregator;
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use listeners::ListenerGuard;

use crate::error::EngineError;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Initializing,
    Active,
    TearingDown,
}

impl LifecycleState {
    /// True while a session owns (or is about to own) subscriptions.
    pub fn is_live(self) -> bool {
        matches!(self, LifecycleState::Initializing | LifecycleState::Active)
    }
}

/// Notification sent to state listeners on every transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub state: LifecycleState,
    /// Set when the transition was caused by a user-visible failure.
    pub error: Option<EngineError>,
}

/// Engine counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub sessions_started: u64,
    pub batches_applied: u64,
    pub batches_rejected: u64,
    pub delivery_errors: u64,
    pub publishes: u64,
    pub sources_failed: u64,
    pub late_callbacks_ignored: u64,
    pub teardown_failures: u64,
}
