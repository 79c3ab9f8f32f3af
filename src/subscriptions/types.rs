//! Types shared between the subscription set and live-query sources.

use crate::error::EngineError;
use crate::merge::MergeEvent;
use crate::predicate::Predicate;
use crate::types::{DocumentChange, DocumentRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How deliveries of a query are folded into the merge store.
///
/// Fixed when the subscription is opened; never inferred per delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Apply the incremental `changes` of each delivery.
    #[default]
    Delta,
    /// Treat the `documents` of each delivery as the whole collection.
    FullReplace,
}

/// A live query: which collection, which documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection: String,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub sync: SyncPolicy,
}

impl QueryDescriptor {
    pub fn new(collection: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            collection: collection.into(),
            predicate,
            sync: SyncPolicy::Delta,
        }
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.collection, self.predicate)
    }
}

/// One delivery from a live query.
///
/// Sources fill both halves; the descriptor's [`SyncPolicy`] decides which
/// one is applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySnapshot {
    /// Every document currently matching the query.
    pub documents: Vec<DocumentRecord>,
    /// Changes since the previous delivery.
    pub changes: Vec<DocumentChange>,
}

impl QuerySnapshot {
    /// Fold this delivery into a merge event according to the descriptor.
    pub fn into_event(self, descriptor: &QueryDescriptor) -> MergeEvent {
        match descriptor.sync {
            SyncPolicy::Delta => MergeEvent::Delta {
                collection: descriptor.collection.clone(),
                changes: self.changes,
            },
            SyncPolicy::FullReplace => MergeEvent::FullReplace {
                collection: descriptor.collection.clone(),
                documents: self.documents,
            },
        }
    }
}

/// Error reported by a live-query source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        SourceError(message.into())
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SourceError {}

/// Called with each delivery of a live query.
pub type ChangeCallback = Arc<dyn Fn(QuerySnapshot) + Send + Sync>;

/// Called when a live query reports an error after being established.
pub type ErrorCallback = Arc<dyn Fn(SourceError) + Send + Sync>;

/// Releases one live query. Consumed on use, so it runs at most once.
pub struct Disposer(Box<dyn FnOnce() -> Result<(), SourceError> + Send>);

impl Disposer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), SourceError> + Send + 'static,
    {
        Disposer(Box::new(f))
    }

    pub fn noop() -> Self {
        Disposer(Box::new(|| Ok(())))
    }

    pub fn dispose(self) -> Result<(), SourceError> {
        (self.0)()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposer")
    }
}

/// The external live-query service.
///
/// Implementations may invoke the callbacks from any thread, including
/// synchronously from inside `subscribe` for the initial snapshot.
pub trait LiveQuerySource: Send + Sync {
    fn subscribe(
        &self,
        descriptor: &QueryDescriptor,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<Disposer, SourceError>;
}

/// Unique identifier for a subscription within a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Disposed,
}

/// Outcome of opening several subscriptions at once.
#[derive(Debug, Default)]
pub struct EstablishReport {
    pub established: Vec<SubscriptionId>,
    /// One `SourceUnavailable` per descriptor that could not be opened.
    pub failures: Vec<EngineError>,
}

/// Outcome of disposing a subscription set.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub disposed: usize,
    /// One `Teardown` error per disposer that failed.
    pub failures: Vec<EngineError>,
}
