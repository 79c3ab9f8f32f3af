//! # Livemerge
//!
//! Real-time aggregation over several overlapping live document queries.
//!
//! ## Core Concepts
//!
//! - **Queries**: Live, filtered views of one collection, opened per session
//! - **Merge Store**: One deduplicated map of every delivered document
//! - **Buckets**: Named sets of keys counted across sources without double counting
//! - **Debounce**: Bursts of deliveries collapse into one trailing publish
//! - **Lifecycle**: Sessions start after profile lookup and tear down cleanly
//!
//! ## Example
//!
//! ```ignore
//! use livemerge::{presets, Aggregator, Identity, MemorySource, StaticIdentityProvider};
//!
//! let source = Arc::new(MemorySource::new());
//! let identities = Arc::new(StaticIdentityProvider::new());
//! let engine = Aggregator::new(presets::client_notifications(), source, identities)?;
//!
//! let _guard = engine.on_buckets_changed(|buckets| {
//!     println!("unread: {}", buckets.count("unread"));
//! });
//! engine.start(Identity::new("client@example.com"))?;
//! ```

pub mod config;
pub mod debounce;
pub mod error;
pub mod lifecycle;
pub mod merge;
pub mod predicate;
pub mod subscriptions;
pub mod types;
pub mod view;

// Re-exports
pub use config::{presets, EngineConfig, QuerySpec, SessionPlan};
pub use debounce::{DebounceScheduler, DEFAULT_DEBOUNCE_WINDOW};
pub use error::{EngineError, Result};
pub use lifecycle::{
    Aggregator, EngineStats, IdentityProvider, LifecycleState, ListenerGuard, StateChange,
    StaticIdentityProvider,
};
pub use merge::{BatchOutcome, MergeEvent, MergeStore, StoreSnapshot};
pub use predicate::{Operand, Predicate};
pub use subscriptions::{
    ChangeCallback, Disposer, ErrorCallback, EstablishReport, LiveQuerySource, MemorySource,
    QueryDescriptor, QuerySnapshot, SourceError, SubscriptionId, SubscriptionSet,
    SubscriptionStatus, SyncPolicy, TeardownReport,
};
pub use types::*;
pub use view::{
    compute_buckets, compute_lists, BucketCounts, BucketDef, ListDef, OrderBy, ViewUpdate,
};
