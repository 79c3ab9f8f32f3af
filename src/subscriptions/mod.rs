//! Live-query subscriptions.
//!
//! This module defines the seam to the external live-query service
//! ([`LiveQuerySource`]) and the [`SubscriptionSet`] that owns every handle
//! opened for one session:
//! - Overlapping queries are allowed; deduplication happens downstream
//! - A query that fails to open is logged and skipped
//! - Bulk teardown is idempotent and silences late callbacks
//!
//! # Example
//!
//! ```ignore
//! let source = Arc::new(MemorySource::new());
//! let set = SubscriptionSet::new(source);
//!
//! let id = set.add(
//!     QueryDescriptor::new("notifications", Predicate::All),
//!     Arc::new(|snapshot| println!("{} changes", snapshot.changes.len())),
//!     Arc::new(|error| eprintln!("{}", error)),
//! )?;
//!
//! set.dispose_all();
//! ```

pub mod memory;
mod set;
mod types;

pub use memory::MemorySource;
pub use set::SubscriptionSet;
pub use types::{
    ChangeCallback, Disposer, ErrorCallback, EstablishReport, LiveQuerySource, QueryDescriptor,
    QuerySnapshot, SourceError, SubscriptionId, SubscriptionStatus, SyncPolicy, TeardownReport,
};
