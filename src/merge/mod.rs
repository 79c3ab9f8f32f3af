//! Incrementally maintained document map.
//!
//! Documents are keyed by (collection, id) and partitioned by collection so
//! a whole-collection replace only touches its own partition. Every batch
//! goes through one reducer and is applied atomically.

mod store;

pub use store::{BatchOutcome, MergeEvent, MergeStore, StoreSnapshot};
