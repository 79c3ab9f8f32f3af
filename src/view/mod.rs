//! Derived views: pure computations over a store snapshot.

mod buckets;
mod lists;

pub use buckets::{compute_buckets, BucketCounts, BucketDef};
pub use lists::{compute_lists, ListDef, OrderBy};

use crate::merge::StoreSnapshot;
use crate::types::DocumentRecord;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything published to consumers after one debounce window.
#[derive(Clone, Debug, Default)]
pub struct ViewUpdate {
    /// Store version the view was computed from.
    pub version: u64,
    pub buckets: BucketCounts,
    pub lists: BTreeMap<String, Vec<Arc<DocumentRecord>>>,
    /// Every merged document, ordered by composite key.
    pub documents: Vec<Arc<DocumentRecord>>,
}

impl ViewUpdate {
    pub fn compute(snapshot: &StoreSnapshot, buckets: &[BucketDef], lists: &[ListDef]) -> Self {
        Self {
            version: snapshot.version(),
            buckets: compute_buckets(snapshot, buckets),
            lists: compute_lists(snapshot, lists),
            documents: snapshot.documents(),
        }
    }
}
