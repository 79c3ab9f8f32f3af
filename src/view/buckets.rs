//! Named, deduplicated document buckets.

use crate::merge::StoreSnapshot;
use crate::predicate::Predicate;
use crate::types::{DocKey, DocumentRecord, SessionContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A named aggregate: documents of `sources` matching `predicate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketDef {
    pub name: String,
    /// Collections to draw from. Empty means every collection.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub predicate: Predicate,
}

impl BucketDef {
    pub fn new(name: impl Into<String>, sources: Vec<&str>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            sources: sources.into_iter().map(String::from).collect(),
            predicate,
        }
    }

    pub fn bind(&self, session: &SessionContext) -> BucketDef {
        BucketDef {
            name: self.name.clone(),
            sources: self.sources.clone(),
            predicate: self.predicate.bind(session),
        }
    }

    pub(crate) fn admits(&self, doc: &DocumentRecord) -> bool {
        (self.sources.is_empty() || self.sources.iter().any(|s| *s == doc.key.collection))
            && self.predicate.matches(&doc.payload)
    }
}

/// Result of [`compute_buckets`]: one key set per bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketCounts {
    buckets: BTreeMap<String, BTreeSet<DocKey>>,
}

impl BucketCounts {
    /// Size of a bucket; unknown buckets count as zero.
    pub fn count(&self, name: &str) -> usize {
        self.buckets.get(name).map_or(0, |keys| keys.len())
    }

    pub fn keys(&self, name: &str) -> Option<&BTreeSet<DocKey>> {
        self.buckets.get(name)
    }

    pub fn contains(&self, name: &str, key: &DocKey) -> bool {
        self.buckets.get(name).map_or(false, |keys| keys.contains(key))
    }

    /// `{bucket name: count}` map handed to consumers.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.buckets
            .iter()
            .map(|(name, keys)| (name.clone(), keys.len()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.buckets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Compute every bucket from a snapshot.
///
/// Pure: no I/O, no shared state. Each bucket is a set union over keys, so
/// a document reachable through several queries is counted once. Two
/// definitions sharing a name are merged into one bucket.
pub fn compute_buckets(snapshot: &StoreSnapshot, defs: &[BucketDef]) -> BucketCounts {
    let mut buckets: BTreeMap<String, BTreeSet<DocKey>> = defs
        .iter()
        .map(|def| (def.name.clone(), BTreeSet::new()))
        .collect();

    for def in defs {
        let Some(keys) = buckets.get_mut(&def.name) else {
            continue;
        };
        if def.sources.is_empty() {
            keys.extend(
                snapshot
                    .iter()
                    .filter(|doc| def.admits(doc))
                    .map(|doc| doc.key.clone()),
            );
        } else {
            for source in &def.sources {
                keys.extend(
                    snapshot
                        .collection(source)
                        .filter(|doc| def.predicate.matches(&doc.payload))
                        .map(|doc| doc.key.clone()),
                );
            }
        }
    }

    BucketCounts { buckets }
}
