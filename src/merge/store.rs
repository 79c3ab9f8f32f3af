//! Merge store and its batch reducer.

use crate::error::{EngineError, Result};
use crate::types::{ChangeOp, DocKey, DocumentChange, DocumentRecord};
use std::collections::HashMap;
use std::sync::Arc;

/// Documents of one collection, by document id.
type Partition = HashMap<String, Arc<DocumentRecord>>;

/// One incoming batch, tagged by how the source delivered it.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeEvent {
    /// Incremental changes for one collection.
    Delta {
        collection: String,
        changes: Vec<DocumentChange>,
    },
    /// Authoritative point-in-time contents of one collection.
    FullReplace {
        collection: String,
        documents: Vec<DocumentRecord>,
    },
}

impl MergeEvent {
    pub fn collection(&self) -> &str {
        match self {
            MergeEvent::Delta { collection, .. } | MergeEvent::FullReplace { collection, .. } => {
                collection
            }
        }
    }
}

/// What a batch did to the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: usize,
    pub removed: usize,
    /// Store version after the batch.
    pub version: u64,
}

/// Incrementally maintained map of documents keyed by composite key.
///
/// The store itself is single-owner (`&mut self`); callers that share it
/// across threads wrap it in their own lock, which is also what makes each
/// batch atomic with respect to readers.
#[derive(Debug, Default)]
pub struct MergeStore {
    partitions: HashMap<String, Arc<Partition>>,
    version: u64,
}

impl MergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one batch.
    ///
    /// The batch is validated as a whole before anything is touched; a
    /// rejected batch leaves the store exactly as it was.
    pub fn reduce(&mut self, event: MergeEvent) -> Result<BatchOutcome> {
        validate(&event)?;

        let mut outcome = BatchOutcome::default();
        match event {
            MergeEvent::Delta {
                collection,
                changes,
            } => {
                for change in changes {
                    match change.op {
                        ChangeOp::Added | ChangeOp::Modified => {
                            let payload = change.payload.unwrap_or_default();
                            let record = DocumentRecord::new(
                                DocKey::new(collection.clone(), change.id.clone()),
                                payload,
                            );
                            let partition = self.partitions.entry(collection.clone()).or_default();
                            Arc::make_mut(partition).insert(change.id, Arc::new(record));
                            outcome.upserted += 1;
                        }
                        ChangeOp::Removed => {
                            if let Some(partition) = self.partitions.get_mut(&collection) {
                                if Arc::make_mut(partition).remove(&change.id).is_some() {
                                    outcome.removed += 1;
                                }
                            }
                        }
                    }
                }
                if self
                    .partitions
                    .get(&collection)
                    .map_or(false, |p| p.is_empty())
                {
                    self.partitions.remove(&collection);
                }
            }
            MergeEvent::FullReplace {
                collection,
                documents,
            } => {
                let previous = self.partitions.remove(&collection);
                let mut next = Partition::with_capacity(documents.len());
                for doc in documents {
                    next.insert(doc.key.id.clone(), Arc::new(doc));
                }
                outcome.removed = previous
                    .as_ref()
                    .map_or(0, |p| p.keys().filter(|id| !next.contains_key(*id)).count());
                outcome.upserted = next.len();
                if !next.is_empty() {
                    self.partitions.insert(collection, Arc::new(next));
                }
            }
        }

        self.version += 1;
        outcome.version = self.version;
        Ok(outcome)
    }

    /// Apply incremental changes for `collection`.
    pub fn apply_delta(
        &mut self,
        collection: impl Into<String>,
        changes: Vec<DocumentChange>,
    ) -> Result<BatchOutcome> {
        self.reduce(MergeEvent::Delta {
            collection: collection.into(),
            changes,
        })
    }

    /// Replace the whole contents of `collection`. An empty set clears it.
    pub fn apply_full_replace(
        &mut self,
        collection: impl Into<String>,
        documents: Vec<DocumentRecord>,
    ) -> Result<BatchOutcome> {
        self.reduce(MergeEvent::FullReplace {
            collection: collection.into(),
            documents,
        })
    }

    /// Structurally shared, immutable view of the current contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            partitions: self.partitions.clone(),
            version: self.version,
        }
    }

    pub fn get(&self, key: &DocKey) -> Option<&DocumentRecord> {
        self.partitions
            .get(&key.collection)
            .and_then(|p| p.get(&key.id))
            .map(|doc| doc.as_ref())
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn collection_len(&self, collection: &str) -> usize {
        self.partitions.get(collection).map_or(0, |p| p.len())
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

fn validate(event: &MergeEvent) -> Result<()> {
    let collection = event.collection();
    if collection.is_empty() {
        return Err(EngineError::transient("<unnamed>", "empty collection name"));
    }

    match event {
        MergeEvent::Delta { changes, .. } => {
            for change in changes {
                if change.id.is_empty() {
                    return Err(EngineError::transient(collection, "change with empty id"));
                }
                if change.op != ChangeOp::Removed && change.payload.is_none() {
                    return Err(EngineError::transient(
                        collection,
                        format!("{:?} change for {} has no payload", change.op, change.id),
                    ));
                }
            }
        }
        MergeEvent::FullReplace { documents, .. } => {
            for doc in documents {
                if doc.key.id.is_empty() {
                    return Err(EngineError::transient(collection, "document with empty id"));
                }
                if doc.key.collection != collection {
                    return Err(EngineError::transient(
                        collection,
                        format!("document {} belongs to another collection", doc.key),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Immutable view of a [`MergeStore`] at one version.
///
/// Partitions are shared with the store; the store copies a partition only
/// when it next mutates it.
#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    partitions: HashMap<String, Arc<Partition>>,
    version: u64,
}

impl StoreSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, key: &DocKey) -> Option<&Arc<DocumentRecord>> {
        self.partitions
            .get(&key.collection)
            .and_then(|p| p.get(&key.id))
    }

    /// Documents of one collection, in no particular order.
    pub fn collection(&self, name: &str) -> impl Iterator<Item = &Arc<DocumentRecord>> + '_ {
        self.partitions
            .get(name)
            .into_iter()
            .flat_map(|p| p.values())
    }

    /// Every document, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DocumentRecord>> + '_ {
        self.partitions.values().flat_map(|p| p.values())
    }

    /// Every document, ordered by composite key.
    pub fn documents(&self) -> Vec<Arc<DocumentRecord>> {
        let mut docs: Vec<_> = self.iter().cloned().collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        docs
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> + '_ {
        self.partitions.keys().map(String::as_str)
    }
}
