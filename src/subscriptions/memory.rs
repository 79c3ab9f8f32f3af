//! In-memory live-query source.
//!
//! Holds collections in memory and pushes per-subscriber deliveries on every
//! write, the way a hosted document store would. Useful for tests, benches,
//! and offline hosts.

use crate::types::{DocKey, DocumentChange, DocumentRecord, Payload};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::types::{
    ChangeCallback, Disposer, ErrorCallback, LiveQuerySource, QueryDescriptor, QuerySnapshot,
    SourceError,
};

type Collection = BTreeMap<String, Payload>;

/// A single write inside a batch.
#[derive(Clone, Debug)]
pub enum Write {
    Upsert { id: String, payload: Payload },
    Delete { id: String },
}

struct Subscriber {
    descriptor: QueryDescriptor,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, Collection>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_id: u64,
    failing: HashSet<String>,
    failing_disposers: HashSet<String>,
    subscribe_calls: u64,
}

/// In-memory implementation of [`LiveQuerySource`].
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one document. Non-object values are stored empty.
    pub fn upsert(&self, collection: &str, id: &str, value: Value) {
        self.write_batch(
            collection,
            vec![Write::Upsert {
                id: id.to_string(),
                payload: into_payload(value),
            }],
        );
    }

    pub fn remove(&self, collection: &str, id: &str) {
        self.write_batch(collection, vec![Write::Delete { id: id.to_string() }]);
    }

    /// Replace the stored contents of a collection.
    pub fn replace_collection(&self, collection: &str, documents: Vec<(String, Value)>) {
        let keep: BTreeSet<&String> = documents.iter().map(|(id, _)| id).collect();
        let mut writes: Vec<Write> = {
            let state = self.state.lock();
            state
                .collections
                .get(collection)
                .map(|c| {
                    c.keys()
                        .filter(|id| !keep.contains(id))
                        .map(|id| Write::Delete { id: id.clone() })
                        .collect()
                })
                .unwrap_or_default()
        };
        writes.extend(documents.iter().map(|(id, value)| Write::Upsert {
            id: id.clone(),
            payload: into_payload(value.clone()),
        }));
        self.write_batch(collection, writes);
    }

    /// Apply several writes to one collection and deliver them as one batch
    /// per affected subscriber.
    pub fn write_batch(&self, collection: &str, writes: Vec<Write>) {
        let deliveries = {
            let mut state = self.state.lock();
            let before = state.collections.get(collection).cloned().unwrap_or_default();
            let current = state.collections.entry(collection.to_string()).or_default();
            for write in writes {
                match write {
                    Write::Upsert { id, payload } => {
                        current.insert(id, payload);
                    }
                    Write::Delete { id } => {
                        current.remove(&id);
                    }
                }
            }
            let after = current.clone();

            state
                .subscribers
                .values()
                .filter(|s| s.descriptor.collection == collection)
                .filter_map(|s| {
                    let snapshot = diff(&s.descriptor, &before, &after);
                    (!snapshot.changes.is_empty()).then(|| (Arc::clone(&s.on_change), snapshot))
                })
                .collect::<Vec<_>>()
        };

        for (on_change, snapshot) in deliveries {
            on_change(snapshot);
        }
    }

    /// Push an arbitrary delivery to every subscriber of a collection.
    pub fn deliver_raw(&self, collection: &str, snapshot: QuerySnapshot) {
        for on_change in self.change_callbacks(collection) {
            on_change(snapshot.clone());
        }
    }

    /// Report an error to every subscriber of a collection.
    pub fn emit_error(&self, collection: &str, message: &str) {
        let callbacks: Vec<ErrorCallback> = {
            let state = self.state.lock();
            state
                .subscribers
                .values()
                .filter(|s| s.descriptor.collection == collection)
                .map(|s| Arc::clone(&s.on_error))
                .collect()
        };
        for on_error in callbacks {
            on_error(SourceError::new(message));
        }
    }

    /// Reject future subscriptions to a collection.
    pub fn fail_collection(&self, collection: &str) {
        self.state.lock().failing.insert(collection.to_string());
    }

    pub fn restore_collection(&self, collection: &str) {
        self.state.lock().failing.remove(collection);
    }

    /// Make disposers of a collection report an error (after releasing).
    pub fn fail_dispose(&self, collection: &str) {
        self.state
            .lock()
            .failing_disposers
            .insert(collection.to_string());
    }

    /// Change callbacks currently registered for a collection.
    pub fn change_callbacks(&self, collection: &str) -> Vec<ChangeCallback> {
        let state = self.state.lock();
        state
            .subscribers
            .values()
            .filter(|s| s.descriptor.collection == collection)
            .map(|s| Arc::clone(&s.on_change))
            .collect()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Descriptors of the currently registered subscriptions.
    pub fn descriptors(&self) -> Vec<QueryDescriptor> {
        self.state
            .lock()
            .subscribers
            .values()
            .map(|s| s.descriptor.clone())
            .collect()
    }

    /// Total `subscribe` calls, including rejected ones.
    pub fn subscribe_calls(&self) -> u64 {
        self.state.lock().subscribe_calls
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Payload> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned())
    }
}

impl LiveQuerySource for MemorySource {
    fn subscribe(
        &self,
        descriptor: &QueryDescriptor,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<Disposer, SourceError> {
        let (id, initial) = {
            let mut state = self.state.lock();
            state.subscribe_calls += 1;
            if state.failing.contains(&descriptor.collection) {
                return Err(SourceError::new(format!(
                    "collection {} rejected the query",
                    descriptor.collection
                )));
            }

            let id = state.next_id;
            state.next_id += 1;
            let empty = Collection::new();
            let current = state.collections.get(&descriptor.collection).unwrap_or(&empty);
            let initial = diff(descriptor, &empty, current);

            state.subscribers.insert(
                id,
                Subscriber {
                    descriptor: descriptor.clone(),
                    on_change: Arc::clone(&on_change),
                    on_error,
                },
            );
            (id, initial)
        };

        // Initial snapshot is delivered even when empty.
        on_change(initial);

        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        let collection = descriptor.collection.clone();
        Ok(Disposer::new(move || {
            let Some(state) = weak.upgrade() else {
                return Ok(());
            };
            let mut state = state.lock();
            state.subscribers.remove(&id);
            if state.failing_disposers.contains(&collection) {
                return Err(SourceError::new(format!(
                    "unsubscribe from {} failed",
                    collection
                )));
            }
            Ok(())
        }))
    }
}

fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Delivery for one subscriber given the collection before and after a write.
fn diff(descriptor: &QueryDescriptor, before: &Collection, after: &Collection) -> QuerySnapshot {
    let matching = |c: &Collection, id: &String| -> Option<Payload> {
        c.get(id)
            .filter(|p| descriptor.predicate.matches(p))
            .cloned()
    };

    let ids: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let mut changes = Vec::new();
    for id in ids {
        match (matching(before, id), matching(after, id)) {
            (None, Some(now)) => changes.push(DocumentChange::added(id.clone(), now)),
            (Some(was), Some(now)) if was != now => {
                changes.push(DocumentChange::modified(id.clone(), now))
            }
            (Some(_), None) => changes.push(DocumentChange::removed(id.clone())),
            _ => {}
        }
    }

    let documents = after
        .iter()
        .filter(|(_, p)| descriptor.predicate.matches(p))
        .map(|(id, p)| {
            DocumentRecord::new(DocKey::new(descriptor.collection.clone(), id.clone()), p.clone())
        })
        .collect();

    QuerySnapshot { documents, changes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{Operand, Predicate};
    use crate::types::ChangeOp;
    use serde_json::json;

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<QuerySnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Arc::new(move |s: QuerySnapshot| sink.lock().push(s)),
            seen,
        )
    }

    #[test]
    fn test_initial_snapshot_and_changes() {
        let source = MemorySource::new();
        source.upsert("notifications", "n1", json!({"owner": "a", "read": false}));
        source.upsert("notifications", "n2", json!({"owner": "b", "read": false}));

        let (on_change, seen) = recorder();
        let descriptor = QueryDescriptor::new(
            "notifications",
            Predicate::eq("owner", Operand::literal("a")),
        );
        let _disposer = source
            .subscribe(&descriptor, on_change, Arc::new(|_| {}))
            .unwrap();

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].documents.len(), 1);
            assert_eq!(seen[0].changes[0].op, ChangeOp::Added);
        }

        // Not matching: no delivery.
        source.upsert("notifications", "n3", json!({"owner": "b"}));
        assert_eq!(seen.lock().len(), 1);

        // Leaves the query: delivered as a removal.
        source.upsert("notifications", "n1", json!({"owner": "b"}));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].changes, vec![DocumentChange::removed("n1")]);
        assert!(seen[1].documents.is_empty());
    }

    #[test]
    fn test_disposer_unregisters() {
        let source = MemorySource::new();
        let (on_change, seen) = recorder();
        let disposer = source
            .subscribe(
                &QueryDescriptor::new("projects", Predicate::All),
                on_change,
                Arc::new(|_| {}),
            )
            .unwrap();
        assert_eq!(source.active_subscriptions(), 1);
        disposer.dispose().unwrap();
        assert_eq!(source.active_subscriptions(), 0);

        source.upsert("projects", "p1", json!({}));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_replace_collection_diffs() {
        let source = MemorySource::new();
        source.upsert("projects", "p1", json!({"v": 1}));
        source.upsert("projects", "p2", json!({"v": 1}));

        let (on_change, seen) = recorder();
        let _d = source
            .subscribe(
                &QueryDescriptor::new("projects", Predicate::All),
                on_change,
                Arc::new(|_| {}),
            )
            .unwrap();

        source.replace_collection("projects", vec![("p2".into(), json!({"v": 2}))]);
        let seen = seen.lock();
        let last = seen.last().unwrap();
        assert_eq!(last.documents.len(), 1);
        assert_eq!(
            last.changes,
            vec![
                DocumentChange::removed("p1"),
                DocumentChange::modified("p2", json!({"v": 2}).as_object().cloned().unwrap()),
            ]
        );
    }
}
