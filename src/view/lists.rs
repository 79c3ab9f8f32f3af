//! Filtered, ordered document lists for table-style consumers.

use crate::merge::StoreSnapshot;
use crate::predicate::Predicate;
use crate::types::{DocumentRecord, SessionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// A named list of documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListDef {
    pub name: String,
    /// Collections to draw from. Empty means every collection.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListDef {
    pub fn new(name: impl Into<String>, sources: Vec<&str>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            sources: sources.into_iter().map(String::from).collect(),
            predicate,
            order_by: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn bind(&self, session: &SessionContext) -> ListDef {
        ListDef {
            predicate: self.predicate.bind(session),
            ..self.clone()
        }
    }
}

/// Compute every list from a snapshot.
///
/// Documents are ordered by `order_by` (missing values last) and then by
/// composite key, so the output is deterministic.
pub fn compute_lists(
    snapshot: &StoreSnapshot,
    defs: &[ListDef],
) -> BTreeMap<String, Vec<Arc<DocumentRecord>>> {
    defs.iter()
        .map(|def| (def.name.clone(), compute_list(snapshot, def)))
        .collect()
}

fn compute_list(snapshot: &StoreSnapshot, def: &ListDef) -> Vec<Arc<DocumentRecord>> {
    let mut docs: Vec<Arc<DocumentRecord>> = if def.sources.is_empty() {
        snapshot
            .iter()
            .filter(|doc| def.predicate.matches(&doc.payload))
            .cloned()
            .collect()
    } else {
        let mut sources: Vec<&String> = def.sources.iter().collect();
        sources.sort();
        sources.dedup();
        sources
            .into_iter()
            .flat_map(|source| snapshot.collection(source))
            .filter(|doc| def.predicate.matches(&doc.payload))
            .cloned()
            .collect()
    };

    docs.sort_by(|a, b| {
        let primary = match &def.order_by {
            Some(order) => compare_field(a, b, order),
            None => Ordering::Equal,
        };
        primary.then_with(|| a.key.cmp(&b.key))
    });
    docs.dedup_by(|a, b| a.key == b.key);

    if let Some(limit) = def.limit {
        docs.truncate(limit);
    }
    docs
}

fn compare_field(a: &DocumentRecord, b: &DocumentRecord, order: &OrderBy) -> Ordering {
    match (sort_key(a.field(&order.field)), sort_key(b.field(&order.field))) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ord = x.cmp(&y);
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

/// Comparable form of a field value. Values of different kinds order as
/// bool < number < string.
#[derive(PartialEq, PartialOrd)]
enum SortKey<'a> {
    Bool(bool),
    Number(f64),
    Text(&'a str),
}

impl Eq for SortKey<'_> {}

impl Ord for SortKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

fn sort_key(value: Option<&Value>) -> Option<SortKey<'_>> {
    match value? {
        Value::Bool(b) => Some(SortKey::Bool(*b)),
        Value::Number(n) => n.as_f64().map(SortKey::Number),
        Value::String(s) => Some(SortKey::Text(s)),
        // Store timestamps arrive as {seconds, nanoseconds}.
        Value::Object(map) => {
            let seconds = map.get("seconds").or_else(|| map.get("_seconds"))?.as_f64()?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Some(SortKey::Number(seconds + nanos / 1e9))
        }
        _ => None,
    }
}
