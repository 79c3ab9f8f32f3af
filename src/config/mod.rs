//! Engine configuration: the declarative aggregation table.
//!
//! One [`EngineConfig`] describes which live queries to open for which role
//! and which buckets and lists to derive from the merged documents. The same
//! engine serves every role; only the table differs.

pub mod presets;

use crate::debounce::DEFAULT_DEBOUNCE_WINDOW;
use crate::error::{EngineError, Result};
use crate::predicate::Predicate;
use crate::subscriptions::{QueryDescriptor, SyncPolicy};
use crate::types::{Role, SessionContext};
use crate::view::{BucketDef, ListDef};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One row of the query table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub collection: String,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub sync: SyncPolicy,
    /// Roles this query is opened for. Empty means every role.
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            collection: collection.into(),
            predicate,
            sync: SyncPolicy::Delta,
            roles: Vec::new(),
        }
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    pub fn for_roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    pub fn applies_to(&self, role: &Role) -> bool {
        self.roles.is_empty() || self.roles.contains(role)
    }

    /// True when some session role opens both queries.
    pub fn shares_role_with(&self, other: &QuerySpec) -> bool {
        self.roles.is_empty()
            || other.roles.is_empty()
            || self.roles.iter().any(|r| other.roles.contains(r))
    }

    /// Concrete descriptor for this session.
    pub fn bind(&self, session: &SessionContext) -> QueryDescriptor {
        QueryDescriptor::new(self.collection.clone(), self.predicate.bind(session))
            .with_sync(self.sync)
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiet window before a publish.
    /// Default: 100ms
    #[serde(default = "default_window", with = "duration_ms", rename = "debounce_window_ms")]
    pub debounce_window: Duration,

    #[serde(default)]
    pub queries: Vec<QuerySpec>,

    #[serde(default)]
    pub buckets: Vec<BucketDef>,

    #[serde(default)]
    pub lists: Vec<ListDef>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            queries: Vec::new(),
            buckets: Vec::new(),
            lists: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn query(mut self, spec: QuerySpec) -> Self {
        self.queries.push(spec);
        self
    }

    pub fn bucket(mut self, def: BucketDef) -> Self {
        self.buckets.push(def);
        self
    }

    pub fn list(mut self, def: ListDef) -> Self {
        self.lists.push(def);
        self
    }

    /// Append another table (e.g. two presets served by one engine).
    pub fn merge(mut self, other: EngineConfig) -> Self {
        self.queries.extend(other.queries);
        self.buckets.extend(other.buckets);
        self.lists.extend(other.lists);
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_window.is_zero() {
            return Err(EngineError::InvalidConfig(
                "debounce window must be non-zero".into(),
            ));
        }
        if let Some(q) = self.queries.iter().find(|q| q.collection.is_empty()) {
            return Err(EngineError::InvalidConfig(format!(
                "query with empty collection name ({})",
                q.predicate
            )));
        }

        // A full replace overwrites the whole collection, so it cannot share
        // one with any other query a session may open.
        for (i, full) in self.queries.iter().enumerate() {
            if full.sync != SyncPolicy::FullReplace {
                continue;
            }
            let clash = self
                .queries
                .iter()
                .enumerate()
                .find(|(j, other)| {
                    *j != i && other.collection == full.collection && full.shares_role_with(other)
                });
            if let Some((_, other)) = clash {
                return Err(EngineError::InvalidConfig(format!(
                    "full-replace query {}[{}] shares its collection with {}[{}]",
                    full.collection, full.predicate, other.collection, other.predicate
                )));
            }
        }

        // Buckets may share a name (their keys are unioned); lists may not.
        let mut seen = HashSet::new();
        for list in &self.lists {
            if !seen.insert(list.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate list name: {}",
                    list.name
                )));
            }
        }
        if let Some(b) = self.buckets.iter().find(|b| b.name.is_empty()) {
            return Err(EngineError::InvalidConfig(format!(
                "bucket with empty name ({})",
                b.predicate
            )));
        }
        Ok(())
    }

    /// Resolve the table for one session: role filtering and binding.
    pub fn plan(&self, session: &SessionContext) -> SessionPlan {
        SessionPlan {
            descriptors: self
                .queries
                .iter()
                .filter(|q| q.applies_to(session.role()))
                .map(|q| q.bind(session))
                .collect(),
            buckets: self.buckets.iter().map(|b| b.bind(session)).collect(),
            lists: self.lists.iter().map(|l| l.bind(session)).collect(),
        }
    }
}

/// The configuration resolved for one session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPlan {
    pub descriptors: Vec<QueryDescriptor>,
    pub buckets: Vec<BucketDef>,
    pub lists: Vec<ListDef>,
}

fn default_window() -> Duration {
    DEFAULT_DEBOUNCE_WINDOW
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Operand;
    use crate::types::{Identity, Profile};

    fn session(role: Role) -> SessionContext {
        SessionContext::new(Identity::new("x@y.com"), Profile::new(role))
    }

    #[test]
    fn test_full_replace_collection_must_be_exclusive_per_role() {
        let shared = EngineConfig::new()
            .query(
                QuerySpec::new("payments", Predicate::eq("client", Operand::Identity))
                    .with_sync(SyncPolicy::FullReplace),
            )
            .query(QuerySpec::new("payments", Predicate::eq("payer", Operand::Identity)));
        assert!(matches!(shared.validate(), Err(EngineError::InvalidConfig(_))));

        let split = EngineConfig::new()
            .query(
                QuerySpec::new("payments", Predicate::All)
                    .with_sync(SyncPolicy::FullReplace)
                    .for_roles(vec![Role::Master]),
            )
            .query(
                QuerySpec::new("payments", Predicate::eq("client", Operand::Identity))
                    .for_roles(vec![Role::Client]),
            );
        split.validate().unwrap();
    }

    #[test]
    fn test_default_window() {
        assert_eq!(EngineConfig::default().debounce_window, Duration::from_millis(100));
    }

    #[test]
    fn test_plan_filters_by_role_and_binds() {
        let config = EngineConfig::new()
            .query(
                QuerySpec::new("notifications", Predicate::eq("owner", Operand::Identity))
                    .for_roles(vec![Role::Client]),
            )
            .query(QuerySpec::new("projects", Predicate::All).for_roles(vec![Role::Master]))
            .query(QuerySpec::new("payments", Predicate::All).with_sync(SyncPolicy::FullReplace));

        let plan = config.plan(&session(Role::Client));
        assert_eq!(plan.descriptors.len(), 2);
        assert_eq!(
            plan.descriptors[0].to_string(),
            "notifications[owner == \"x@y.com\"]"
        );
        assert_eq!(plan.descriptors[1].sync, SyncPolicy::FullReplace);
        assert!(plan.descriptors.iter().all(|d| d.predicate.is_bound()));

        let plan = config.plan(&session(Role::Master));
        let collections: Vec<_> = plan.descriptors.iter().map(|d| d.collection.as_str()).collect();
        assert_eq!(collections, vec!["projects", "payments"]);
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "debounce_window_ms": 250,
                "queries": [
                    {"collection": "notifications",
                     "predicate": {"op": "eq", "field": "owner", "value": {"kind": "identity"}},
                     "roles": ["client"]}
                ],
                "buckets": [
                    {"name": "unread", "sources": ["notifications"],
                     "predicate": {"op": "flag", "field": "read", "value": false, "missing_as": true}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.debounce_window, Duration::from_millis(250));
        assert_eq!(config.queries[0].sync, SyncPolicy::Delta);
        assert_eq!(config.buckets[0].name, "unread");

        let json = config.to_json_string().unwrap();
        assert!(json.contains("\"debounce_window_ms\": 250"));
    }

    #[test]
    fn test_validation() {
        let zero = EngineConfig::new().debounce_window(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(EngineError::InvalidConfig(_))));

        let dup = EngineConfig::new()
            .list(ListDef::new("a", vec![], Predicate::All))
            .list(ListDef::new("a", vec![], Predicate::All));
        assert!(dup.validate().is_err());

        let empty = EngineConfig::new().query(QuerySpec::new("", Predicate::All));
        assert!(empty.validate().is_err());

        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(EngineError::Serialization(_))
        ));
    }
}
