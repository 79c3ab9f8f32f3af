//! Core types shared across the engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque field map carried by every document.
pub type Payload = Map<String, Value>;

/// Composite key: (source collection, document id).
///
/// The same document id may exist in several logical collections; the pair
/// is what identifies a record inside the merge store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({}/{})", self.collection, self.id)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document held by the merge store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub key: DocKey,
    pub payload: Payload,
}

impl DocumentRecord {
    pub fn new(key: DocKey, payload: Payload) -> Self {
        Self { key, payload }
    }

    /// Build a record from a JSON value. Non-object values become an empty map.
    pub fn from_json(collection: impl Into<String>, id: impl Into<String>, value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            key: DocKey::new(collection, id),
            payload,
        }
    }

    /// Look up a field by dotted path (`"meta.read"`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }
}

pub(crate) fn lookup_path<'a>(payload: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = payload.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Kind of change carried by an incremental delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Added,
    Modified,
    Removed,
}

/// A single incremental change for one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub id: String,
    pub op: ChangeOp,
    /// Required for `Added` and `Modified`; ignored for `Removed`.
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl DocumentChange {
    pub fn added(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            op: ChangeOp::Added,
            payload: Some(payload),
        }
    }

    pub fn modified(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            op: ChangeOp::Modified,
            payload: Some(payload),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op: ChangeOp::Removed,
            payload: None,
        }
    }
}

/// Authenticated user identity (the portal keys users by email).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(email: impl Into<String>) -> Self {
        Identity(email.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a resolved profile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Master,
    Other(String),
}

/// Result of the one-shot profile lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub role: Role,
    /// Additional identities whose documents this user may see.
    #[serde(default)]
    pub linked_identities: Vec<Identity>,
}

impl Profile {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            linked_identities: Vec::new(),
        }
    }

    pub fn with_linked(mut self, linked: Vec<Identity>) -> Self {
        self.linked_identities = linked;
        self
    }
}

/// Everything known about the active session once the profile resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub identity: Identity,
    pub profile: Profile,
}

impl SessionContext {
    pub fn new(identity: Identity, profile: Profile) -> Self {
        Self { identity, profile }
    }

    pub fn role(&self) -> &Role {
        &self.profile.role
    }
}
