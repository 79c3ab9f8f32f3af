//! Declarative document predicates.
//!
//! Predicates serve two purposes: they describe a live query to the
//! external source, and they select documents into buckets and lists. A
//! predicate may reference the session (`Operand::Identity` and friends);
//! such operands are resolved with [`Predicate::bind`] once the profile is
//! known. Unbound operands never match.

use crate::types::{lookup_path, Payload, SessionContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Right-hand side of a comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    Literal(Value),
    /// The session identity (email).
    Identity,
    /// The identities linked to the session profile.
    LinkedIdentities,
    /// The session identity followed by its linked identities.
    IdentityOrLinked,
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    fn bind(&self, session: &SessionContext) -> Operand {
        match self {
            Operand::Literal(v) => Operand::Literal(v.clone()),
            Operand::Identity => Operand::Literal(Value::String(session.identity.0.clone())),
            Operand::LinkedIdentities => Operand::Literal(Value::Array(
                session
                    .profile
                    .linked_identities
                    .iter()
                    .map(|id| Value::String(id.0.clone()))
                    .collect(),
            )),
            Operand::IdentityOrLinked => {
                let mut all = vec![Value::String(session.identity.0.clone())];
                all.extend(
                    session
                        .profile
                        .linked_identities
                        .iter()
                        .filter(|id| **id != session.identity)
                        .map(|id| Value::String(id.0.clone())),
                );
                Operand::Literal(Value::Array(all))
            }
        }
    }

    fn as_literal(&self) -> Option<&Value> {
        match self {
            Operand::Literal(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(Value::String(s)) => write!(f, "\"{}\"", s),
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Identity => f.write_str("$identity"),
            Operand::LinkedIdentities => f.write_str("$linked"),
            Operand::IdentityOrLinked => f.write_str("$identity_or_linked"),
        }
    }
}

/// A boolean condition over a document payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every document.
    All,
    /// Field equals the operand. A list operand means "equals any".
    Eq { field: String, value: Operand },
    /// Field is present and differs from the operand.
    Ne { field: String, value: Operand },
    /// Field equals one of the values of a list operand.
    In { field: String, values: Operand },
    /// Field is present (and not null).
    Exists { field: String },
    /// Boolean flag check. `missing_as` is the value assumed when the field
    /// is absent or not a boolean.
    Flag {
        field: String,
        value: bool,
        missing_as: bool,
    },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: Operand) -> Self {
        Predicate::Eq {
            field: field.into(),
            value,
        }
    }

    pub fn ne(field: impl Into<String>, value: Operand) -> Self {
        Predicate::Ne {
            field: field.into(),
            value,
        }
    }

    pub fn is_in(field: impl Into<String>, values: Operand) -> Self {
        Predicate::In {
            field: field.into(),
            values,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Predicate::Exists {
            field: field.into(),
        }
    }

    pub fn flag(field: impl Into<String>, value: bool, missing_as: bool) -> Self {
        Predicate::Flag {
            field: field.into(),
            value,
            missing_as,
        }
    }

    pub fn and(all: Vec<Predicate>) -> Self {
        Predicate::And { all }
    }

    pub fn or(any: Vec<Predicate>) -> Self {
        Predicate::Or { any }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Resolve session operands to literals.
    pub fn bind(&self, session: &SessionContext) -> Predicate {
        match self {
            Predicate::All => Predicate::All,
            Predicate::Eq { field, value } => Predicate::Eq {
                field: field.clone(),
                value: value.bind(session),
            },
            Predicate::Ne { field, value } => Predicate::Ne {
                field: field.clone(),
                value: value.bind(session),
            },
            Predicate::In { field, values } => Predicate::In {
                field: field.clone(),
                values: values.bind(session),
            },
            Predicate::Exists { field } => Predicate::Exists {
                field: field.clone(),
            },
            Predicate::Flag {
                field,
                value,
                missing_as,
            } => Predicate::Flag {
                field: field.clone(),
                value: *value,
                missing_as: *missing_as,
            },
            Predicate::And { all } => Predicate::And {
                all: all.iter().map(|p| p.bind(session)).collect(),
            },
            Predicate::Or { any } => Predicate::Or {
                any: any.iter().map(|p| p.bind(session)).collect(),
            },
            Predicate::Not { predicate } => Predicate::Not {
                predicate: Box::new(predicate.bind(session)),
            },
        }
    }

    /// True when no operand still refers to the session.
    pub fn is_bound(&self) -> bool {
        match self {
            Predicate::All | Predicate::Exists { .. } | Predicate::Flag { .. } => true,
            Predicate::Eq { value, .. } | Predicate::Ne { value, .. } => {
                value.as_literal().is_some()
            }
            Predicate::In { values, .. } => values.as_literal().is_some(),
            Predicate::And { all } => all.iter().all(Predicate::is_bound),
            Predicate::Or { any } => any.iter().all(Predicate::is_bound),
            Predicate::Not { predicate } => predicate.is_bound(),
        }
    }

    /// Evaluate against a payload.
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq { field, value } => {
                let (Some(actual), Some(expected)) = (lookup_path(payload, field), value.as_literal())
                else {
                    return false;
                };
                match expected {
                    Value::Array(options) if !actual.is_array() => options.contains(actual),
                    _ => actual == expected,
                }
            }
            Predicate::Ne { field, value } => {
                let (Some(actual), Some(expected)) = (lookup_path(payload, field), value.as_literal())
                else {
                    return false;
                };
                !actual.is_null() && actual != expected
            }
            Predicate::In { field, values } => {
                let (Some(actual), Some(Value::Array(options))) =
                    (lookup_path(payload, field), values.as_literal())
                else {
                    return false;
                };
                options.contains(actual)
            }
            Predicate::Exists { field } => {
                lookup_path(payload, field).map_or(false, |v| !v.is_null())
            }
            Predicate::Flag {
                field,
                value,
                missing_as,
            } => {
                let actual = lookup_path(payload, field)
                    .and_then(Value::as_bool)
                    .unwrap_or(*missing_as);
                actual == *value
            }
            Predicate::And { all } => all.iter().all(|p| p.matches(payload)),
            Predicate::Or { any } => any.iter().any(|p| p.matches(payload)),
            Predicate::Not { predicate } => !predicate.matches(payload),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::All
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("*"),
            Predicate::Eq { field, value } => write!(f, "{} == {}", field, value),
            Predicate::Ne { field, value } => write!(f, "{} != {}", field, value),
            Predicate::In { field, values } => write!(f, "{} in {}", field, values),
            Predicate::Exists { field } => write!(f, "{} exists", field),
            Predicate::Flag { field, value, .. } => write!(f, "{} is {}", field, value),
            Predicate::And { all } => write_joined(f, all, " && "),
            Predicate::Or { any } => write_joined(f, any, " || "),
            Predicate::Not { predicate } => write!(f, "!({})", predicate),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", part)?;
    }
    f.write_str(")")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, Profile, Role};
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn session() -> SessionContext {
        SessionContext::new(
            Identity::new("x@y.com"),
            Profile::new(Role::Client).with_linked(vec![Identity::new("team@y.com")]),
        )
    }

    #[test]
    fn test_eq_identity_binding() {
        let p = Predicate::eq("owner", Operand::Identity);
        assert!(!p.is_bound());
        assert!(!p.matches(&payload(json!({"owner": "x@y.com"}))));

        let bound = p.bind(&session());
        assert!(bound.is_bound());
        assert!(bound.matches(&payload(json!({"owner": "x@y.com"}))));
        assert!(!bound.matches(&payload(json!({"owner": "z@y.com"}))));
    }

    #[test]
    fn test_identity_or_linked() {
        let p = Predicate::eq("client", Operand::IdentityOrLinked).bind(&session());
        assert!(p.matches(&payload(json!({"client": "team@y.com"}))));
        assert!(p.matches(&payload(json!({"client": "x@y.com"}))));
        assert!(!p.matches(&payload(json!({"client": "other@y.com"}))));
    }

    #[test]
    fn test_in_and_ne() {
        let p = Predicate::is_in("status", Operand::literal(json!(["open", "review"])));
        assert!(p.matches(&payload(json!({"status": "review"}))));
        assert!(!p.matches(&payload(json!({"status": "closed"}))));

        let ne = Predicate::ne("status", Operand::literal("closed"));
        assert!(ne.matches(&payload(json!({"status": "open"}))));
        assert!(!ne.matches(&payload(json!({"status": "closed"}))));
        assert!(!ne.matches(&payload(json!({}))));
    }

    #[test]
    fn test_flag_missing_policy() {
        let unread_strict = Predicate::flag("read", false, true);
        assert!(unread_strict.matches(&payload(json!({"read": false}))));
        assert!(!unread_strict.matches(&payload(json!({"read": true}))));
        assert!(!unread_strict.matches(&payload(json!({}))));

        let unread_lenient = Predicate::flag("read", false, false);
        assert!(unread_lenient.matches(&payload(json!({}))));
    }

    #[test]
    fn test_combinators() {
        let p = Predicate::and(vec![
            Predicate::exists("owner"),
            Predicate::not(Predicate::eq("archived", Operand::literal(true))),
        ]);
        assert!(p.matches(&payload(json!({"owner": "a"}))));
        assert!(!p.matches(&payload(json!({"owner": "a", "archived": true}))));
        assert!(!p.matches(&payload(json!({"owner": null}))));
    }

    #[test]
    fn test_json_shape() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "and",
            "all": [
                {"op": "eq", "field": "owner", "value": {"kind": "identity"}},
                {"op": "flag", "field": "read", "value": false, "missing_as": true}
            ]
        }))
        .unwrap();
        assert_eq!(p.to_string(), "(owner == $identity && read is false)");
    }
}
