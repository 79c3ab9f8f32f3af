//! Aggregation tables for the portal's built-in views.
//!
//! The client and master notification badges used to be two hand-written
//! variants of the same logic; here they are two tables for one engine.

use super::{EngineConfig, QuerySpec};
use crate::predicate::{Operand, Predicate};
use crate::subscriptions::SyncPolicy;
use crate::types::Role;
use crate::view::{BucketDef, ListDef, OrderBy};

pub const NOTIFICATIONS: &str = "notifications";
pub const PROJECTS: &str = "projects";
pub const ARCHIVED_PROJECTS: &str = "archivedProjects";
pub const PAYMENTS: &str = "payments";

/// Value assumed for a missing `read` flag. Older documents predate the
/// flag; they are treated as already read so they do not inflate badges.
pub const MISSING_READ_FLAG: bool = true;

fn unread(field: &str) -> Predicate {
    Predicate::flag(field, false, MISSING_READ_FLAG)
}

/// Badges shown to clients.
pub fn client_notifications() -> EngineConfig {
    let client = || vec![Role::Client];
    EngineConfig::new()
        .query(
            QuerySpec::new(NOTIFICATIONS, Predicate::eq("recipient", Operand::Identity))
                .for_roles(client()),
        )
        // A project is reachable both as owner and as contact.
        .query(
            QuerySpec::new(PROJECTS, Predicate::eq("clientEmail", Operand::IdentityOrLinked))
                .for_roles(client()),
        )
        .query(
            QuerySpec::new(PROJECTS, Predicate::eq("contactEmail", Operand::Identity))
                .for_roles(client()),
        )
        .query(
            QuerySpec::new(PAYMENTS, Predicate::eq("clientEmail", Operand::IdentityOrLinked))
                .with_sync(SyncPolicy::FullReplace)
                .for_roles(client()),
        )
        .bucket(BucketDef::new("unread", vec![NOTIFICATIONS], unread("read")))
        .bucket(BucketDef::new("projectUpdates", vec![PROJECTS], unread("clientRead")))
        .bucket(BucketDef::new(
            "pendingPayments",
            vec![PAYMENTS],
            Predicate::eq("status", Operand::literal("pending")),
        ))
}

/// Badges shown in the master console.
pub fn master_notifications() -> EngineConfig {
    let master = || vec![Role::Master];
    EngineConfig::new()
        .query(
            QuerySpec::new(NOTIFICATIONS, Predicate::eq("audience", Operand::literal("master")))
                .for_roles(master()),
        )
        .query(
            QuerySpec::new(
                PROJECTS,
                Predicate::is_in("status", Operand::literal(vec!["new", "quoteRequested"])),
            )
            .for_roles(master()),
        )
        .query(
            QuerySpec::new(PROJECTS, unread("masterRead")).for_roles(master()),
        )
        .query(
            QuerySpec::new(PAYMENTS, Predicate::eq("status", Operand::literal("submitted")))
                .with_sync(SyncPolicy::FullReplace)
                .for_roles(master()),
        )
        .bucket(BucketDef::new("unread", vec![NOTIFICATIONS], unread("read")))
        .bucket(BucketDef::new(
            "newProjects",
            vec![PROJECTS],
            Predicate::is_in("status", Operand::literal(vec!["new", "quoteRequested"])),
        ))
        .bucket(BucketDef::new("projectUpdates", vec![PROJECTS], unread("masterRead")))
        .bucket(BucketDef::new(
            "paymentsToReview",
            vec![PAYMENTS],
            Predicate::eq("status", Operand::literal("submitted")),
        ))
}

/// Client project table spanning active and archived projects.
pub fn project_listing() -> EngineConfig {
    let mine = || Predicate::eq("clientEmail", Operand::IdentityOrLinked);
    EngineConfig::new()
        .query(QuerySpec::new(PROJECTS, mine()))
        .query(QuerySpec::new(ARCHIVED_PROJECTS, mine()))
        .list(
            ListDef::new("projects", vec![PROJECTS, ARCHIVED_PROJECTS], Predicate::All)
                .order_by(OrderBy::desc("createdAt")),
        )
        .list(
            ListDef::new(
                "active",
                vec![PROJECTS],
                Predicate::ne("status", Operand::literal("completed")),
            )
            .order_by(OrderBy::desc("createdAt")),
        )
}
