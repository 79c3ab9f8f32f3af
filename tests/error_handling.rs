//! Error containment and edge case tests.

use livemerge::{
    presets, Aggregator, ChangeOp, DocumentChange, EngineConfig, EngineError, Identity,
    LifecycleState, MemorySource, Operand, Predicate, Profile, QuerySnapshot, QuerySpec, Role,
    StaticIdentityProvider, SyncPolicy,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLIENT: &str = "client@example.com";

fn provider() -> Arc<StaticIdentityProvider> {
    Arc::new(
        StaticIdentityProvider::new()
            .with_profile(Identity::new(CLIENT), Profile::new(Role::Client)),
    )
}

fn client_engine(source: &Arc<MemorySource>) -> Aggregator {
    let config = presets::client_notifications().debounce_window(Duration::from_millis(20));
    Aggregator::new(config, source.clone(), provider()).unwrap()
}

// --- Configuration Errors ---

#[test]
fn test_zero_debounce_window_rejected() {
    let config = EngineConfig::new().debounce_window(Duration::ZERO);
    let result = Aggregator::new(config, Arc::new(MemorySource::new()), provider());
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_empty_collection_rejected() {
    let config = EngineConfig::new().query(QuerySpec::new("", Predicate::All));
    let result = Aggregator::new(config, Arc::new(MemorySource::new()), provider());
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_malformed_json_config() {
    let result = EngineConfig::from_json_str("{\"queries\": 3}");
    assert!(matches!(result, Err(EngineError::Serialization(_))));
}

#[test]
fn test_full_replace_sharing_collection_rejected() {
    let config = EngineConfig::new()
        .query(
            QuerySpec::new("payments", Predicate::eq("client", Operand::Identity))
                .with_sync(SyncPolicy::FullReplace),
        )
        .query(
            QuerySpec::new("payments", Predicate::eq("payer", Operand::Identity))
                .with_sync(SyncPolicy::FullReplace),
        );
    assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

    let result = Aggregator::new(config, Arc::new(MemorySource::new()), provider());
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

// --- Source Errors ---

#[test]
fn test_unavailable_source_does_not_block_siblings() {
    let source = Arc::new(MemorySource::new());
    source.fail_collection(presets::PAYMENTS);
    source.upsert(presets::NOTIFICATIONS, "n1", json!({"recipient": CLIENT, "read": false}));
    let engine = client_engine(&source);

    engine.start(Identity::new(CLIENT)).unwrap();
    assert_eq!(engine.state(), LifecycleState::Active);
    assert_eq!(engine.stats().sources_failed, 1);
    assert_eq!(source.active_subscriptions(), 3);
    assert_eq!(engine.descriptors().len(), 3);
    assert_eq!(engine.buckets().count("unread"), 1);
    assert!(engine.last_error().is_none());
}

#[test]
fn test_restored_source_opens_on_next_session() {
    let source = Arc::new(MemorySource::new());
    source.fail_collection(presets::PAYMENTS);
    source.upsert(presets::PAYMENTS, "pay1", json!({"clientEmail": CLIENT, "status": "pending"}));
    let engine = client_engine(&source);

    engine.start(Identity::new(CLIENT)).unwrap();
    assert_eq!(engine.buckets().count("pendingPayments"), 0);

    source.restore_collection(presets::PAYMENTS);
    engine.stop();
    engine.start(Identity::new(CLIENT)).unwrap();
    assert_eq!(source.active_subscriptions(), 4);
    assert_eq!(engine.buckets().count("pendingPayments"), 1);
    assert_eq!(engine.stats().sources_failed, 1);
}

#[test]
fn test_delivery_error_keeps_last_known_state() {
    let source = Arc::new(MemorySource::new());
    source.upsert(presets::NOTIFICATIONS, "n1", json!({"recipient": CLIENT, "read": false}));
    let engine = client_engine(&source);
    engine.start(Identity::new(CLIENT)).unwrap();

    source.emit_error(presets::NOTIFICATIONS, "permission denied");
    assert_eq!(engine.stats().delivery_errors, 1);
    assert_eq!(engine.documents().len(), 1);
    assert_eq!(engine.state(), LifecycleState::Active);

    // Later deliveries on the same query still apply.
    source.upsert(presets::NOTIFICATIONS, "n2", json!({"recipient": CLIENT, "read": false}));
    assert_eq!(engine.buckets().count("unread"), 2);
}

#[test]
fn test_malformed_batch_is_rejected_whole() {
    let source = Arc::new(MemorySource::new());
    source.upsert(presets::NOTIFICATIONS, "n1", json!({"recipient": CLIENT, "read": false}));
    let engine = client_engine(&source);
    engine.start(Identity::new(CLIENT)).unwrap();
    let applied = engine.stats().batches_applied;

    source.deliver_raw(
        presets::NOTIFICATIONS,
        QuerySnapshot {
            documents: Vec::new(),
            changes: vec![
                DocumentChange::removed("n1"),
                DocumentChange {
                    id: "n2".into(),
                    op: ChangeOp::Added,
                    payload: None,
                },
            ],
        },
    );

    assert_eq!(engine.stats().batches_rejected, 1);
    assert_eq!(engine.stats().batches_applied, applied);
    assert_eq!(engine.documents().len(), 1);
}

#[test]
fn test_failing_disposer_is_counted_once() {
    let source = Arc::new(MemorySource::new());
    source.fail_dispose(presets::PROJECTS);
    let engine = client_engine(&source);
    engine.start(Identity::new(CLIENT)).unwrap();

    let report = engine.stop();
    assert_eq!(report.disposed, 4);
    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .all(|e| matches!(e, EngineError::Teardown { .. })));
    assert_eq!(engine.stats().teardown_failures, 2);

    assert!(engine.stop().failures.is_empty());
    assert_eq!(engine.stats().teardown_failures, 2);
}

// --- Profile Errors ---

#[test]
fn test_profile_error_recovers_on_retry() {
    let source = Arc::new(MemorySource::new());
    let identities = Arc::new(StaticIdentityProvider::new());
    let engine = Aggregator::new(
        presets::client_notifications(),
        source.clone(),
        identities.clone(),
    )
    .unwrap();

    let err = engine.start(Identity::new(CLIENT)).unwrap_err();
    assert!(err.is_user_visible());
    assert_eq!(engine.last_error(), Some(err));
    assert_eq!(source.subscribe_calls(), 0);

    identities.insert_profile(Identity::new(CLIENT), Profile::new(Role::Client));
    engine.start(Identity::new(CLIENT)).unwrap();
    assert_eq!(engine.state(), LifecycleState::Active);
    assert!(engine.last_error().is_none());
}

#[test]
fn test_unknown_role_opens_no_role_queries() {
    let source = Arc::new(MemorySource::new());
    let identities = Arc::new(StaticIdentityProvider::new().with_profile(
        Identity::new(CLIENT),
        Profile::new(Role::Other("auditor".into())),
    ));
    let engine =
        Aggregator::new(presets::client_notifications(), source.clone(), identities).unwrap();

    engine.start(Identity::new(CLIENT)).unwrap();
    assert_eq!(engine.state(), LifecycleState::Active);
    assert_eq!(source.active_subscriptions(), 0);
    assert_eq!(engine.buckets().count("unread"), 0);
}

// --- Listener Errors ---

#[test]
fn test_panicking_listener_does_not_poison_engine() {
    let source = Arc::new(MemorySource::new());
    source.upsert(presets::NOTIFICATIONS, "n1", json!({"recipient": CLIENT, "read": false}));
    let engine = client_engine(&source);

    let _bad = engine.on_buckets_changed(|_| panic!("listener failure"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let _good = engine.on_buckets_changed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    engine.start(Identity::new(CLIENT)).unwrap();
    engine.publish_now();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    source.upsert(presets::NOTIFICATIONS, "n2", json!({"recipient": CLIENT}));
    engine.publish_now();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unsubscribed_listener_is_not_called() {
    let source = Arc::new(MemorySource::new());
    let engine = client_engine(&source);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let guard = engine.on_view_changed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    guard.unsubscribe();

    engine.start(Identity::new(CLIENT)).unwrap();
    engine.publish_now();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_predicate_binding_in_descriptors() {
    let source = Arc::new(MemorySource::new());
    let engine = client_engine(&source);
    engine.start(Identity::new(CLIENT)).unwrap();

    let descriptors = source.descriptors();
    assert_eq!(descriptors.len(), 4);
    assert!(descriptors.iter().all(|d| d.predicate.is_bound()));
    assert!(descriptors.iter().any(|d| d.predicate
        == Predicate::eq("recipient", Operand::literal(CLIENT))));
}
