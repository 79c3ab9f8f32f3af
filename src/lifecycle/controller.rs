//! The aggregation engine: one owned context per session.

use super::identity::IdentityProvider;
use super::listeners::{ListenerGuard, Registry};
use super::{EngineStats, LifecycleState, StateChange};
use crate::config::{EngineConfig, SessionPlan};
use crate::debounce::DebounceScheduler;
use crate::error::{EngineError, Result};
use crate::merge::{MergeStore, StoreSnapshot};
use crate::subscriptions::{
    ChangeCallback, ErrorCallback, LiveQuerySource, QueryDescriptor, QuerySnapshot, SourceError,
    SubscriptionSet, TeardownReport,
};
use crate::types::{DocumentRecord, Identity, SessionContext};
use crate::view::{compute_buckets, compute_lists, BucketCounts, ViewUpdate};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Everything owned by one signed-in session.
struct Session {
    epoch: u64,
    context: SessionContext,
    plan: Arc<SessionPlan>,
    store: MergeStore,
    subscriptions: Arc<SubscriptionSet>,
}

/// Mutable engine state, guarded by one lock.
struct Slot {
    state: LifecycleState,
    /// Bumped on every start and teardown; callbacks and publishes carry
    /// the epoch they were created for and no-op on mismatch.
    epoch: u64,
    pending_identity: Option<Identity>,
    session: Option<Session>,
    last_error: Option<EngineError>,
    latest: Option<Arc<ViewUpdate>>,
}

impl Slot {
    fn live_session(&self, epoch: u64) -> Option<&Session> {
        if !self.state.is_live() {
            return None;
        }
        self.session.as_ref().filter(|s| s.epoch == epoch)
    }

    fn live_session_mut(&mut self, epoch: u64) -> Option<&mut Session> {
        if !self.state.is_live() {
            return None;
        }
        self.session.as_mut().filter(|s| s.epoch == epoch)
    }
}

#[derive(Default)]
struct Counters {
    sessions_started: AtomicU64,
    batches_applied: AtomicU64,
    batches_rejected: AtomicU64,
    delivery_errors: AtomicU64,
    publishes: AtomicU64,
    sources_failed: AtomicU64,
    late_callbacks: Arc<AtomicU64>,
    teardown_failures: AtomicU64,
}

struct Inner {
    config: EngineConfig,
    source: Arc<dyn LiveQuerySource>,
    identity: Arc<dyn IdentityProvider>,
    debounce: DebounceScheduler,
    slot: Mutex<Slot>,
    counters: Counters,
    bucket_listeners: Arc<Registry<BucketCounts>>,
    document_listeners: Arc<Registry<[Arc<DocumentRecord>]>>,
    list_listeners: Arc<Registry<BTreeMap<String, Vec<Arc<DocumentRecord>>>>>,
    view_listeners: Arc<Registry<ViewUpdate>>,
    state_listeners: Arc<Registry<StateChange>>,
}

/// Real-time aggregation engine.
///
/// Opens the live queries configured for the session's role, merges their
/// deliveries into one deduplicated store, and publishes derived buckets and
/// lists at most once per debounce window. Dropping the engine tears the
/// session down.
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn LiveQuerySource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let debounce = DebounceScheduler::new(config.debounce_window)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                identity,
                debounce,
                slot: Mutex::new(Slot {
                    state: LifecycleState::Idle,
                    epoch: 0,
                    pending_identity: None,
                    session: None,
                    last_error: None,
                    latest: None,
                }),
                counters: Counters::default(),
                bucket_listeners: Registry::new("buckets"),
                document_listeners: Registry::new("documents"),
                list_listeners: Registry::new("lists"),
                view_listeners: Registry::new("views"),
                state_listeners: Registry::new("states"),
            }),
        })
    }

    // --- Lifecycle ---

    /// Start a session for `identity`.
    ///
    /// Blocks on the profile lookup without holding the engine lock. If the
    /// engine is already active for the same identity this is a no-op, and a
    /// second start for an identity still initializing is refused. Any other
    /// identity replaces the current or in-flight session. If the session is
    /// torn down while the lookup runs, nothing is opened.
    pub fn start(&self, identity: Identity) -> Result<()> {
        let epoch = {
            let mut slot = self.inner.slot.lock();
            let state = slot.state;
            match state {
                LifecycleState::Idle => {}
                LifecycleState::Active => {
                    let same = slot
                        .session
                        .as_ref()
                        .map_or(false, |s| s.context.identity == identity);
                    if same {
                        return Ok(());
                    }
                    drop(slot);
                    debug!(%identity, "identity changed; restarting session");
                    self.inner.teardown("identity changed");
                    return self.start(identity);
                }
                LifecycleState::Initializing => {
                    if slot.pending_identity.as_ref() == Some(&identity) {
                        return Err(EngineError::AlreadyInitializing);
                    }
                    // The in-flight start sees the epoch move and gives up.
                    drop(slot);
                    debug!(%identity, "identity changed during initialization");
                    self.inner.teardown("identity changed");
                    return self.start(identity);
                }
                LifecycleState::TearingDown => {
                    return Err(EngineError::AlreadyInitializing);
                }
            }
            slot.state = LifecycleState::Initializing;
            slot.epoch += 1;
            slot.pending_identity = Some(identity.clone());
            slot.last_error = None;
            slot.epoch
        };
        debug!(%identity, epoch, "initializing session");
        self.inner.emit_state(LifecycleState::Initializing, None);

        let profile = match self.inner.identity.resolve_profile(&identity) {
            Ok(profile) => profile,
            Err(e) => {
                let error = match e {
                    EngineError::ProfileResolution(_) => e,
                    other => EngineError::ProfileResolution(other.to_string()),
                };
                warn!(%identity, error = %error, "profile resolution failed");
                let current = {
                    let mut slot = self.inner.slot.lock();
                    let current =
                        slot.epoch == epoch && slot.state == LifecycleState::Initializing;
                    if current {
                        slot.state = LifecycleState::Idle;
                        slot.pending_identity = None;
                        slot.last_error = Some(error.clone());
                    }
                    current
                };
                if current {
                    self.inner
                        .emit_state(LifecycleState::Idle, Some(error.clone()));
                }
                return Err(error);
            }
        };

        let context = SessionContext::new(identity, profile);
        let plan = Arc::new(self.inner.config.plan(&context));
        let subscriptions = Arc::new(SubscriptionSet::with_late_counter(
            Arc::clone(&self.inner.source),
            Arc::clone(&self.inner.counters.late_callbacks),
        ));

        {
            let mut slot = self.inner.slot.lock();
            if slot.epoch != epoch || slot.state != LifecycleState::Initializing {
                debug!(epoch, "initialization superseded before subscribing");
                return Ok(());
            }
            slot.session = Some(Session {
                epoch,
                context: context.clone(),
                plan: Arc::clone(&plan),
                store: MergeStore::new(),
                subscriptions: Arc::clone(&subscriptions),
            });
        }

        // Initial snapshots may arrive synchronously from here.
        let weak = Arc::downgrade(&self.inner);
        let report = subscriptions.add_all(plan.descriptors.clone(), |descriptor| {
            Inner::callbacks(&weak, epoch, descriptor)
        });

        let activated = {
            let mut slot = self.inner.slot.lock();
            let current = slot.epoch == epoch && slot.state == LifecycleState::Initializing;
            if current {
                slot.state = LifecycleState::Active;
                slot.pending_identity = None;
            }
            current
        };
        if !activated {
            debug!(epoch, "initialization superseded while subscribing");
            return Ok(());
        }

        self.inner
            .counters
            .sources_failed
            .fetch_add(report.failures.len() as u64, Ordering::SeqCst);
        self.inner
            .counters
            .sessions_started
            .fetch_add(1, Ordering::SeqCst);
        info!(
            identity = %context.identity,
            role = ?context.role(),
            subscriptions = report.established.len(),
            failed = report.failures.len(),
            "session active"
        );
        self.inner.emit_state(LifecycleState::Active, None);
        // Consumers get a first view even if no query delivers anything.
        Inner::schedule_publish(&self.inner, epoch);
        Ok(())
    }

    /// Tear down the current session, if any. Safe to call repeatedly.
    pub fn stop(&self) -> TeardownReport {
        self.inner.teardown("stopped")
    }

    /// Follow an identity change: `None` means signed out.
    pub fn sync_identity(&self, identity: Option<Identity>) -> Result<()> {
        match identity {
            Some(identity) => self.start(identity),
            None => {
                self.inner.teardown("signed out");
                Ok(())
            }
        }
    }

    /// Re-read the current identity from the provider and follow it.
    pub fn refresh(&self) -> Result<()> {
        let identity = self.inner.identity.current_identity();
        self.sync_identity(identity)
    }

    // --- Reads ---

    pub fn state(&self) -> LifecycleState {
        self.inner.slot.lock().state
    }

    /// The last user-visible error (profile resolution), cleared on the next
    /// start.
    pub fn last_error(&self) -> Option<EngineError> {
        self.inner.slot.lock().last_error.clone()
    }

    /// Identity of the active session, or of the one being initialized.
    pub fn identity(&self) -> Option<Identity> {
        let slot = self.inner.slot.lock();
        slot.session
            .as_ref()
            .map(|s| s.context.identity.clone())
            .or_else(|| slot.pending_identity.clone())
    }

    pub fn session(&self) -> Option<SessionContext> {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(|s| s.context.clone())
    }

    /// Current merged store contents (not waiting for the next publish).
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(|s| s.store.snapshot())
            .unwrap_or_default()
    }

    /// Every merged, deduplicated document, ordered by composite key.
    pub fn documents(&self) -> Vec<Arc<DocumentRecord>> {
        self.snapshot().documents()
    }

    /// Buckets computed from the current store contents.
    pub fn buckets(&self) -> BucketCounts {
        match self.current_plan() {
            Some((snapshot, plan)) => compute_buckets(&snapshot, &plan.buckets),
            None => BucketCounts::default(),
        }
    }

    /// One named list computed from the current store contents.
    pub fn list(&self, name: &str) -> Option<Vec<Arc<DocumentRecord>>> {
        let (snapshot, plan) = self.current_plan()?;
        let def = plan.lists.iter().find(|l| l.name == name)?;
        compute_lists(&snapshot, std::slice::from_ref(def)).remove(name)
    }

    /// The last published view of the current session.
    pub fn latest_view(&self) -> Option<Arc<ViewUpdate>> {
        self.inner.slot.lock().latest.clone()
    }

    /// Descriptors of the subscriptions currently open.
    pub fn descriptors(&self) -> Vec<QueryDescriptor> {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(|s| s.subscriptions.descriptors())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            sessions_started: c.sessions_started.load(Ordering::SeqCst),
            batches_applied: c.batches_applied.load(Ordering::SeqCst),
            batches_rejected: c.batches_rejected.load(Ordering::SeqCst),
            delivery_errors: c.delivery_errors.load(Ordering::SeqCst),
            publishes: c.publishes.load(Ordering::SeqCst),
            sources_failed: c.sources_failed.load(Ordering::SeqCst),
            late_callbacks_ignored: c.late_callbacks.load(Ordering::SeqCst),
            teardown_failures: c.teardown_failures.load(Ordering::SeqCst),
        }
    }

    /// Skip the quiet window and publish the current view now.
    ///
    /// Runs under the scheduler's firing guard, so a racing `stop` returns
    /// only after listeners have been notified.
    pub fn publish_now(&self) {
        let epoch = self.inner.slot.lock().epoch;
        let inner = &self.inner;
        inner.debounce.run_now(|| inner.publish(epoch));
    }

    // --- Listeners ---

    /// Called with the bucket map after each debounce window.
    pub fn on_buckets_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&BucketCounts) + Send + Sync + 'static,
    {
        self.inner.bucket_listeners.add(listener)
    }

    /// Called with the full merged document list after each debounce window.
    pub fn on_documents_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&[Arc<DocumentRecord>]) + Send + Sync + 'static,
    {
        self.inner.document_listeners.add(listener)
    }

    /// Called with every configured list after each debounce window.
    pub fn on_lists_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&BTreeMap<String, Vec<Arc<DocumentRecord>>>) + Send + Sync + 'static,
    {
        self.inner.list_listeners.add(listener)
    }

    /// Called with the whole published view (buckets, lists, documents).
    pub fn on_view_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&ViewUpdate) + Send + Sync + 'static,
    {
        self.inner.view_listeners.add(listener)
    }

    /// Called on every lifecycle transition.
    pub fn on_state_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.state_listeners.add(listener)
    }

    fn current_plan(&self) -> Option<(StoreSnapshot, Arc<SessionPlan>)> {
        let slot = self.inner.slot.lock();
        let session = slot.session.as_ref()?;
        Some((session.store.snapshot(), Arc::clone(&session.plan)))
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.inner.teardown("engine dropped");
    }
}

impl Inner {
    fn callbacks(
        weak: &Weak<Inner>,
        epoch: u64,
        descriptor: &QueryDescriptor,
    ) -> (ChangeCallback, ErrorCallback) {
        let change_weak = Weak::clone(weak);
        let change_descriptor = descriptor.clone();
        let on_change: ChangeCallback = Arc::new(move |snapshot: QuerySnapshot| {
            if let Some(inner) = change_weak.upgrade() {
                inner.apply_delivery(epoch, &change_descriptor, snapshot);
            }
        });

        let error_weak = Weak::clone(weak);
        let error_descriptor = descriptor.clone();
        let on_error: ErrorCallback = Arc::new(move |error: SourceError| {
            if let Some(inner) = error_weak.upgrade() {
                inner.delivery_error(epoch, &error_descriptor, error);
            }
        });

        (on_change, on_error)
    }

    fn apply_delivery(
        self: &Arc<Self>,
        epoch: u64,
        descriptor: &QueryDescriptor,
        snapshot: QuerySnapshot,
    ) {
        let event = snapshot.into_event(descriptor);
        let mut slot = self.slot.lock();
        let Some(session) = slot.live_session_mut(epoch) else {
            self.counters.late_callbacks.fetch_add(1, Ordering::SeqCst);
            debug!(%descriptor, epoch, "ignoring delivery for a finished session");
            return;
        };

        match session.store.reduce(event) {
            Ok(outcome) => {
                self.counters.batches_applied.fetch_add(1, Ordering::SeqCst);
                debug!(
                    %descriptor,
                    upserted = outcome.upserted,
                    removed = outcome.removed,
                    version = outcome.version,
                    "batch applied"
                );
                // Scheduled under the lock so a concurrent teardown's cancel
                // always comes after it.
                Inner::schedule_publish(self, epoch);
            }
            Err(e) => {
                self.counters.batches_rejected.fetch_add(1, Ordering::SeqCst);
                warn!(%descriptor, error = %e, "delivery rejected; keeping last-known state");
            }
        }
    }

    fn delivery_error(&self, epoch: u64, descriptor: &QueryDescriptor, error: SourceError) {
        if self.slot.lock().live_session(epoch).is_none() {
            self.counters.late_callbacks.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.counters.delivery_errors.fetch_add(1, Ordering::SeqCst);
        let error = EngineError::transient(descriptor.collection.clone(), error.0);
        warn!(%descriptor, error = %error, "live query reported an error; keeping last-known state");
    }

    fn schedule_publish(inner: &Arc<Inner>, epoch: u64) {
        let weak = Arc::downgrade(inner);
        inner.debounce.schedule(move || {
            if let Some(inner) = weak.upgrade() {
                inner.publish(epoch);
            }
        });
    }

    fn publish(&self, epoch: u64) {
        let (snapshot, plan) = {
            let slot = self.slot.lock();
            let Some(session) = slot.live_session(epoch) else {
                return;
            };
            (session.store.snapshot(), Arc::clone(&session.plan))
        };

        let update = Arc::new(ViewUpdate::compute(&snapshot, &plan.buckets, &plan.lists));
        {
            let mut slot = self.slot.lock();
            if slot.live_session(epoch).is_none() {
                return;
            }
            slot.latest = Some(Arc::clone(&update));
        }

        self.counters.publishes.fetch_add(1, Ordering::SeqCst);
        debug!(version = update.version, buckets = ?update.buckets.counts(), "publishing view");
        self.bucket_listeners.notify(&update.buckets);
        self.document_listeners.notify(update.documents.as_slice());
        self.list_listeners.notify(&update.lists);
        self.view_listeners.notify(&update);
    }

    fn teardown(&self, reason: &str) -> TeardownReport {
        let session = {
            let mut slot = self.slot.lock();
            if !slot.state.is_live() {
                return TeardownReport::default();
            }
            slot.state = LifecycleState::TearingDown;
            slot.epoch += 1;
            slot.pending_identity = None;
            slot.latest = None;
            slot.session.take()
        };
        self.emit_state(LifecycleState::TearingDown, None);

        self.debounce.cancel();
        let report = session
            .as_ref()
            .map(|s| s.subscriptions.dispose_all())
            .unwrap_or_default();
        self.counters
            .teardown_failures
            .fetch_add(report.failures.len() as u64, Ordering::SeqCst);
        drop(session);

        {
            let mut slot = self.slot.lock();
            if slot.state == LifecycleState::TearingDown {
                slot.state = LifecycleState::Idle;
            }
        }
        info!(
            reason,
            disposed = report.disposed,
            failed = report.failures.len(),
            "session torn down"
        );
        self.emit_state(LifecycleState::Idle, None);
        report
    }

    fn emit_state(&self, state: LifecycleState, error: Option<EngineError>) {
        self.state_listeners.notify(&StateChange { state, error });
    }
}
