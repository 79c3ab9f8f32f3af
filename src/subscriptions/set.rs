//! Owned set of live-query subscriptions with one-shot bulk teardown.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    ChangeCallback, Disposer, ErrorCallback, EstablishReport, LiveQuerySource, QueryDescriptor,
    QuerySnapshot, SourceError, SubscriptionId, SubscriptionStatus, TeardownReport,
};

/// Internal subscription state.
struct Entry {
    id: SubscriptionId,
    descriptor: QueryDescriptor,
    disposer: Disposer,
}

/// Owns the active live-query handles of one session.
///
/// Callbacks handed to the source are wrapped so that once the set is
/// disposed they return without calling through. The owner must still
/// guard its own state against a callback that was already past that check
/// when disposal began.
pub struct SubscriptionSet {
    source: Arc<dyn LiveQuerySource>,
    entries: Mutex<Vec<Entry>>,
    disposed: Arc<AtomicBool>,
    /// Callbacks that arrived after disposal and were dropped.
    late_callbacks: Arc<AtomicU64>,
    next_id: AtomicU64,
}

impl SubscriptionSet {
    pub fn new(source: Arc<dyn LiveQuerySource>) -> Self {
        Self::with_late_counter(source, Arc::new(AtomicU64::new(0)))
    }

    /// Create a set that counts late callbacks into a shared counter.
    pub fn with_late_counter(source: Arc<dyn LiveQuerySource>, counter: Arc<AtomicU64>) -> Self {
        Self {
            source,
            entries: Mutex::new(Vec::new()),
            disposed: Arc::new(AtomicBool::new(false)),
            late_callbacks: counter,
            next_id: AtomicU64::new(1),
        }
    }

    /// Open one live query.
    ///
    /// Overlapping descriptors are allowed; deduplication happens downstream.
    pub fn add(
        &self,
        descriptor: QueryDescriptor,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> Result<SubscriptionId> {
        if self.is_disposed() {
            return Err(EngineError::SourceUnavailable {
                descriptor: descriptor.to_string(),
                reason: "subscription set already disposed".into(),
            });
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (on_change, on_error) = self.guard(on_change, on_error);

        // The source may deliver synchronously, so no lock is held here.
        let disposer = match self.source.subscribe(&descriptor, on_change, on_error) {
            Ok(disposer) => disposer,
            Err(e) => {
                warn!(%descriptor, error = %e, "source unavailable");
                return Err(EngineError::SourceUnavailable {
                    descriptor: descriptor.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut entries = self.entries.lock();
        if self.is_disposed() {
            drop(entries);
            // Lost the race with dispose_all; release immediately.
            release(&descriptor, disposer);
            return Err(EngineError::SourceUnavailable {
                descriptor: descriptor.to_string(),
                reason: "subscription set disposed while establishing".into(),
            });
        }
        debug!(subscription = id.0, %descriptor, "subscription established");
        entries.push(Entry {
            id,
            descriptor,
            disposer,
        });
        Ok(id)
    }

    /// Open every descriptor; a failing one never stops the others.
    pub fn add_all<F>(&self, descriptors: Vec<QueryDescriptor>, mut callbacks: F) -> EstablishReport
    where
        F: FnMut(&QueryDescriptor) -> (ChangeCallback, ErrorCallback),
    {
        let mut report = EstablishReport::default();
        for descriptor in descriptors {
            let (on_change, on_error) = callbacks(&descriptor);
            match self.add(descriptor, on_change, on_error) {
                Ok(id) => report.established.push(id),
                Err(e) => report.failures.push(e),
            }
        }
        report
    }

    /// Dispose every subscription exactly once.
    ///
    /// Idempotent: a second call returns an empty report.
    pub fn dispose_all(&self) -> TeardownReport {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return TeardownReport::default();
        }

        let entries = std::mem::take(&mut *self.entries.lock());
        let mut report = TeardownReport::default();
        for entry in entries {
            let descriptor = entry.descriptor.to_string();
            match entry.disposer.dispose() {
                Ok(()) => report.disposed += 1,
                Err(e) => {
                    // Assume the resource is already gone; no retry.
                    warn!(subscription = entry.id.0, %descriptor, error = %e, "disposer failed");
                    report.disposed += 1;
                    report.failures.push(EngineError::Teardown {
                        descriptor,
                        reason: e.to_string(),
                    });
                }
            }
        }
        debug!(disposed = report.disposed, "subscription set disposed");
        report
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn status(&self, id: SubscriptionId) -> Option<SubscriptionStatus> {
        if self.is_disposed() {
            return (id.0 < self.next_id.load(Ordering::SeqCst)).then_some(SubscriptionStatus::Disposed);
        }
        self.entries
            .lock()
            .iter()
            .any(|e| e.id == id)
            .then_some(SubscriptionStatus::Active)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self) -> Vec<QueryDescriptor> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Callbacks dropped because they arrived after disposal.
    pub fn late_callbacks(&self) -> u64 {
        self.late_callbacks.load(Ordering::SeqCst)
    }

    fn guard(
        &self,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> (ChangeCallback, ErrorCallback) {
        let disposed = Arc::clone(&self.disposed);
        let late = Arc::clone(&self.late_callbacks);
        let guarded_change: ChangeCallback = Arc::new(move |snapshot: QuerySnapshot| {
            if disposed.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::Relaxed);
                return;
            }
            on_change(snapshot)
        });

        let disposed = Arc::clone(&self.disposed);
        let late = Arc::clone(&self.late_callbacks);
        let guarded_error: ErrorCallback = Arc::new(move |error: SourceError| {
            if disposed.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::Relaxed);
                return;
            }
            on_error(error)
        });

        (guarded_change, guarded_error)
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

fn release(descriptor: &QueryDescriptor, disposer: Disposer) {
    if let Err(e) = disposer.dispose() {
        warn!(%descriptor, error = %e, "disposer failed");
    }
}
