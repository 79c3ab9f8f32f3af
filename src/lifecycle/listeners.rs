//! Consumer listener registries.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of callbacks for one kind of notification.
pub(crate) struct Registry<T: ?Sized> {
    name: &'static str,
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Listener<T>)>>,
}

impl<T: ?Sized + 'static> Registry<T> {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn add<F>(self: &Arc<Self>, listener: F) -> ListenerGuard
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push((id, Arc::new(listener)));

        let weak: Weak<Self> = Arc::downgrade(self);
        ListenerGuard {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    fn remove(&self, id: u64) {
        self.entries.write().retain(|(entry_id, _)| *entry_id != id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Call every listener. Runs without holding the registry lock, so
    /// listeners may register or unregister. A panicking listener is logged
    /// and does not stop the others.
    pub(crate) fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .entries
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                warn!(registry = self.name, "listener panicked");
            }
        }
    }
}

/// Keeps a listener registered. Dropping it (or calling
/// [`ListenerGuard::unsubscribe`]) removes the listener.
#[must_use = "dropping the guard unregisters the listener"]
pub struct ListenerGuard {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the listener registered for as long as the engine lives.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
