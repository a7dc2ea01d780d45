//! Invalidation sources that wake reactive computations.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// An invalidation source a computation can depend on.
///
/// Cloning yields another handle to the same source. Calling
/// [`Resource::invalidate`] wakes every runner whose last completed pass
/// tracked this resource; tracking is re-established on every pass, so a
/// pass that stops reading a resource stops being woken by it.
#[derive(Clone, Debug, Default)]
pub struct Resource {
    watchers: Arc<Mutex<Vec<Weak<Notify>>>>,
}

impl Resource {
    /// Create a new invalidation source with no watchers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every runner currently watching this resource.
    ///
    /// Watchers are consumed: a woken runner re-registers on its next pass.
    pub fn invalidate(&self) {
        let watchers: Vec<_> = self.watchers.lock().drain(..).collect();
        for watcher in watchers {
            if let Some(trigger) = watcher.upgrade() {
                trigger.notify_one();
            }
        }
    }

    /// Register a runner trigger; deduplicated per trigger.
    pub(crate) fn watch(&self, trigger: &Arc<Notify>) {
        let mut watchers = self.watchers.lock();
        let already_watching = watchers
            .iter()
            .any(|watcher| std::ptr::eq(watcher.as_ptr(), Arc::as_ptr(trigger)));
        if !already_watching {
            watchers.push(Arc::downgrade(trigger));
        }
    }

    /// Drop a runner trigger registered by an earlier pass.
    pub(crate) fn unwatch(&self, trigger: &Arc<Notify>) {
        self.watchers
            .lock()
            .retain(|watcher| !std::ptr::eq(watcher.as_ptr(), Arc::as_ptr(trigger)));
    }

    /// Whether two handles point at the same invalidation source.
    pub(crate) fn same_source(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.watchers, &other.watchers)
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| watcher.strong_count() > 0);
        watchers.len()
    }
}
