//! Per-connection subscription registry.
//!
//! A mutex-guarded mapping from client-chosen id to a live reactive runner.
//! Mutations occupy a slot here too while in flight, so `unsubscribe` and
//! the capacity cap treat them exactly like subscriptions.

use crate::connection::MAX_SUBSCRIPTIONS;
use crate::error::ServerError;
use parking_lot::Mutex;
use ripple_reactive::Rerunner;
use std::collections::HashMap;

pub(crate) struct Registry {
    runners: Mutex<HashMap<String, Rerunner>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the slot for `id`, build the runner, insert it.
    ///
    /// Uniqueness and capacity are checked before `build` runs; the whole
    /// operation happens under the registry lock, so a concurrent subscribe
    /// for the same id cannot race past the checks.
    pub(crate) fn insert_with(
        &self,
        id: &str,
        build: impl FnOnce() -> Result<Rerunner, ServerError>,
    ) -> Result<(), ServerError> {
        let mut runners = self.runners.lock();
        if runners.contains_key(id) {
            return Err(ServerError::safe("duplicate subscription"));
        }
        if runners.len() + 1 > MAX_SUBSCRIPTIONS {
            return Err(ServerError::safe("too many subscriptions"));
        }
        let runner = build()?;
        runners.insert(id.to_string(), runner);
        Ok(())
    }

    /// Stop and remove one runner; unknown ids are a no-op.
    pub(crate) fn remove(&self, id: &str) {
        if let Some(runner) = self.runners.lock().remove(id) {
            runner.stop();
        }
    }

    /// Stop every runner and empty the mapping.
    pub(crate) fn remove_all(&self) {
        for (_, runner) in self.runners.lock().drain() {
            runner.stop();
        }
    }

    /// Visit every live runner under the registry lock.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&Rerunner)) {
        for runner in self.runners.lock().values() {
            f(runner);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.runners.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.runners.lock().contains_key(id)
    }
}
