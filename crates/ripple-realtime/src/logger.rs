//! Execution logging seam.

use crate::error::ServerError;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

/// Structured tags attached to every logger callback: `url`, `query`,
/// `queryVariables`, `id`, and once parsed `queryType`/`queryName`.
pub type Tags = HashMap<String, String>;

/// Receives execution lifecycle events for every subscription and mutation.
pub trait ExecutionLogger: Send + Sync {
    /// An execution pass is starting; `initial` is true only for the first
    /// pass of a subscription.
    fn start_execution(&self, tags: &Tags, initial: bool);

    /// An execution pass finished (successfully or not) after `elapsed`.
    fn finish_execution(&self, tags: &Tags, elapsed: Duration);

    /// An application fault. Opaque errors always arrive here; sanitizable
    /// ones only when they were swallowed toward the client.
    fn error(&self, error: &ServerError, tags: &Tags);
}

/// Default logger emitting structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl ExecutionLogger for TracingLogger {
    fn start_execution(&self, tags: &Tags, initial: bool) {
        debug!(?tags, initial, "execution started");
    }

    fn finish_execution(&self, tags: &Tags, elapsed: Duration) {
        debug!(?tags, elapsed_ms = elapsed.as_millis() as u64, "execution finished");
    }

    fn error(&self, error: &ServerError, tags: &Tags) {
        error!(?tags, error = %error, "execution failed");
    }
}
