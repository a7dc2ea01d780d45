//! Per-execution request batching.
//!
//! Every runner pass gets a fresh [`BatchCache`] installed into its
//! execution context. Sibling resolves within that one pass that load the
//! same key share a single underlying fetch; nothing is kept across passes,
//! so reactive invalidation is never masked by a stale cache.

use crate::context::ExecutionContext;
use crate::error::ServerError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Single-flight cache coalescing duplicate loads within one execution.
#[derive(Debug, Default)]
pub struct BatchCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Value>>>>,
}

impl BatchCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `key`, running `load` at most once per key per execution.
    ///
    /// Concurrent callers for the same key wait on the first caller's fetch
    /// and share its value. Failed loads are not cached, so a later resolve
    /// may retry.
    pub async fn load<F>(&self, key: &str, load: F) -> Result<Value, ServerError>
    where
        F: Future<Output = Result<Value, ServerError>>,
    {
        let cell = {
            let mut cells = self.cells.lock();
            Arc::clone(cells.entry(key.to_string()).or_default())
        };
        cell.get_or_try_init(|| load).await.cloned()
    }
}

/// Install a fresh batching cache into `ctx`.
pub fn with_batching(ctx: ExecutionContext) -> ExecutionContext {
    ctx.with_extension(BatchCache::new())
}

/// The execution's batching cache, when one was installed.
pub fn batch_cache(ctx: &ExecutionContext) -> Option<Arc<BatchCache>> {
    ctx.extension()
}
