//! Per-execution context carrying cancellation and typed extensions.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution context handed to middlewares and the query engine.
///
/// Contexts are immutable: decoration produces a new context sharing the
/// cancellation token, the way each runner pass derives its own decorated
/// context from the connection's base.
#[derive(Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
    extensions: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ExecutionContext {
    /// A fresh context bounded by `cancel`.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            extensions: Arc::new(HashMap::new()),
        }
    }

    /// The token that cancels this execution.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the execution has been cancelled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A new context with `value` installed, keyed by its type.
    pub fn with_extension<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut extensions: HashMap<_, _> = (*self.extensions).clone();
        extensions.insert(TypeId::of::<T>(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
        Self {
            cancel: self.cancel.clone(),
            extensions: Arc::new(extensions),
        }
    }

    /// Look up an extension by type.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("canceled", &self.cancel.is_cancelled())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// User hook that decorates the context before every execution.
pub type MakeCtx = Arc<dyn Fn(ExecutionContext) -> ExecutionContext + Send + Sync>;
