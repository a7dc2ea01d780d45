//! Collaborator seam for the query language engine.

use crate::context::ExecutionContext;
use crate::error::ServerError;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Query variables as sent by the client.
pub type Variables = serde_json::Map<String, Value>;

/// The kind of a parsed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// A read-only live query.
    Query,
    /// A one-shot mutation.
    Mutation,
}

impl QueryKind {
    /// Lowercase name used in log tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which schema root an operation resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaRoot {
    /// The query root.
    Query,
    /// The mutation root.
    Mutation,
}

/// A parsed operation, immutable for the subscription's lifetime.
///
/// The selection is opaque to the connection core: the engine that produced
/// it downcasts it back in [`QueryEngine::prepare`] and
/// [`QueryEngine::execute`].
#[derive(Clone)]
pub struct ParsedQuery {
    /// Operation kind.
    pub kind: QueryKind,
    /// Operation name; empty for anonymous operations.
    pub name: String,
    selection: Arc<dyn Any + Send + Sync>,
}

impl ParsedQuery {
    /// Wrap an engine-specific selection set.
    pub fn new(kind: QueryKind, name: impl Into<String>, selection: impl Any + Send + Sync) -> Self {
        Self {
            kind,
            name: name.into(),
            selection: Arc::new(selection),
        }
    }

    /// Downcast the selection back to the engine's representation.
    pub fn selection<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.selection.downcast_ref()
    }
}

impl fmt::Debug for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedQuery")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The external parser, validator, and executor.
///
/// Implementations resolve queries however they like; the connection core
/// only relies on parse-once semantics and on [`ServerError`] classification
/// (sanitizable vs opaque, cancellation at the root).
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Parse raw query text with its variables.
    fn parse(&self, query: &str, variables: &Variables) -> Result<ParsedQuery, ServerError>;

    /// Validate a parsed operation against a schema root.
    fn prepare(&self, root: SchemaRoot, query: &ParsedQuery) -> Result<(), ServerError>;

    /// Execute a prepared operation.
    ///
    /// Implementations track reactive dependencies through the
    /// [`ripple_reactive::RunContext`] extension installed in `ctx`.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        root: SchemaRoot,
        query: &ParsedQuery,
    ) -> Result<Value, ServerError>;
}
