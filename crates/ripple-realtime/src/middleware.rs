//! Composable wrappers around one computation.
//!
//! Middlewares registered on the connection run in registration order,
//! outermost first. The framework appends a terminal middleware that invokes
//! the query engine and writes the result into the output; outer layers may
//! observe or replace it, and may attach metadata that ends up in the
//! outbound envelope. The chain is rebuilt for every execution, so a
//! middleware never has to carry state across runs.

use crate::context::ExecutionContext;
use crate::engine::{ParsedQuery, Variables};
use crate::error::ServerError;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Everything one execution pass sees.
#[derive(Debug)]
pub struct ComputationInput {
    /// Decorated execution context.
    pub ctx: ExecutionContext,
    /// Client-chosen operation id.
    pub id: String,
    /// The operation, parsed once at subscribe time.
    pub parsed_query: Arc<ParsedQuery>,
    /// Raw query text.
    pub query: String,
    /// Client-supplied variables.
    pub variables: Variables,
    /// Last successfully delivered value; `None` on the first pass and for
    /// mutations.
    pub previous: Option<Value>,
}

/// What one execution pass produced.
#[derive(Debug)]
pub struct ComputationOutput {
    /// The computed value, or the failure that ended the pass.
    pub result: Result<Value, ServerError>,
    /// Arbitrary metadata propagated into the outbound envelope.
    pub metadata: HashMap<String, Value>,
}

impl Default for ComputationOutput {
    fn default() -> Self {
        Self {
            result: Ok(Value::Null),
            metadata: HashMap::new(),
        }
    }
}

/// Continuation invoking the remainder of the chain.
pub type MiddlewareNext =
    Box<dyn FnOnce(ComputationInput) -> BoxFuture<'static, ComputationOutput> + Send>;

/// One layer of the execution pipeline.
pub type Middleware = Arc<
    dyn Fn(ComputationInput, MiddlewareNext) -> BoxFuture<'static, ComputationOutput>
        + Send
        + Sync,
>;

/// Run `input` through `middlewares`, outermost first.
pub fn run_middlewares(
    middlewares: Vec<Middleware>,
    input: ComputationInput,
) -> BoxFuture<'static, ComputationOutput> {
    chain(middlewares.into())(input)
}

fn chain(mut remaining: VecDeque<Middleware>) -> MiddlewareNext {
    Box::new(move |input| match remaining.pop_front() {
        Some(middleware) => {
            let next = chain(remaining);
            middleware(input, next)
        }
        None => {
            let done: BoxFuture<'static, ComputationOutput> =
                Box::pin(async move { ComputationOutput::default() });
            done
        }
    })
}
