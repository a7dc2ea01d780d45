//! # Ripple Realtime
//!
//! The live-query connection core: one framed-JSON socket carries
//! multiplexed, client-identified subscriptions and mutations. Each
//! subscription is a long-lived reactive computation that re-executes when a
//! dependency it read during its last run invalidates, and streams only the
//! diff against the previously delivered value. Mutations run one at a time
//! per connection and re-fire every live subscription when they commit.
//!
//! ## WebSocket Protocol
//!
//! ### Client -> Server Envelopes
//!
//! ```json
//! // Start a live query
//! {"id": "a", "type": "subscribe", "message": {"query": "{x}", "variables": {}}}
//!
//! // Stop it
//! {"id": "a", "type": "unsubscribe"}
//!
//! // Run one mutation
//! {"id": "m", "type": "mutate", "message": {"query": "mutation {...}", "variables": {}}}
//!
//! // Liveness probe
//! {"id": "p", "type": "echo"}
//!
//! // Tag subsequent log lines with the page url
//! {"id": "", "type": "url", "message": "https://example.com/dashboard"}
//! ```
//!
//! ### Server -> Client Envelopes
//!
//! ```json
//! // Subscription delta (full value on the first delivery)
//! {"id": "a", "type": "update", "message": [{"x": 1}]}
//!
//! // Mutation result
//! {"id": "m", "type": "result", "message": [{"ok": true}]}
//!
//! // Sanitized failure
//! {"id": "a", "type": "error", "message": "duplicate subscription"}
//!
//! // Liveness reply
//! {"id": "p", "type": "echo"}
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Connection                   │
//! │  read loop ──► dispatcher ──► registry       │
//! │                               id -> Rerunner │
//! │                                    │         │
//! │              computation ◄─────────┘         │
//! │     make_ctx + batching + middlewares        │
//! │                  │                           │
//! │            QueryEngine::execute              │
//! │                  │                           │
//! │        diff vs previous ──► write mutex ──►  │ socket
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Query parsing, preparation, and execution stay behind the
//! [`QueryEngine`] seam; dependency invalidation and pacing live in
//! [`ripple_reactive`]; delta encoding lives in [`ripple_diff`].

pub mod batch;
pub mod connection;
pub mod context;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod logger;
pub mod middleware;
mod registry;
pub mod transport;
pub mod ws;

pub use connection::{
    Connection, EnvelopeHandler, EnvelopeWriter, MAX_SUBSCRIPTIONS, MIN_RERUN_INTERVAL,
};
pub use context::{ExecutionContext, MakeCtx};
pub use engine::{ParsedQuery, QueryEngine, QueryKind, SchemaRoot, Variables};
pub use envelope::{InEnvelope, OutEnvelope, QueryMessage};
pub use error::{sanitize_error, ServerError, INTERNAL_SERVER_ERROR};
pub use logger::{ExecutionLogger, Tags, TracingLogger};
pub use middleware::{
    run_middlewares, ComputationInput, ComputationOutput, Middleware, MiddlewareNext,
};
pub use transport::{MessageSink, MessageStream, TransportError};
pub use ws::{live_query_routes, serve_socket, LiveQueryState};

// Re-exported so resolver authors can track dependencies and invalidate them.
pub use ripple_reactive::{Resource, RunContext};
