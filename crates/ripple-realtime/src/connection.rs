//! Connection lifecycle: dispatch, subscriptions, mutations, teardown.
//!
//! A [`Connection`] owns one socket session. Its read loop decodes one
//! envelope per frame and routes by verb; subscriptions become reactive
//! runners in the registry; mutations run serially under the connection's
//! mutation lock and re-fire every live subscription when they commit. When
//! the read loop ends, every runner is stopped and the registry emptied.

use crate::batch;
use crate::context::{ExecutionContext, MakeCtx};
use crate::engine::{ParsedQuery, QueryEngine, SchemaRoot, Variables};
use crate::envelope::{InEnvelope, OutEnvelope, QueryMessage};
use crate::error::{sanitize_error, ServerError};
use crate::logger::{ExecutionLogger, Tags};
use crate::middleware::{
    run_middlewares, ComputationInput, ComputationOutput, Middleware, MiddlewareNext,
};
use crate::registry::Registry;
use crate::transport::{MessageSink, MessageStream};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use ripple_reactive::{Computation, Rerunner, RunContext, RunnerError};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Maximum live subscriptions per connection; in-flight mutations count too.
pub const MAX_SUBSCRIPTIONS: usize = 200;

/// Minimum spacing between re-executions of a single subscription.
pub const MIN_RERUN_INTERVAL: Duration = Duration::from_secs(5);

struct WriterState {
    sink: Box<dyn MessageSink>,
    closed: bool,
}

/// Connection state shared with runner computations.
///
/// Deliberately excludes the registry: computations hold only a weak
/// registry handle, so the registry is the sole owner of every runner and
/// teardown breaks all reference cycles.
struct Shared {
    writer: tokio::sync::Mutex<WriterState>,
    logger: Arc<dyn ExecutionLogger>,
    make_ctx: MakeCtx,
    middlewares: RwLock<Vec<Middleware>>,
    engine: Arc<dyn QueryEngine>,
    mutation_engine: Arc<dyn QueryEngine>,
    url: RwLock<String>,
    cancel: CancellationToken,
    mutate_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    /// Serialize and send one envelope under the write lock.
    ///
    /// Best-effort: a normal close is discarded silently, anything else
    /// closes the socket, which in turn ends the read loop and tears the
    /// connection down.
    async fn write_or_close(&self, envelope: &OutEnvelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "failed to encode outbound envelope");
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        if writer.closed {
            return;
        }
        if let Err(error) = writer.sink.send(payload).await {
            if !error.is_normal_close() {
                tracing::error!(%error, "socket write failed, closing socket");
                writer.sink.close().await;
            }
            writer.closed = true;
        }
    }
}

/// Cloneable handle writing envelopes through the connection's write lock.
#[derive(Clone)]
pub struct EnvelopeWriter {
    shared: Arc<Shared>,
}

impl EnvelopeWriter {
    /// Send one envelope; failures close the socket.
    pub async fn write(&self, envelope: OutEnvelope) {
        self.shared.write_or_close(&envelope).await;
    }
}

/// A hook invoked for every inbound envelope before the built-in router.
pub type EnvelopeHandler = Arc<
    dyn Fn(InEnvelope, EnvelopeWriter) -> BoxFuture<'static, Result<(), ServerError>>
        + Send
        + Sync,
>;

struct SubscriptionState {
    previous: Option<Value>,
    initial: bool,
}

/// One socket session: registry, write lock, mutation lock, and the read
/// loop that drives them.
pub struct Connection {
    shared: Arc<Shared>,
    registry: Arc<Registry>,
}

impl Connection {
    /// A connection resolving queries and mutations against one engine.
    pub fn new(
        sink: Box<dyn MessageSink>,
        engine: Arc<dyn QueryEngine>,
        make_ctx: MakeCtx,
        logger: Arc<dyn ExecutionLogger>,
    ) -> Self {
        let mutation_engine = Arc::clone(&engine);
        Self::with_mutation_engine(sink, engine, mutation_engine, make_ctx, logger)
    }

    /// A connection with a distinct engine for mutations.
    pub fn with_mutation_engine(
        sink: Box<dyn MessageSink>,
        engine: Arc<dyn QueryEngine>,
        mutation_engine: Arc<dyn QueryEngine>,
        make_ctx: MakeCtx,
        logger: Arc<dyn ExecutionLogger>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(WriterState {
                    sink,
                    closed: false,
                }),
                logger,
                make_ctx,
                middlewares: RwLock::new(Vec::new()),
                engine,
                mutation_engine,
                url: RwLock::new(String::new()),
                cancel: CancellationToken::new(),
                mutate_lock: tokio::sync::Mutex::new(()),
            }),
            registry: Arc::new(Registry::new()),
        }
    }

    /// Append a middleware; layers run in registration order, outermost
    /// first, around every subsequent execution.
    pub fn use_middleware(&self, middleware: Middleware) {
        self.shared.middlewares.write().push(middleware);
    }

    /// The connection's base cancellation token. Cancelling it cascades
    /// into every runner.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// A handle for writing envelopes from outside the read loop.
    pub fn writer(&self) -> EnvelopeWriter {
        EnvelopeWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of live registry entries (subscriptions plus in-flight
    /// mutations).
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Serve the connection until the socket closes, then tear down every
    /// runner.
    pub async fn serve(&self, stream: Box<dyn MessageStream>) {
        self.serve_with_handlers(stream, Vec::new()).await;
    }

    /// Like [`Connection::serve`], with extra envelope hooks that run
    /// before the built-in router.
    pub async fn serve_with_handlers(
        &self,
        mut stream: Box<dyn MessageStream>,
        handlers: Vec<EnvelopeHandler>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = stream.recv() => frame,
                () = self.shared.cancel.cancelled() => break,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => {
                    if !error.is_normal_close() {
                        warn!(%error, "socket read failed");
                    }
                    break;
                }
                None => break,
            };

            let envelope: InEnvelope = match serde_json::from_str(&frame) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(%error, "malformed inbound envelope");
                    break;
                }
            };

            for handler in &handlers {
                if let Err(error) = handler(envelope.clone(), self.writer()).await {
                    self.report_handler_error(&envelope.id, &error).await;
                }
            }
            if let Err(error) = self.handle(&envelope).await {
                self.report_handler_error(&envelope.id, &error).await;
            }
        }

        self.close_subscriptions();
        self.shared.cancel.cancel();
    }

    async fn report_handler_error(&self, id: &str, error: &ServerError) {
        warn!(%error, id, "inbound envelope handling failed");
        self.shared
            .write_or_close(&OutEnvelope::error(id, sanitize_error(error)))
            .await;
    }

    /// The built-in router: one verb per envelope.
    async fn handle(&self, envelope: &InEnvelope) -> Result<(), ServerError> {
        match envelope.kind.as_str() {
            "subscribe" => {
                let subscribe: QueryMessage = envelope.decode()?;
                self.handle_subscribe(&envelope.id, subscribe)
            }
            "unsubscribe" => {
                self.close_subscription(&envelope.id);
                Ok(())
            }
            "mutate" => {
                let mutate: QueryMessage = envelope.decode()?;
                self.handle_mutate(&envelope.id, mutate)
            }
            "echo" => {
                self.shared
                    .write_or_close(&OutEnvelope::echo(&envelope.id))
                    .await;
                Ok(())
            }
            "url" => {
                let url: String = envelope.decode()?;
                *self.shared.url.write() = url;
                Ok(())
            }
            _ => Err(ServerError::safe("unknown message type")),
        }
    }

    /// Parse, prepare, and register a long-lived subscription runner.
    fn handle_subscribe(&self, id: &str, subscribe: QueryMessage) -> Result<(), ServerError> {
        let shared = Arc::clone(&self.shared);
        let registry = Arc::downgrade(&self.registry);

        self.registry.insert_with(id, move || {
            let mut tags = base_tags(&shared, id, &subscribe.query, &subscribe.variables);

            let query = shared
                .engine
                .parse(&subscribe.query, &subscribe.variables)
                .map_err(|error| {
                    shared.logger.error(&error, &tags);
                    error
                })?;
            tags.insert("queryType".to_string(), query.kind.as_str().to_string());
            tags.insert("queryName".to_string(), query.name.clone());

            shared
                .engine
                .prepare(SchemaRoot::Query, &query)
                .map_err(|error| {
                    shared.logger.error(&error, &tags);
                    error
                })?;

            Ok(subscription_runner(
                shared,
                registry,
                id,
                subscribe,
                Arc::new(query),
                tags,
            ))
        })
    }

    /// Parse, prepare, and register a single-shot mutation runner.
    ///
    /// The mutation occupies a registry slot under its id so `unsubscribe`
    /// cancels it mid-flight; the slot counts against the cap while the
    /// mutation runs.
    fn handle_mutate(&self, id: &str, mutate: QueryMessage) -> Result<(), ServerError> {
        let shared = Arc::clone(&self.shared);
        let registry = Arc::downgrade(&self.registry);

        self.registry.insert_with(id, move || {
            let mut tags = base_tags(&shared, id, &mutate.query, &mutate.variables);

            let query = shared
                .mutation_engine
                .parse(&mutate.query, &mutate.variables)
                .map_err(|error| {
                    shared.logger.error(&error, &tags);
                    error
                })?;
            tags.insert("queryType".to_string(), query.kind.as_str().to_string());
            tags.insert("queryName".to_string(), query.name.clone());

            shared
                .mutation_engine
                .prepare(SchemaRoot::Mutation, &query)
                .map_err(|error| {
                    shared.logger.error(&error, &tags);
                    error
                })?;

            Ok(mutation_runner(
                shared,
                registry,
                id,
                mutate,
                Arc::new(query),
                tags,
            ))
        })
    }

    /// Stop and remove one subscription; unknown ids are ignored.
    pub fn close_subscription(&self, id: &str) {
        self.registry.remove(id);
    }

    /// Stop every runner and empty the registry.
    pub fn close_subscriptions(&self) {
        self.registry.remove_all();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.remove_all();
        self.shared.cancel.cancel();
    }
}

fn base_tags(shared: &Shared, id: &str, query: &str, variables: &Variables) -> Tags {
    let mut tags = Tags::new();
    tags.insert("url".to_string(), shared.url.read().clone());
    tags.insert("query".to_string(), query.to_string());
    tags.insert(
        "queryVariables".to_string(),
        serde_json::to_string(variables).unwrap_or_default(),
    );
    tags.insert("id".to_string(), id.to_string());
    tags
}

/// Terminal middleware executing the prepared operation against `root`.
fn execute_terminal(
    engine: Arc<dyn QueryEngine>,
    root: SchemaRoot,
    query: Arc<ParsedQuery>,
) -> Middleware {
    Arc::new(
        move |input: ComputationInput, next: MiddlewareNext| -> BoxFuture<'static, ComputationOutput> {
            let engine = Arc::clone(&engine);
            let query = Arc::clone(&query);
            Box::pin(async move {
                let ctx = input.ctx.clone();
                let mut output = next(input).await;
                output.result = engine.execute(&ctx, root, &query).await;
                output
            })
        },
    )
}

/// Build the decorated context for one pass: user decoration first, then
/// request batching, with the pass's dependency tracker installed.
fn pass_context(shared: &Shared, run: RunContext) -> ExecutionContext {
    let ctx = ExecutionContext::new(run.cancellation()).with_extension(run);
    let ctx = (shared.make_ctx)(ctx);
    batch::with_batching(ctx)
}

/// Removing a registry entry from inside its own computation would re-enter
/// the runner teardown path, so removals always hop to a fresh task.
fn schedule_removal(registry: &Weak<Registry>, id: &str) {
    let registry = registry.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        if let Some(registry) = registry.upgrade() {
            registry.remove(&id);
        }
    });
}

/// Broadcast reruns take the registry lock, so they hop to a fresh task
/// rather than run under locks the mutation path may still hold.
fn schedule_broadcast(registry: &Weak<Registry>) {
    let registry = registry.clone();
    tokio::spawn(async move {
        if let Some(registry) = registry.upgrade() {
            registry.for_each(Rerunner::rerun_immediately);
        }
    });
}

fn subscription_runner(
    shared: Arc<Shared>,
    registry: Weak<Registry>,
    id: &str,
    subscribe: QueryMessage,
    query: Arc<ParsedQuery>,
    tags: Tags,
) -> Rerunner {
    let id = id.to_string();
    let base = shared.cancel.clone();
    let state = Arc::new(Mutex::new(SubscriptionState {
        previous: None,
        initial: true,
    }));

    let computation: Computation = Arc::new(
        move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
            let shared = Arc::clone(&shared);
            let registry = registry.clone();
            let id = id.clone();
            let subscribe = subscribe.clone();
            let query = Arc::clone(&query);
            let tags = tags.clone();
            let state = Arc::clone(&state);

            Box::pin(async move {
                let ctx = pass_context(&shared, run);

                let started = Instant::now();
                let (initial, previous) = {
                    let state = state.lock();
                    (state.initial, state.previous.clone())
                };
                shared.logger.start_execution(&tags, initial);

                let mut middlewares = shared.middlewares.read().clone();
                middlewares.push(execute_terminal(
                    Arc::clone(&shared.engine),
                    SchemaRoot::Query,
                    Arc::clone(&query),
                ));

                let output = run_middlewares(
                    middlewares,
                    ComputationInput {
                        ctx,
                        id: id.clone(),
                        parsed_query: Arc::clone(&query),
                        query: subscribe.query.clone(),
                        variables: subscribe.variables.clone(),
                        previous,
                    },
                )
                .await;

                shared.logger.finish_execution(&tags, started.elapsed());

                let current = match output.result {
                    Ok(current) => current,
                    Err(error) => {
                        if error.is_canceled() {
                            schedule_removal(&registry, &id);
                            return Err(RunnerError::Halted);
                        }

                        if !initial {
                            // Swallowed toward the client; the runner
                            // retries with its dependency cache intact.
                            if error.sanitized().is_none() {
                                let mut retry_tags = tags.clone();
                                retry_tags.insert("retry".to_string(), "true".to_string());
                                shared.logger.error(&error, &retry_tags);
                            }
                            return Err(RunnerError::RetrySentinel);
                        }

                        shared
                            .write_or_close(
                                &OutEnvelope::error(&id, sanitize_error(&error))
                                    .with_metadata(output.metadata),
                            )
                            .await;
                        schedule_removal(&registry, &id);
                        if error.sanitized().is_none() {
                            shared.logger.error(&error, &tags);
                        }
                        return Err(RunnerError::Halted);
                    }
                };

                let (delta, was_initial) = {
                    let mut state = state.lock();
                    let delta = ripple_diff::diff(state.previous.as_ref(), &current);
                    let was_initial = state.initial;
                    state.previous = Some(current);
                    state.initial = false;
                    (delta, was_initial)
                };

                // The first delivery always goes out, even when the diff
                // alone would stay silent.
                if was_initial || delta.is_some() {
                    shared
                        .write_or_close(
                            &OutEnvelope::update(&id, delta, output.metadata),
                        )
                        .await;
                }

                Ok(())
            })
        },
    );

    Rerunner::new(&base, computation, MIN_RERUN_INTERVAL)
}

fn mutation_runner(
    shared: Arc<Shared>,
    registry: Weak<Registry>,
    id: &str,
    mutate: QueryMessage,
    query: Arc<ParsedQuery>,
    tags: Tags,
) -> Rerunner {
    let id = id.to_string();
    let base = shared.cancel.clone();

    let computation: Computation = Arc::new(
        move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
            let shared = Arc::clone(&shared);
            let registry = registry.clone();
            let id = id.clone();
            let mutate = mutate.clone();
            let query = Arc::clone(&query);
            let tags = tags.clone();

            Box::pin(async move {
                // Mutations on one connection never interleave.
                let _exclusive = shared.mutate_lock.lock().await;

                let ctx = pass_context(&shared, run);

                let started = Instant::now();
                shared.logger.start_execution(&tags, true);

                let mut middlewares = shared.middlewares.read().clone();
                middlewares.push(execute_terminal(
                    Arc::clone(&shared.mutation_engine),
                    SchemaRoot::Mutation,
                    Arc::clone(&query),
                ));

                let output = run_middlewares(
                    middlewares,
                    ComputationInput {
                        ctx,
                        id: id.clone(),
                        parsed_query: Arc::clone(&query),
                        query: mutate.query.clone(),
                        variables: mutate.variables.clone(),
                        previous: None,
                    },
                )
                .await;

                shared.logger.finish_execution(&tags, started.elapsed());

                match output.result {
                    Err(error) => {
                        shared
                            .write_or_close(
                                &OutEnvelope::error(&id, sanitize_error(&error))
                                    .with_metadata(output.metadata),
                            )
                            .await;
                        schedule_removal(&registry, &id);
                        if !error.is_canceled() && error.sanitized().is_none() {
                            shared.logger.error(&error, &tags);
                        }
                        Err(RunnerError::Halted)
                    }
                    Ok(current) => {
                        shared
                            .write_or_close(&OutEnvelope::result(
                                &id,
                                ripple_diff::diff(None, &current),
                                output.metadata,
                            ))
                            .await;
                        schedule_removal(&registry, &id);
                        schedule_broadcast(&registry);
                        // Single-shot: halting keeps the reactive runtime
                        // from ever re-firing the mutation.
                        Err(RunnerError::Halted)
                    }
                }
            })
        },
    );

    Rerunner::new(&base, computation, MIN_RERUN_INTERVAL)
}
