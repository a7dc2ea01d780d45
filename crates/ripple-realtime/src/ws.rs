//! Axum WebSocket entry points and transport adapters.

use crate::connection::Connection;
use crate::context::MakeCtx;
use crate::engine::QueryEngine;
use crate::logger::{ExecutionLogger, TracingLogger};
use crate::transport::{MessageSink, MessageStream, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// Everything a live-query endpoint needs to build connections.
#[derive(Clone)]
pub struct LiveQueryState {
    engine: Arc<dyn QueryEngine>,
    mutation_engine: Arc<dyn QueryEngine>,
    make_ctx: MakeCtx,
    logger: Arc<dyn ExecutionLogger>,
}

impl LiveQueryState {
    /// State resolving queries and mutations against one engine, with
    /// identity context decoration and tracing-backed logging.
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        let mutation_engine = Arc::clone(&engine);
        Self {
            engine,
            mutation_engine,
            make_ctx: Arc::new(|ctx| ctx),
            logger: Arc::new(TracingLogger),
        }
    }

    /// Use a distinct engine for mutations.
    pub fn with_mutation_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.mutation_engine = engine;
        self
    }

    /// Decorate every execution context with `make_ctx`.
    pub fn with_make_ctx(mut self, make_ctx: MakeCtx) -> Self {
        self.make_ctx = make_ctx;
        self
    }

    /// Replace the execution logger.
    pub fn with_logger(mut self, logger: Arc<dyn ExecutionLogger>) -> Self {
        self.logger = logger;
        self
    }
}

/// Routes serving the live-query WebSocket endpoint at `/ws`.
pub fn live_query_routes(state: LiveQueryState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<LiveQueryState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Drive one upgraded WebSocket until the peer disconnects.
pub async fn serve_socket(socket: WebSocket, state: LiveQueryState) {
    let (sink, stream) = socket.split();
    let connection = Connection::with_mutation_engine(
        Box::new(WsSink { sink }),
        state.engine,
        state.mutation_engine,
        state.make_ctx,
        state.logger,
    );
    connection.serve(Box::new(WsStream { stream })).await;
    debug!("websocket session ended");
}

struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(classify)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageStream for WsStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                // Control frames are transport noise, not envelopes.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Binary(_)) => {
                    return Some(Err(TransportError::Io(
                        "unexpected binary frame".to_string(),
                    )))
                }
                Err(error) => return Some(Err(classify(error))),
            }
        }
    }
}

/// Close-type failures are routine shutdown; everything else is a fault.
fn classify(error: axum::Error) -> TransportError {
    let message = error.to_string();
    if message.contains("closed") || message.contains("reset") {
        TransportError::Closed
    } else {
        TransportError::Io(message)
    }
}
