//! Message-framed socket seam.
//!
//! The connection core reads and writes whole text frames; ownership is
//! split so the read loop and the mutex-guarded writer can live on
//! different tasks, the way an upgraded WebSocket splits.

use async_trait::async_trait;
use thiserror::Error;

/// Transport faults surfaced by a sink or stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the socket, or the close handshake already ran.
    #[error("connection closed")]
    Closed,

    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error is part of a normal shutdown and should be
    /// discarded silently.
    pub fn is_normal_close(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Write half of the socket.
#[async_trait]
pub trait MessageSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the socket; the read half terminates as a consequence.
    async fn close(&mut self);
}

/// Read half of the socket.
#[async_trait]
pub trait MessageStream: Send {
    /// The next text frame; `None` once the socket is exhausted.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}
