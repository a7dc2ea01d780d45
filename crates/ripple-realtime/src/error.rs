//! Error types and client-safe sanitization.

use thiserror::Error;

/// Replacement text for errors whose contents must not reach the client.
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// Errors produced while serving a connection.
///
/// Only the [`ServerError::Client`] and [`ServerError::Safe`] variants carry
/// text their author declared safe to disclose; everything else is opaque
/// and renders as [`INTERNAL_SERVER_ERROR`] on the wire.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request was malformed; the text is safe to echo back.
    #[error("{0}")]
    Client(String),

    /// A server-side failure whose text is safe to disclose.
    #[error("{0}")]
    Safe(String),

    /// The execution context was cancelled.
    #[error("execution canceled")]
    Canceled,

    /// Resolver-path context wrapped around a deeper failure.
    #[error("{field}: {source}")]
    Path {
        /// Field the executor was resolving when the failure surfaced.
        field: String,
        /// The wrapped failure.
        #[source]
        source: Box<ServerError>,
    },

    /// Opaque engine or resolver failure; never shown to clients.
    #[error("{0}")]
    Engine(String),
}

impl ServerError {
    /// A malformed-request error with client-safe text.
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    /// A disclosable server-side error.
    pub fn safe(message: impl Into<String>) -> Self {
        Self::Safe(message.into())
    }

    /// An opaque engine failure.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Wrap `source` with the resolver path element `field`.
    pub fn path(field: impl Into<String>, source: ServerError) -> Self {
        Self::Path {
            field: field.into(),
            source: Box::new(source),
        }
    }

    /// Strip any resolver-path wrapping down to the underlying failure.
    pub fn root(&self) -> &ServerError {
        match self {
            Self::Path { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error is, at its root, a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Self::Canceled)
    }

    /// The client-safe text, when the error was declared disclosable.
    pub fn sanitized(&self) -> Option<&str> {
        match self {
            Self::Client(message) | Self::Safe(message) => Some(message),
            _ => None,
        }
    }
}

/// Render any error as client-safe text.
pub fn sanitize_error(error: &ServerError) -> String {
    match error.sanitized() {
        Some(message) => message.to_string(),
        None => INTERNAL_SERVER_ERROR.to_string(),
    }
}
