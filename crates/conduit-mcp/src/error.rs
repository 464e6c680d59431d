use std::fmt::Display;

pub use crate::model::{ErrorCode, ErrorData};
use crate::transport::DynamicTransportError;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Failure of an in-crate transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced to callers of the session: [`Peer`](crate::service::Peer)
/// requests and notifications.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Mcp error: {0}")]
    McpError(ErrorData),
    #[error("Transport send error: {0}")]
    TransportSend(#[from] DynamicTransportError),
    #[error("Transport closed: peer shut down unexpectedly")]
    TransportClosed,
    #[error("Request cancelled")]
    Cancelled,
    #[error("Timeout: request did not complete within {timeout:?}")]
    Timeout { timeout: std::time::Duration },
}

/// What a request handler may fail with.
///
/// Only [`HandlerError::Protocol`] reaches the wire verbatim. A cancelled
/// handler produces no reply at all, and anything else is logged and mapped
/// to a generic internal error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ErrorData),
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Other(error.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::Protocol(ErrorData::invalid_params(error.to_string(), None))
    }
}

/// Unified error type for everything the runtime can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Client initialization error: {0}")]
    ClientInitialize(#[from] crate::service::ClientInitializeError),
    #[error("Server initialization error: {0}")]
    ServerInitialize(#[from] crate::service::ServerInitializeError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
}
