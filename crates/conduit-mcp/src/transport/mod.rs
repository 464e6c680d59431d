//! The bidirectional message channel a session runs on.
//!
//! A [`Transport`] delivers one [`JsonRpcMessage`] at a time in each
//! direction. Each inbound message may carry a [`MessageContext`]: the
//! ambient request-scoped state captured at ingress plus an optional reply
//! sink pinning the response for that message to a specific channel (the
//! Streamable HTTP transport uses this to route a reply into the POST body
//! that solicited it).

pub mod async_rw;
pub mod common;
pub mod sse_server;
pub mod streamable_http_server;

use crate::model::{Extensions, JsonRpcMessage};

/// Transport flavour, recorded on telemetry spans as `network.transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Stream,
    Sse,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Stream => "stream",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        }
    }
}

/// Channel a reply can be pinned to instead of the session transport.
pub type ReplySink = tokio::sync::mpsc::Sender<JsonRpcMessage>;

/// Per-message ambient state restored around dispatch.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub extensions: Extensions,
    pub reply_sink: Option<ReplySink>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_sink(mut self, sink: ReplySink) -> Self {
        self.reply_sink = Some(sink);
        self
    }
}

/// One received message together with its context.
#[derive(Debug)]
pub struct Inbound {
    pub message: JsonRpcMessage,
    pub context: MessageContext,
}

impl From<JsonRpcMessage> for Inbound {
    fn from(message: JsonRpcMessage) -> Self {
        Self {
            message,
            context: MessageContext::default(),
        }
    }
}

/// A bidirectional MCP message channel.
///
/// `receive` returning `None` means the peer disconnected. `close` is
/// idempotent: the second call is a no-op.
pub trait Transport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn send(
        &mut self,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn receive(&mut self) -> impl Future<Output = Option<Inbound>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// A transport error detached from the transport's concrete type.
#[derive(Debug, thiserror::Error)]
#[error("{transport}: {error}")]
pub struct DynamicTransportError {
    pub transport: &'static str,
    #[source]
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl DynamicTransportError {
    pub fn new<T: Transport>(error: T::Error) -> Self {
        Self {
            transport: std::any::type_name::<T>(),
            error: Box::new(error),
        }
    }
}
