#![doc = include_str!("../README.md")]

mod error;
pub use error::{ConduitError, ErrorData, HandlerError, ServiceError, TransportError};

/// Basic data types of the MCP wire protocol
pub mod model;
pub mod protect;
pub mod service;
pub use service::{
    Endpoint, NotificationContext, Peer, ProgressReporter, QuitReason, RequestContext,
    RunningSession, ServerHandler, serve_client, serve_directly, serve_server,
};
pub mod telemetry;
pub mod transport;

// re-export
pub use serde;
pub use serde_json;
