//! Telemetry conventions for sessions and operations.
//!
//! Everything is expressed through `tracing` spans and events so any
//! subscriber (fmt, OpenTelemetry, metrics bridges) can consume it without
//! this crate depending on a backend. Field names follow the MCP semantic
//! conventions: `mcp.method.name`, `mcp.session.id`, `mcp.request.id`,
//! `network.transport`, `error.type`.

use std::time::Instant;

use rand::Rng;
use serde_json::Value;
use tracing::Span;

use crate::model::{Meta, method};

/// W3C trace context carried in `params._meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_parent: String,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// Mint a fresh root context: version 00, random trace and parent ids,
    /// sampled flag set.
    pub fn generate() -> Self {
        let mut trace_id = [0u8; 16];
        let mut parent_id = [0u8; 8];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut trace_id);
        rng.fill_bytes(&mut parent_id);
        Self {
            trace_parent: format!("00-{}-{}-01", hex(&trace_id), hex(&parent_id)),
            trace_state: None,
        }
    }

    pub fn from_meta(meta: &Meta) -> Option<Self> {
        meta.trace_parent.as_ref().map(|trace_parent| Self {
            trace_parent: trace_parent.clone(),
            trace_state: meta.trace_state.clone(),
        })
    }

    /// Write this context into a meta that does not already carry one.
    pub fn apply(&self, meta: &mut Meta) {
        if meta.trace_parent.is_none() {
            meta.trace_parent = Some(self.trace_parent.clone());
            meta.trace_state = self.trace_state.clone();
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

/// The target of an operation, when the method addresses one: tool name,
/// prompt name, or resource URI.
pub fn method_target(method_name: &str, params: Option<&Value>) -> Option<String> {
    let key = match method_name {
        method::TOOLS_CALL | method::PROMPTS_GET => "name",
        method::RESOURCES_READ | method::RESOURCES_SUBSCRIBE | method::RESOURCES_UNSUBSCRIBE => {
            "uri"
        }
        _ => return None,
    };
    params?
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Span display name: `"method"` or `"method target"` when a target is known.
pub fn span_name(method_name: &str, target: Option<&str>) -> String {
    match target {
        Some(target) => format!("{method_name} {target}"),
        None => method_name.to_string(),
    }
}

/// `tools/call` responses report failure in-band via a top-level `isError`.
pub fn is_tool_error(method_name: &str, result: &Value) -> bool {
    method_name == method::TOOLS_CALL
        && result.get("isError").and_then(Value::as_bool) == Some(true)
}

pub(crate) fn request_span(
    direction: &'static str,
    method_name: &str,
    target: Option<&str>,
    session_id: &str,
    request_id: &str,
    transport: &'static str,
) -> Span {
    tracing::info_span!(
        "mcp.operation",
        otel.name = %span_name(method_name, target),
        mcp.method.name = method_name,
        mcp.operation.target = target,
        mcp.operation.direction = direction,
        mcp.session.id = session_id,
        mcp.request.id = request_id,
        network.transport = transport,
        error_type = tracing::field::Empty,
    )
}

pub(crate) fn record_operation(
    span: &Span,
    method_name: &str,
    transport: &'static str,
    error_type: Option<&str>,
    started: Instant,
) {
    if let Some(error_type) = error_type {
        span.record("error_type", error_type);
    }
    tracing::debug!(
        parent: span,
        mcp.method.name = method_name,
        network.transport = transport,
        error_type = error_type,
        duration_ms = started.elapsed().as_millis() as u64,
        "operation completed"
    );
}

pub(crate) fn record_session_duration(
    session_id: &str,
    transport: &'static str,
    started: Instant,
) {
    tracing::debug!(
        mcp.session.id = session_id,
        network.transport = transport,
        duration_ms = started.elapsed().as_millis() as u64,
        "session closed"
    );
}
