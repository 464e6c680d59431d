//! Streamable HTTP server transport.
//!
//! One logical MCP session spans many discrete HTTP requests: `POST` carries
//! a request or notification and answers with either `202 Accepted` or a
//! `text/event-stream` body holding the single reply; `GET` opens the
//! at-most-one server-push SSE channel; `DELETE` tears the session down.
//! Sessions are addressed by the `Mcp-Session-Id` header and tracked in a
//! process-wide [`SessionRegistry`] with an idle sweeper.
//!
//! In stateless mode no server-side state survives a request: the session id
//! is an encrypted envelope of the client identity, and only `POST` is
//! exposed.

pub mod auth;
pub mod registry;
pub mod session;
mod stateless;

use std::{io, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use http::{StatusCode, header, request::Parts};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::{
    auth::{AnonymousCredentialExtractor, CredentialExtractor},
    registry::{HttpSession, SessionRegistry, session_id, spawn_idle_sweeper},
    session::{REPLY_CHANNEL_CAPACITY, SseBodyStream, session_channels},
};
use crate::{
    model::{ErrorCode, ErrorData, JsonRpcMessage, method},
    protect::{ChaChaProtector, SecretProtector},
    service::{ServerHandler, serve_server_with_ct},
    transport::{
        Inbound, MessageContext,
        common::{
            http_header::{
                CACHE_CONTROL_NO_STORE, CONTENT_ENCODING_IDENTITY, EVENT_STREAM_MIME_TYPE,
                HEADER_SESSION_ID, HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE,
            },
            sse::SseEvent,
        },
    },
};

/// Configuration for the streamable HTTP server.
#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping frame interval for SSE bodies. `None` disables keep-alive.
    pub sse_keep_alive: Option<Duration>,
    /// If true, a session is kept alive across requests; if false, every
    /// request reconstructs a transient session from the encrypted envelope.
    pub stateful_mode: bool,
    /// Inactive sessions older than this are closed by the sweeper. `None`
    /// disables the timeout.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on inactive sessions; the most idle are evicted beyond it.
    pub max_idle_sessions: usize,
    /// Cancelling this token stops the sweeper and disposes every session.
    pub ct: CancellationToken,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            idle_timeout: Some(Duration::from_secs(2 * 60 * 60)),
            max_idle_sessions: 100_000,
            ct: CancellationToken::new(),
        }
    }
}

/// Axum-hosted streamable HTTP service for one MCP server.
///
/// The factory is invoked once per created session.
pub struct StreamableHttpService<H: ServerHandler> {
    pub config: StreamableHttpServerConfig,
    registry: Arc<SessionRegistry>,
    handler_factory: Arc<dyn Fn() -> Result<H, io::Error> + Send + Sync>,
    credential_extractor: Arc<dyn CredentialExtractor>,
    protector: Arc<dyn SecretProtector>,
}

impl<H: ServerHandler> StreamableHttpService<H> {
    pub fn new(
        handler_factory: impl Fn() -> Result<H, io::Error> + Send + Sync + 'static,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::default()),
            handler_factory: Arc::new(handler_factory),
            credential_extractor: Arc::new(AnonymousCredentialExtractor),
            protector: Arc::new(ChaChaProtector::generate()),
        }
    }

    pub fn with_credential_extractor(
        mut self,
        extractor: impl CredentialExtractor,
    ) -> Self {
        self.credential_extractor = Arc::new(extractor);
        self
    }

    /// Key holder for the stateless envelope. Without one, an ephemeral key
    /// is generated at construction.
    pub fn with_protector(mut self, protector: impl SecretProtector) -> Self {
        self.protector = Arc::new(protector);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Build the router. Must be called inside a tokio runtime: stateful
    /// mode spawns the idle sweeper and the shutdown watcher here.
    pub fn into_router(self) -> Router {
        if self.config.stateful_mode {
            spawn_idle_sweeper(
                self.registry.clone(),
                self.config.idle_timeout,
                self.config.max_idle_sessions,
                self.config.ct.clone(),
            );
            let ct = self.config.ct.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                ct.cancelled().await;
                registry.dispose_all().await;
            });
            let service = Arc::new(self);
            Router::new()
                .route(
                    "/",
                    get(handle_get::<H>)
                        .post(handle_post::<H>)
                        .delete(handle_delete::<H>),
                )
                .with_state(service)
        } else {
            // no server-push channel, no server-side state to free
            let service = Arc::new(self);
            Router::new()
                .route("/", post(handle_stateless_post::<H>))
                .with_state(service)
        }
    }

    async fn post_to_existing(&self, parts: Parts, id: &str, payload: PostPayload) -> Response {
        let Some(session) = self.registry.try_get(id).await else {
            return jsonrpc_error_body(StatusCode::NOT_FOUND, ErrorData::session_not_found());
        };
        if self.credential_extractor.extract(&parts).as_ref() != session.user_claim() {
            return jsonrpc_error_body(
                StatusCode::FORBIDDEN,
                ErrorData::new(
                    ErrorCode::SERVER_ERROR,
                    "authenticated user does not match the session owner",
                    None,
                ),
            );
        }
        let reference = session.acquire();
        match payload {
            PostPayload::Message(JsonRpcMessage::Request(request)) => {
                let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
                let mut context = MessageContext::new().with_reply_sink(reply_tx);
                context.extensions.insert(parts);
                let inbound = Inbound {
                    message: JsonRpcMessage::Request(request),
                    context,
                };
                if session.feed(inbound).await.is_err() {
                    return jsonrpc_error_body(
                        StatusCode::NOT_FOUND,
                        ErrorData::session_not_found(),
                    );
                }
                sse_response(
                    SseBodyStream::single_reply(
                        reply_rx,
                        self.config.sse_keep_alive,
                        Some(reference),
                    ),
                    None,
                )
            }
            PostPayload::Message(message) => {
                let mut context = MessageContext::new();
                context.extensions.insert(parts);
                if session.feed(Inbound { message, context }).await.is_err() {
                    return jsonrpc_error_body(
                        StatusCode::NOT_FOUND,
                        ErrorData::session_not_found(),
                    );
                }
                drop(reference);
                StatusCode::ACCEPTED.into_response()
            }
            PostPayload::Batch(messages) => {
                if messages
                    .iter()
                    .any(|message| matches!(message, JsonRpcMessage::Request(_)))
                {
                    return jsonrpc_error_body(
                        StatusCode::NOT_IMPLEMENTED,
                        ErrorData::invalid_request("batch requests are not supported", None),
                    );
                }
                for message in messages {
                    let mut context = MessageContext::new();
                    context.extensions.insert(parts.clone());
                    if session.feed(Inbound { message, context }).await.is_err() {
                        return jsonrpc_error_body(
                            StatusCode::NOT_FOUND,
                            ErrorData::session_not_found(),
                        );
                    }
                }
                drop(reference);
                StatusCode::ACCEPTED.into_response()
            }
        }
    }

    async fn create_session_and_post(&self, parts: Parts, payload: PostPayload) -> Response {
        let PostPayload::Message(JsonRpcMessage::Request(request)) = payload else {
            return jsonrpc_error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorData::invalid_request("expected an initialize request", None),
            );
        };
        if request.method != method::INITIALIZE {
            return jsonrpc_error_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorData::invalid_request("expected an initialize request", None),
            );
        }
        let handler = match (self.handler_factory)() {
            Ok(handler) => handler,
            Err(error) => {
                tracing::error!(%error, "session handler factory failed");
                return jsonrpc_error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorData::internal_error("failed to create session", None),
                );
            }
        };

        let id = session_id();
        let (channels, transport) = session_channels();
        let claim = self.credential_extractor.extract(&parts);
        let session = HttpSession::new(
            id.clone(),
            channels.feed,
            channels.common,
            claim,
            self.registry.clock().clone(),
        );
        if !self.registry.try_add(session.clone()).await {
            return jsonrpc_error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorData::internal_error("session id collision", None),
            );
        }

        // the per-session server loop lives until the session is disposed;
        // request cancellation never reaches it
        let run_ct = session.closed_token().child_token();
        let task = tokio::spawn({
            let registry = self.registry.clone();
            let session_key = id.clone();
            async move {
                match serve_server_with_ct(handler, transport, run_ct).await {
                    Ok(running) => {
                        let _ = running.waiting().await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "session initialization failed");
                    }
                }
                registry.try_remove(&session_key).await;
            }
        });
        session.set_run_task(task).await;

        let reference = session.acquire();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let mut context = MessageContext::new().with_reply_sink(reply_tx);
        context.extensions.insert(parts);
        let inbound = Inbound {
            message: JsonRpcMessage::Request(request),
            context,
        };
        if session.feed(inbound).await.is_err() {
            return jsonrpc_error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorData::internal_error("session terminated during initialization", None),
            );
        }
        tracing::info!(session_id = %id, "created new session");
        sse_response(
            SseBodyStream::single_reply(reply_rx, self.config.sse_keep_alive, Some(reference)),
            Some(&id),
        )
    }
}

enum PostPayload {
    Message(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

fn parse_post_body(body: &Bytes) -> Result<PostPayload, serde_json::Error> {
    let first = body
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace());
    if first == Some(b'[') {
        Ok(PostPayload::Batch(serde_json::from_slice(body)?))
    } else {
        Ok(PostPayload::Message(serde_json::from_slice(body)?))
    }
}

fn jsonrpc_error_body(status: StatusCode, error: ErrorData) -> Response {
    let body = serde_json::json!({ "error": error }).to_string();
    (
        status,
        [(header::CONTENT_TYPE, JSON_MIME_TYPE)],
        body,
    )
        .into_response()
}

fn accepts(parts: &Parts, mimes: &[&str]) -> bool {
    let Some(accept) = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    mimes.iter().all(|mime| accept.contains(mime))
}

fn session_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn sse_response_builder(session_id: Option<&str>) -> http::response::Builder {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, CACHE_CONTROL_NO_STORE)
        .header(header::CONTENT_ENCODING, CONTENT_ENCODING_IDENTITY)
        .header(HEADER_X_ACCEL_BUFFERING, "no");
    if let Some(id) = session_id {
        builder = builder.header(HEADER_SESSION_ID, id);
    }
    builder
}

fn sse_response(stream: SseBodyStream, session_id: Option<&str>) -> Response {
    sse_response_builder(session_id)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A fully materialized single-event SSE body.
fn sse_single_event_response(message: &JsonRpcMessage, session_id: Option<&str>) -> Response {
    let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    sse_response_builder(session_id)
        .body(Body::from(SseEvent::message(data).encode()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn check_post_headers(parts: &Parts) -> Result<(), Response> {
    if !accepts(parts, &[JSON_MIME_TYPE, EVENT_STREAM_MIME_TYPE]) {
        return Err(jsonrpc_error_body(
            StatusCode::NOT_ACCEPTABLE,
            ErrorData::invalid_request(
                "Accept header must include application/json and text/event-stream",
                None,
            ),
        ));
    }
    let content_type_ok = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.starts_with(JSON_MIME_TYPE));
    if !content_type_ok {
        return Err(jsonrpc_error_body(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorData::invalid_request("Content-Type must be application/json", None),
        ));
    }
    Ok(())
}

async fn handle_post<H: ServerHandler>(
    State(service): State<Arc<StreamableHttpService<H>>>,
    parts: Parts,
    body: Bytes,
) -> Response {
    if let Err(response) = check_post_headers(&parts) {
        return response;
    }
    let payload = match parse_post_body(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return jsonrpc_error_body(
                StatusCode::BAD_REQUEST,
                ErrorData::parse_error(error.to_string(), None),
            );
        }
    };
    match session_header(&parts) {
        Some(id) => service.post_to_existing(parts, &id, payload).await,
        None => service.create_session_and_post(parts, payload).await,
    }
}

async fn handle_get<H: ServerHandler>(
    State(service): State<Arc<StreamableHttpService<H>>>,
    parts: Parts,
) -> Response {
    if !accepts(&parts, &[EVENT_STREAM_MIME_TYPE]) {
        return jsonrpc_error_body(
            StatusCode::NOT_ACCEPTABLE,
            ErrorData::invalid_request("Accept header must include text/event-stream", None),
        );
    }
    let Some(id) = session_header(&parts) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            ErrorData::invalid_request("Mcp-Session-Id header is required", None),
        );
    };
    let Some(session) = service.registry.try_get(&id).await else {
        return jsonrpc_error_body(StatusCode::NOT_FOUND, ErrorData::session_not_found());
    };
    if service.credential_extractor.extract(&parts).as_ref() != session.user_claim() {
        return jsonrpc_error_body(
            StatusCode::FORBIDDEN,
            ErrorData::new(
                ErrorCode::SERVER_ERROR,
                "authenticated user does not match the session owner",
                None,
            ),
        );
    }
    if !session.try_start_get() {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            ErrorData::new(
                ErrorCode::SERVER_ERROR,
                "session already has a server push stream; multiple GET requests are not allowed",
                None,
            ),
        );
    }
    let reference = session.acquire();
    let push_rx = session.attach_push_stream().await;
    tracing::debug!(session_id = %id, "server push stream opened");
    sse_response(
        SseBodyStream::continuous(push_rx, service.config.sse_keep_alive, Some(reference)),
        None,
    )
}

async fn handle_delete<H: ServerHandler>(
    State(service): State<Arc<StreamableHttpService<H>>>,
    parts: Parts,
) -> Response {
    let Some(id) = session_header(&parts) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            ErrorData::invalid_request("Mcp-Session-Id header is required", None),
        );
    };
    let Some(session) = service.registry.try_get(&id).await else {
        return jsonrpc_error_body(StatusCode::NOT_FOUND, ErrorData::session_not_found());
    };
    if service.credential_extractor.extract(&parts).as_ref() != session.user_claim() {
        return jsonrpc_error_body(
            StatusCode::FORBIDDEN,
            ErrorData::new(
                ErrorCode::SERVER_ERROR,
                "authenticated user does not match the session owner",
                None,
            ),
        );
    }
    service.registry.try_remove(&id).await;
    session.dispose().await;
    tracing::info!(session_id = %id, "session closed by DELETE");
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_stateless_post<H: ServerHandler>(
    State(service): State<Arc<StreamableHttpService<H>>>,
    parts: Parts,
    body: Bytes,
) -> Response {
    stateless::handle_post(&service, parts, body).await
}
