//! Legacy HTTP+SSE server transport.
//!
//! `GET <sse_path>` opens an SSE body whose first event is a synthetic
//! `endpoint` event carrying the URL for posting messages;
//! `POST <post_path>?sessionId=…` accepts individual JSON-RPC messages and
//! replies `202 Accepted`. Not available in stateless deployments.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::Stream;
use http::{StatusCode, header, request::Parts};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    Inbound, MessageContext, Transport, TransportKind,
    common::{
        http_header::EVENT_STREAM_MIME_TYPE,
        sse::{SseEvent, keep_alive_frame},
    },
};
use crate::{
    error::TransportError,
    model::JsonRpcMessage,
    service::{ServerHandler, serve_server_with_ct},
};

pub type SessionId = Arc<str>;

fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);

type TxStore = Arc<RwLock<HashMap<SessionId, mpsc::Sender<Inbound>>>>;

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
}

#[derive(Clone)]
struct App {
    txs: TxStore,
    transport_tx: mpsc::UnboundedSender<SseServerTransport>,
    post_path: Arc<str>,
    sse_ping_interval: Duration,
}

impl App {
    fn new(
        post_path: String,
        sse_ping_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SseServerTransport>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        (
            Self {
                txs: Default::default(),
                transport_tx,
                post_path: post_path.into(),
                sse_ping_interval,
            },
            transport_rx,
        )
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventQuery {
    pub session_id: String,
}

async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    parts: Parts,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let message: JsonRpcMessage =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    tracing::debug!(session_id, kind = message.kind(), "new client message");
    let tx = {
        let txs = app.txs.read().await;
        txs.get(session_id.as_str())
            .ok_or(StatusCode::NOT_FOUND)?
            .clone()
    };
    let mut context = MessageContext::new();
    context.extensions.insert(parts);
    if tx.send(Inbound { message, context }).await.is_err() {
        tracing::error!(session_id, "send message error");
        return Err(StatusCode::GONE);
    }
    Ok(StatusCode::ACCEPTED)
}

async fn sse_handler(State(app): State<App>, parts: Parts) -> Response {
    if !parts
        .headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(EVENT_STREAM_MIME_TYPE))
    {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }

    let session = session_id();
    tracing::info!(%session, "sse connection");
    let (from_client_tx, from_client_rx) = mpsc::channel(64);
    let (to_client_tx, to_client_rx) = mpsc::channel(64);

    app.txs
        .write()
        .await
        .insert(session.clone(), from_client_tx);

    let transport = SseServerTransport {
        stream: from_client_rx,
        sink: to_client_tx.clone(),
        session_id: session.clone(),
        tx_store: app.txs.clone(),
        connected: true,
    };
    if app.transport_tx.send(transport).is_err() {
        tracing::warn!("send transport out error");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "fail to hand out transport, the server seems closed",
        )
            .into_response();
    }

    // clean the session up when the client disconnects
    tokio::spawn({
        let tx_store = app.txs.clone();
        let session = session.clone();
        async move {
            to_client_tx.closed().await;
            tx_store.write().await.remove(&session);
            tracing::debug!(session_id = %session, "closed session and cleaned up resources");
        }
    });

    let endpoint = SseEvent::endpoint(format!("{}?sessionId={}", app.post_path, session));
    let stream = LegacySseStream {
        prologue: Some(endpoint.encode()),
        rx: to_client_rx,
        keep_alive: Some(tokio::time::interval(app.sse_ping_interval)),
        done: false,
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

struct LegacySseStream {
    prologue: Option<Bytes>,
    rx: mpsc::Receiver<JsonRpcMessage>,
    keep_alive: Option<tokio::time::Interval>,
    done: bool,
}

impl Stream for LegacySseStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(prologue) = this.prologue.take() {
            return Poll::Ready(Some(Ok(prologue)));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                let data =
                    serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
                return Poll::Ready(Some(Ok(SseEvent::message(data).encode())));
            }
            Poll::Ready(None) => {
                this.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }
        if let Some(interval) = &mut this.keep_alive {
            if interval.poll_tick(cx).is_ready() {
                return Poll::Ready(Some(Ok(keep_alive_frame())));
            }
        }
        Poll::Pending
    }
}

pub struct SseServerTransport {
    stream: mpsc::Receiver<Inbound>,
    sink: mpsc::Sender<JsonRpcMessage>,
    session_id: SessionId,
    tx_store: TxStore,
    connected: bool,
}

impl Transport for SseServerTransport {
    type Error = TransportError;

    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.sink
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<Inbound> {
        self.stream.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.stream.close();
        self.tx_store.write().await.remove(&self.session_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

#[derive(Debug)]
pub struct SseServer {
    transport_rx: mpsc::UnboundedReceiver<SseServerTransport>,
    pub config: SseServerConfig,
}

impl SseServer {
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(SseServerConfig {
            bind,
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
        })
        .await
    }

    pub async fn serve_with_config(mut config: SseServerConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // keep the actual bound address (matters when the port is 0)
        config.bind = listener.local_addr()?;
        let (sse_server, router) = Self::new(config);
        let ct = sse_server.config.ct.child_token();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(error) = server.await {
                    tracing::error!(%error, "sse server shutdown with error");
                }
            }
            .instrument(
                tracing::info_span!("sse-server", bind_address = %sse_server.config.bind),
            ),
        );
        Ok(sse_server)
    }

    pub fn new(config: SseServerConfig) -> (SseServer, Router) {
        let (app, transport_rx) = App::new(
            config.post_path.clone(),
            config.sse_keep_alive.unwrap_or(DEFAULT_AUTO_PING_INTERVAL),
        );
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .with_state(app);

        (
            SseServer {
                transport_rx,
                config,
            },
            router,
        )
    }

    /// Serve one MCP server per inbound SSE connection.
    pub fn with_service<H, F>(mut self, handler_provider: F) -> CancellationToken
    where
        H: ServerHandler,
        F: Fn() -> H + Send + 'static,
    {
        let ct = self.config.ct.clone();
        tokio::spawn(async move {
            while let Some(transport) = self.next_transport().await {
                let handler = handler_provider();
                let ct = self.config.ct.child_token();
                tokio::spawn(async move {
                    match serve_server_with_ct(handler, transport, ct).await {
                        Ok(server) => {
                            let _ = server.waiting().await;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "sse session initialization failed");
                        }
                    }
                });
            }
        });
        ct
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    pub async fn next_transport(&mut self) -> Option<SseServerTransport> {
        self.transport_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_store_insert_and_remove() {
        let (app, transport_rx) = App::new("/message".to_string(), Duration::from_secs(15));

        let session = session_id();
        let (tx, _rx) = mpsc::channel(64);
        app.txs.write().await.insert(session.clone(), tx);
        assert!(app.txs.read().await.contains_key(&session));

        app.txs.write().await.remove(&session);
        assert!(!app.txs.read().await.contains_key(&session));

        drop(transport_rx);
    }

    #[tokio::test]
    async fn test_endpoint_event_framing() {
        let event = SseEvent::endpoint("/message?sessionId=abc");
        let encoded = event.encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert_eq!(text, "event: endpoint\ndata: /message?sessionId=abc\n\n");
    }

    #[tokio::test]
    async fn test_next_transport_ends_when_router_dropped() {
        let config = SseServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
        };
        let (mut sse_server, router) = SseServer::new(config);
        drop(router);

        let transport =
            tokio::time::timeout(Duration::from_millis(100), sse_server.next_transport())
                .await
                .unwrap();
        assert!(transport.is_none());
    }
}
