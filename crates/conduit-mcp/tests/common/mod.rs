#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use conduit_mcp::{
    Endpoint, HandlerError, RequestContext, ServerHandler,
    model::{
        ClientCapabilities, ClientInfo, Implementation, JsonRpcMessage, ProtocolVersion,
        RequestId, ServerCapabilities, ServerInfo,
    },
    transport::{
        async_rw::AsyncRwTransport,
        common::sse::SseParser,
        streamable_http_server::{
            StreamableHttpServerConfig, StreamableHttpService,
            auth::{CredentialExtractor, UserIdClaim},
        },
    },
};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";
pub const ACCEPT_SSE: &str = "text/event-stream";

pub type DuplexTransport = AsyncRwTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

pub fn duplex_transports() -> (DuplexTransport, DuplexTransport) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_end);
    let (server_read, server_write) = tokio::io::split(server_end);
    (
        AsyncRwTransport::new(client_read, client_write),
        AsyncRwTransport::new(server_read, server_write),
    )
}

pub fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "test-client".to_string(),
            version: "1.0.0".to_string(),
        },
    }
}

/// Test server with a handful of tools exercising the session semantics.
#[derive(Clone, Default)]
pub struct TestServer {
    pub seen_request_ids: Arc<Mutex<Vec<RequestId>>>,
    pub tool_calls: Arc<Mutex<Vec<String>>>,
}

impl ServerHandler for TestServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_logging()
                .build(),
            server_info: Implementation {
                name: "test-server".to_string(),
                version: "1.0.0".to_string(),
            },
            instructions: None,
        }
    }

    async fn list_tools(&self, ctx: RequestContext) -> Result<Value, HandlerError> {
        self.seen_request_ids.lock().unwrap().push(ctx.id.clone());
        Ok(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "echo back the text argument",
                    "inputSchema": {"type": "object"}
                },
                {
                    "name": "wait_for_cancellation",
                    "description": "blocks until the request is cancelled",
                    "inputSchema": {"type": "object"}
                }
            ]
        }))
    }

    async fn call_tool(&self, ctx: RequestContext) -> Result<Value, HandlerError> {
        self.seen_request_ids.lock().unwrap().push(ctx.id.clone());
        let params = ctx.params.clone().unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.tool_calls.lock().unwrap().push(name.clone());
        match name.as_str() {
            "echo" => {
                let text = params
                    .pointer("/arguments/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false
                }))
            }
            "wait_for_cancellation" => {
                ctx.ct.cancelled().await;
                Err(HandlerError::Cancelled)
            }
            "slow_echo" => {
                // deliberately ignores the cancellation token
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(json!({"content": [{"type": "text", "text": "late"}]}))
            }
            "notify" => {
                ctx.peer
                    .send_notification(
                        "notifications/resources/updated",
                        Some(json!({"uri": "file:///watched.txt"})),
                    )
                    .await
                    .map_err(HandlerError::other)?;
                Ok(json!({"content": []}))
            }
            "progress" => {
                let progress = ctx.progress();
                progress
                    .report(0.5, Some(1.0), Some("half way".to_string()))
                    .await
                    .map_err(HandlerError::other)?;
                Ok(json!({"content": []}))
            }
            "boom" => Err(HandlerError::other(std::io::Error::other(
                "secret detail that must not reach the wire",
            ))),
            other => Err(HandlerError::Protocol(
                conduit_mcp::model::ErrorData::invalid_params(
                    format!("unknown tool: {other}"),
                    None,
                ),
            )),
        }
    }
}

/// Connect a client and a server over an in-process duplex pipe.
pub async fn connected_pair(
    server: TestServer,
    client_endpoint: Endpoint,
) -> (
    conduit_mcp::service::RunningClient,
    conduit_mcp::RunningSession,
) {
    let (client_transport, server_transport) = duplex_transports();
    let server_task =
        tokio::spawn(async move { conduit_mcp::serve_server(server, server_transport).await });
    let client = conduit_mcp::serve_client(client_endpoint, client_transport, client_info())
        .await
        .expect("client initialization");
    let server = server_task
        .await
        .expect("server task")
        .expect("server initialization");
    (client, server)
}

/// Credential extractor for tests: the `x-test-user` header is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderCredentialExtractor;

impl CredentialExtractor for HeaderCredentialExtractor {
    fn extract(&self, parts: &http::request::Parts) -> Option<UserIdClaim> {
        let value = parts
            .headers
            .get("x-test-user")?
            .to_str()
            .ok()?
            .to_string();
        Some(UserIdClaim {
            claim_type: "sub".to_string(),
            value,
            issuer: "test-issuer".to_string(),
        })
    }
}

pub struct TestHttpServer {
    pub url: String,
    pub registry: Arc<conduit_mcp::transport::streamable_http_server::registry::SessionRegistry>,
    pub ct: CancellationToken,
}

/// Bind a streamable HTTP server on an ephemeral port.
pub async fn start_streamable_server(config: StreamableHttpServerConfig) -> TestHttpServer {
    let ct = config.ct.clone();
    let service = StreamableHttpService::new(move || Ok(TestServer::default()), config)
        .with_credential_extractor(HeaderCredentialExtractor);
    let registry = service.registry().clone();
    let router = axum::Router::new().nest("/mcp", service.into_router());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let url = format!("http://{addr}/mcp");

    let shutdown = ct.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .expect("server");
    });
    TestHttpServer { url, registry, ct }
}

/// Parse an SSE body and return every `message` event as a JSON-RPC message.
pub fn message_events(body: &[u8]) -> Vec<JsonRpcMessage> {
    let mut parser = SseParser::new();
    parser
        .push(body)
        .into_iter()
        .filter(|event| event.event_type() == "message")
        .filter_map(|event| serde_json::from_str(event.data.as_deref()?).ok())
        .collect()
}

pub fn first_message_event(body: &[u8]) -> JsonRpcMessage {
    message_events(body)
        .into_iter()
        .next()
        .expect("at least one message event")
}

/// POST an `initialize` request without a session header, returning the
/// assigned session id and the initialize response.
pub async fn initialize_session(client: &reqwest::Client, url: &str) -> (String, JsonRpcMessage) {
    let response = client
        .post(url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0.0"}
            }
        }))
        .send()
        .await
        .expect("POST initialize");
    assert!(response.status().is_success(), "initialize should succeed");
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .expect("session id header")
        .to_str()
        .expect("header value")
        .to_string();
    let body = response.bytes().await.expect("initialize body");
    (session_id, first_message_event(&body))
}

pub async fn send_initialized(client: &reqwest::Client, url: &str, session_id: &str) {
    let response = client
        .post(url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .send()
        .await
        .expect("POST initialized");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
}

/// POST a request on an existing session and return the reply carried in the
/// SSE body.
pub async fn post_request(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    body: Value,
) -> JsonRpcMessage {
    let response = client
        .post(url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", session_id)
        .json(&body)
        .send()
        .await
        .expect("POST request");
    assert!(response.status().is_success());
    let bytes = response.bytes().await.expect("response body");
    first_message_event(&bytes)
}
