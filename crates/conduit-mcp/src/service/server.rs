use std::{borrow::Cow, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, RequestContext, RunningSession, spawn_session};
use crate::{
    error::HandlerError,
    model::{
        ErrorData, InitializeRequestParam, InitializeResult, JsonRpcMessage, ProtocolVersion,
        ServerCapabilities, ServerInfo, method,
    },
    transport::{DynamicTransportError, Inbound, Transport},
};

/// Collaborator that produces the responses for the MCP server surface.
///
/// The endpoint registers a method handler only for the subsets whose
/// capability [`get_info`](Self::get_info) declares; everything else answers
/// `-32601`. `ping` is always registered.
pub trait ServerHandler: Send + Sync + 'static {
    fn get_info(&self) -> ServerInfo;

    fn ping(&self, _ctx: RequestContext) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Ok(Value::Object(Default::default())) }
    }

    fn list_tools(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::TOOLS_LIST).into()) }
    }

    fn call_tool(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::TOOLS_CALL).into()) }
    }

    fn list_prompts(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::PROMPTS_LIST).into()) }
    }

    fn get_prompt(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::PROMPTS_GET).into()) }
    }

    fn list_resources(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::RESOURCES_LIST).into()) }
    }

    fn read_resource(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::RESOURCES_READ).into()) }
    }

    fn subscribe_resource(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::RESOURCES_SUBSCRIBE).into()) }
    }

    fn unsubscribe_resource(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::RESOURCES_UNSUBSCRIBE).into()) }
    }

    fn list_resource_templates(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::RESOURCES_TEMPLATES_LIST).into()) }
    }

    fn complete(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::COMPLETION_COMPLETE).into()) }
    }

    fn set_level(
        &self,
        _ctx: RequestContext,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        async { Err(ErrorData::method_not_found(method::LOGGING_SET_LEVEL).into()) }
    }
}

/// It represents the error that may occur when serving the server.
#[derive(Error, Debug)]
pub enum ServerInitializeError {
    #[error("expect initialize request, but received: {0:?}")]
    ExpectedInitRequest(Option<JsonRpcMessage>),

    #[error("expect initialized notification, but received: {0:?}")]
    ExpectedInitNotification(Option<JsonRpcMessage>),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("send message error {error}, when {context}")]
    TransportError {
        #[source]
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("invalid initialize payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

fn negotiate_version(requested: &ProtocolVersion) -> ProtocolVersion {
    if requested.is_supported() {
        requested.clone()
    } else {
        ProtocolVersion::LATEST
    }
}

fn initialize_result(info: &ServerInfo, requested: &ProtocolVersion) -> InitializeResult {
    InitializeResult {
        protocol_version: negotiate_version(requested),
        capabilities: info.capabilities.clone(),
        server_info: info.server_info.clone(),
        instructions: info.instructions.clone(),
    }
}

fn build_server_endpoint<H: ServerHandler>(
    handler: Arc<H>,
    capabilities: &ServerCapabilities,
) -> Endpoint {
    let mut endpoint = Endpoint::new();
    macro_rules! register {
        ($method:expr, $handler_fn:ident) => {{
            let handler = handler.clone();
            endpoint.insert_request_handler(
                $method.to_string(),
                Arc::new(move |ctx| {
                    let handler = handler.clone();
                    Box::pin(async move { handler.$handler_fn(ctx).await })
                }),
            );
        }};
    }

    register!(method::PING, ping);
    if capabilities.tools.is_some() {
        register!(method::TOOLS_LIST, list_tools);
        register!(method::TOOLS_CALL, call_tool);
    }
    if capabilities.prompts.is_some() {
        register!(method::PROMPTS_LIST, list_prompts);
        register!(method::PROMPTS_GET, get_prompt);
    }
    if let Some(resources) = &capabilities.resources {
        register!(method::RESOURCES_LIST, list_resources);
        register!(method::RESOURCES_READ, read_resource);
        register!(method::RESOURCES_TEMPLATES_LIST, list_resource_templates);
        if resources.subscribe == Some(true) {
            register!(method::RESOURCES_SUBSCRIBE, subscribe_resource);
            register!(method::RESOURCES_UNSUBSCRIBE, unsubscribe_resource);
        }
    }
    if capabilities.completions.is_some() {
        register!(method::COMPLETION_COMPLETE, complete);
    }
    if capabilities.logging.is_some() {
        register!(method::LOGGING_SET_LEVEL, set_level);
    }
    endpoint
}

pub async fn serve_server<H: ServerHandler, T: Transport>(
    handler: H,
    transport: T,
) -> Result<RunningSession, ServerInitializeError> {
    serve_server_with_ct(handler, transport, CancellationToken::new()).await
}

/// Accept a transport, run the server side of the `initialize` handshake,
/// then start the session with the capability-declared method handlers.
pub async fn serve_server_with_ct<H: ServerHandler, T: Transport>(
    handler: H,
    mut transport: T,
    ct: CancellationToken,
) -> Result<RunningSession, ServerInitializeError> {
    let handler = Arc::new(handler);
    let info = handler.get_info();

    let handshake = async {
        let inbound = transport.receive().await.ok_or_else(|| {
            ServerInitializeError::ConnectionClosed("initialize request".to_string())
        })?;
        let Inbound { message, context } = inbound;
        let request = match message {
            JsonRpcMessage::Request(request) if request.method == method::INITIALIZE => request,
            other => return Err(ServerInitializeError::ExpectedInitRequest(Some(other))),
        };
        let peer_info: InitializeRequestParam =
            serde_json::from_value(request.params.unwrap_or(Value::Null))?;
        tracing::info!(
            client = %peer_info.client_info.name,
            version = %peer_info.client_info.version,
            protocol = %peer_info.protocol_version,
            "initialize requested"
        );

        let result = initialize_result(&info, &peer_info.protocol_version);
        let response = JsonRpcMessage::response(request.id, serde_json::to_value(&result)?);
        match context.reply_sink {
            Some(sink) => {
                if sink.send(response).await.is_err() {
                    return Err(ServerInitializeError::ConnectionClosed(
                        "initialize reply channel closed".to_string(),
                    ));
                }
            }
            None => {
                transport.send(response).await.map_err(|error| {
                    ServerInitializeError::TransportError {
                        error: DynamicTransportError::new::<T>(error),
                        context: "send initialize response".into(),
                    }
                })?;
            }
        }

        let inbound = transport.receive().await.ok_or_else(|| {
            ServerInitializeError::ConnectionClosed("initialized notification".to_string())
        })?;
        match inbound.message {
            JsonRpcMessage::Notification(notification)
                if notification.method == method::NOTIFICATION_INITIALIZED => {}
            other => return Err(ServerInitializeError::ExpectedInitNotification(Some(other))),
        }
        Ok(peer_info)
    };

    let outcome = tokio::select! {
        outcome = handshake => outcome,
        _ = ct.cancelled() => Err(ServerInitializeError::Cancelled),
    };
    if let Err(error) = outcome {
        let _ = transport.close().await;
        return Err(error);
    }

    let endpoint = build_server_endpoint(handler, &info.capabilities);
    let session_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
    Ok(spawn_session(endpoint, transport, ct, session_id, 1))
}

/// Start a server session without waiting for the handshake. The
/// `initialize` request, when it arrives, is answered by a regular method
/// handler. Stateless HTTP mode uses this to rebuild a transient session per
/// request.
pub fn serve_server_directly<H: ServerHandler, T: Transport>(
    handler: H,
    transport: T,
    ct: CancellationToken,
) -> RunningSession {
    let handler = Arc::new(handler);
    let info = handler.get_info();
    let mut endpoint = build_server_endpoint(handler, &info.capabilities);
    endpoint.insert_request_handler(
        method::INITIALIZE.to_string(),
        Arc::new(move |ctx| {
            let info = info.clone();
            Box::pin(async move {
                let peer_info: InitializeRequestParam = ctx.parse_params()?;
                let result = initialize_result(&info, &peer_info.protocol_version);
                Ok(serde_json::to_value(result).map_err(HandlerError::from)?)
            })
        }),
    );
    let session_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
    spawn_session(endpoint, transport, ct, session_id, 1)
}
