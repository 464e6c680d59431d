use std::{borrow::Cow, sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, Peer, QuitReason, RunningSession, spawn_session};
use crate::{
    model::{ClientInfo, InitializeResult, JsonRpcMessage, ProtocolVersion, RequestId, method},
    transport::{DynamicTransportError, Transport},
};

/// It represents the error that may occur when serving the client.
#[derive(Error, Debug)]
pub enum ClientInitializeError {
    #[error("expect initialize response, but received: {0:?}")]
    ExpectedInitResponse(Option<JsonRpcMessage>),

    #[error("conflict initialize response id: expected {0}, got {1}")]
    ConflictInitResponseId(RequestId, RequestId),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("send message error {error}, when {context}")]
    TransportError {
        #[source]
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("protocol version mismatch: requested {requested}, server returned {received}")]
    VersionMismatch {
        requested: ProtocolVersion,
        received: ProtocolVersion,
    },

    #[error("initialization did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("invalid initialize payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ClientInitializeError {
    fn transport<T: Transport>(error: T::Error, context: impl Into<Cow<'static, str>>) -> Self {
        Self::TransportError {
            error: DynamicTransportError::new::<T>(error),
            context: context.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upper bound on the whole `initialize` exchange.
    pub initialize_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            initialize_timeout: Duration::from_secs(60),
        }
    }
}

/// A client session that completed the `initialize` handshake.
pub struct RunningClient {
    session: RunningSession,
    server_info: InitializeResult,
}

impl RunningClient {
    pub fn peer(&self) -> &Peer {
        self.session.peer()
    }

    /// What the server announced during `initialize`.
    pub fn server_info(&self) -> &InitializeResult {
        &self.server_info
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancellation_token()
    }

    pub async fn waiting(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.session.waiting().await
    }

    pub async fn cancel(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.session.cancel().await
    }
}

pub async fn serve_client<T: Transport>(
    endpoint: Endpoint,
    transport: T,
    info: ClientInfo,
) -> Result<RunningClient, ClientInitializeError> {
    serve_client_with_ct(
        endpoint,
        transport,
        info,
        ClientOptions::default(),
        CancellationToken::new(),
    )
    .await
}

/// Connect the transport, run the `initialize` handshake, verify the
/// negotiated protocol version, send `notifications/initialized`, and start
/// the session. On timeout or version mismatch the transport is disposed and
/// a dedicated error is returned.
pub async fn serve_client_with_ct<T: Transport>(
    endpoint: Endpoint,
    mut transport: T,
    info: ClientInfo,
    options: ClientOptions,
    ct: CancellationToken,
) -> Result<RunningClient, ClientInitializeError> {
    let requested_version = info.protocol_version.clone();
    let handshake = async {
        let id = RequestId::Number(1);
        let params = serde_json::to_value(&info)?;
        transport
            .send(JsonRpcMessage::request(
                id.clone(),
                method::INITIALIZE,
                Some(params),
            ))
            .await
            .map_err(|error| {
                ClientInitializeError::transport::<T>(error, "send initialize request")
            })?;

        let inbound = transport.receive().await.ok_or_else(|| {
            ClientInitializeError::ConnectionClosed("initialize response".to_string())
        })?;
        let (response_id, result) = match inbound.message {
            JsonRpcMessage::Response(response) => (response.id, response.result),
            other => return Err(ClientInitializeError::ExpectedInitResponse(Some(other))),
        };
        if response_id != id {
            return Err(ClientInitializeError::ConflictInitResponseId(
                id,
                response_id,
            ));
        }
        let server_info: InitializeResult = serde_json::from_value(result)?;
        if server_info.protocol_version != requested_version {
            return Err(ClientInitializeError::VersionMismatch {
                requested: requested_version.clone(),
                received: server_info.protocol_version,
            });
        }

        transport
            .send(JsonRpcMessage::notification(
                method::NOTIFICATION_INITIALIZED,
                None,
            ))
            .await
            .map_err(|error| {
                ClientInitializeError::transport::<T>(error, "send initialized notification")
            })?;
        Ok(server_info)
    };

    let timeout = options.initialize_timeout;
    let outcome = tokio::select! {
        handshake = tokio::time::timeout(timeout, handshake) => {
            handshake.unwrap_or(Err(ClientInitializeError::Timeout { timeout }))
        }
        _ = ct.cancelled() => Err(ClientInitializeError::Cancelled),
    };
    let server_info = match outcome {
        Ok(server_info) => server_info,
        Err(error) => {
            let _ = transport.close().await;
            return Err(error);
        }
    };

    let mut endpoint = endpoint;
    if !endpoint.request_handlers.contains_key(method::PING) {
        endpoint.insert_request_handler(
            method::PING.to_string(),
            Arc::new(|_ctx| Box::pin(async { Ok(Value::Object(Default::default())) })),
        );
    }

    let session_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
    let session = spawn_session(endpoint, transport, ct, session_id, 2);
    Ok(RunningClient {
        session,
        server_info,
    })
}
