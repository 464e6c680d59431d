//! Stateless operating mode.
//!
//! The session id handed to the client is an encrypted envelope holding the
//! client's declared implementation and the captured user identity. Nothing
//! is retained server-side between requests: every POST decrypts the
//! envelope, reconstructs a transient session, serves the one exchange, and
//! disposes it.
//!
//! The envelope carries no nonce or session epoch; replay protection relies
//! on the AEAD key and transport-level TLS.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::{StatusCode, request::Parts};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    PostPayload, StreamableHttpService, auth::UserIdClaim, check_post_headers,
    jsonrpc_error_body, parse_post_body, session::{REPLY_CHANNEL_CAPACITY, session_channels},
    session_header, sse_single_event_response,
};
use crate::{
    model::{ErrorData, Implementation, InitializeRequestParam, JsonRpcMessage, method},
    protect::SecretProtector,
    service::{ServerHandler, serve_server_directly},
    transport::{Inbound, MessageContext},
};

/// What the encrypted session id decrypts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StatelessSessionEnvelope {
    pub client_info: Implementation,
    pub user: Option<UserIdClaim>,
}

pub(crate) fn seal(
    protector: &dyn SecretProtector,
    envelope: &StatelessSessionEnvelope,
) -> Option<String> {
    let bytes = serde_json::to_vec(envelope).ok()?;
    let protected = protector.protect(&bytes).ok()?;
    Some(URL_SAFE_NO_PAD.encode(protected))
}

pub(crate) fn unseal(
    protector: &dyn SecretProtector,
    header: &str,
) -> Option<StatelessSessionEnvelope> {
    let protected = URL_SAFE_NO_PAD.decode(header).ok()?;
    let bytes = protector.unprotect(&protected).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub(crate) async fn handle_post<H: ServerHandler>(
    service: &Arc<StreamableHttpService<H>>,
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
    let message = match payload {
        PostPayload::Message(message) => message,
        PostPayload::Batch(_) => {
            return jsonrpc_error_body(
                StatusCode::NOT_IMPLEMENTED,
                ErrorData::invalid_request("batch requests are not supported", None),
            );
        }
    };

    match session_header(&parts) {
        None => initialize_transient(service, parts, message).await,
        Some(header) => {
            let Some(envelope) = unseal(service.protector.as_ref(), &header) else {
                return jsonrpc_error_body(
                    StatusCode::NOT_FOUND,
                    ErrorData::session_not_found(),
                );
            };
            if service.credential_extractor.extract(&parts) != envelope.user {
                return jsonrpc_error_body(
                    StatusCode::FORBIDDEN,
                    ErrorData::new(
                        crate::model::ErrorCode::SERVER_ERROR,
                        "authenticated user does not match the session owner",
                        None,
                    ),
                );
            }
            match message {
                JsonRpcMessage::Request(_) => {
                    match run_transient(service, parts, message).await {
                        Ok(reply) => sse_single_event_response(&reply, None),
                        Err(response) => response,
                    }
                }
                _ => {
                    // nothing outlives the request, so there is no session
                    // state a notification could affect
                    tracing::debug!("accepted client message with no transient effect");
                    StatusCode::ACCEPTED.into_response()
                }
            }
        }
    }
}

/// First POST: the response header is deferred until the `initialize`
/// params are observed, so the declared `clientInfo` ends up in the
/// envelope.
async fn initialize_transient<H: ServerHandler>(
    service: &Arc<StreamableHttpService<H>>,
    parts: Parts,
    message: JsonRpcMessage,
) -> Response {
    let JsonRpcMessage::Request(request) = &message else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            ErrorData::invalid_request("Mcp-Session-Id header is required", None),
        );
    };
    if request.method != method::INITIALIZE {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            ErrorData::invalid_request("Mcp-Session-Id header is required", None),
        );
    }
    let peer_info: InitializeRequestParam = match serde_json::from_value(
        request.params.clone().unwrap_or(serde_json::Value::Null),
    ) {
        Ok(peer_info) => peer_info,
        Err(error) => {
            return jsonrpc_error_body(
                StatusCode::BAD_REQUEST,
                ErrorData::invalid_params(error.to_string(), None),
            );
        }
    };

    let envelope = StatelessSessionEnvelope {
        client_info: peer_info.client_info,
        user: service.credential_extractor.extract(&parts),
    };
    let Some(sealed) = seal(service.protector.as_ref(), &envelope) else {
        return jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorData::internal_error("failed to seal session envelope", None),
        );
    };

    match run_transient(service, parts, message).await {
        Ok(reply) => sse_single_event_response(&reply, Some(&sealed)),
        Err(response) => response,
    }
}

/// Build a fresh transport and session, serve the single exchange, and
/// dispose the session once the reply is in hand.
async fn run_transient<H: ServerHandler>(
    service: &Arc<StreamableHttpService<H>>,
    parts: Parts,
    message: JsonRpcMessage,
) -> Result<JsonRpcMessage, Response> {
    let handler = (service.handler_factory)().map_err(|error| {
        tracing::error!(%error, "session handler factory failed");
        jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorData::internal_error("failed to create session", None),
        )
    })?;
    let (channels, transport) = session_channels();
    let ct = CancellationToken::new();
    let running = serve_server_directly(handler, transport, ct);

    let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
    let mut context = MessageContext::new().with_reply_sink(reply_tx);
    context.extensions.insert(parts);
    if channels.feed.send(Inbound { message, context }).await.is_err() {
        return Err(jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorData::internal_error("transient session terminated", None),
        ));
    }
    let reply = reply_rx.recv().await;
    let _ = running.cancel().await;
    reply.ok_or_else(|| {
        jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorData::internal_error("transient session produced no reply", None),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::ChaChaProtector;

    #[test]
    fn test_envelope_seal_unseal() {
        let protector = ChaChaProtector::generate();
        let envelope = StatelessSessionEnvelope {
            client_info: Implementation {
                name: "client".into(),
                version: "1.2.3".into(),
            },
            user: Some(UserIdClaim {
                claim_type: "sub".into(),
                value: "user-1".into(),
                issuer: "https://issuer.example".into(),
            }),
        };
        let sealed = seal(&protector, &envelope).unwrap();
        let opened = unseal(&protector, &sealed).unwrap();
        assert_eq!(opened, envelope);
    }

    #[test]
    fn test_tampered_envelope_does_not_unseal() {
        let protector = ChaChaProtector::generate();
        let envelope = StatelessSessionEnvelope {
            client_info: Implementation {
                name: "client".into(),
                version: "1.2.3".into(),
            },
            user: None,
        };
        let sealed = seal(&protector, &envelope).unwrap();
        let mut tampered = sealed.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(unseal(&protector, &tampered).is_none());
    }
}
