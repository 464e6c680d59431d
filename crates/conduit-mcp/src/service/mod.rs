//! The session multiplexer.
//!
//! A session owns one [`Transport`] and drives a read loop over it. Outgoing
//! requests are correlated with incoming responses through per-id one-shot
//! slots; incoming requests and notifications are dispatched to registered
//! handlers on freshly spawned tasks so a handler that replies can never
//! deadlock the read loop. Cancellation is cooperative in both directions via
//! `notifications/cancelled`.

mod client;
mod progress;
mod server;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

pub use client::{
    ClientInitializeError, ClientOptions, RunningClient, serve_client, serve_client_with_ct,
};
use futures::future::BoxFuture;
pub use progress::ProgressReporter;
use serde_json::Value;
pub use server::{
    ServerHandler, ServerInitializeError, serve_server, serve_server_directly,
    serve_server_with_ct,
};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    error::{HandlerError, ServiceError},
    model::{
        CancelledNotificationParam, ErrorData, Extensions, JsonRpcMessage, JsonRpcNotification,
        JsonRpcRequest, Meta, ProgressNotificationParam, RequestId, method,
    },
    telemetry::{self, TraceContext},
    transport::{DynamicTransportError, Inbound, MessageContext, ReplySink, Transport},
};

pub type RequestHandlerFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

pub type NotificationHandlerFn =
    Arc<dyn Fn(NotificationContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Everything an inbound request handler gets to see.
///
/// `extensions` carries the request-scoped ambient state captured at
/// transport ingress; `ct` fires when the peer cancels this request or the
/// session shuts down.
#[derive(Debug)]
pub struct RequestContext {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
    pub meta: Meta,
    pub extensions: Extensions,
    pub peer: Peer,
    pub ct: CancellationToken,
}

impl RequestContext {
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let params = self.params.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(params)?)
    }

    /// Progress sink bound to this request's progress token. Requests
    /// without a token get a no-op reporter.
    pub fn progress(&self) -> ProgressReporter {
        ProgressReporter::new(self.peer.clone(), self.meta.progress_token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub method: String,
    pub params: Option<Value>,
    pub meta: Meta,
    pub extensions: Extensions,
    pub peer: Peer,
}

/// Handler registries for one side of a connection, populated before the
/// session starts. Notification handlers can additionally be added and
/// removed at runtime through [`Peer::register_notification_handler`].
#[derive(Default)]
pub struct Endpoint {
    request_handlers: HashMap<String, RequestHandlerFn>,
    notification_handlers: Vec<(String, NotificationHandlerFn)>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler. Method lookup is ordinal and
    /// case-sensitive; registering the same method twice keeps the last
    /// handler.
    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.request_handlers
            .insert(method.into(), Arc::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    pub fn on_notification<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.notification_handlers
            .push((method.into(), Arc::new(move |ctx| Box::pin(handler(ctx)))));
        self
    }

    pub(crate) fn insert_request_handler(&mut self, method: String, handler: RequestHandlerFn) {
        self.request_handlers.insert(method, handler);
    }
}

tokio::task_local! {
    static CURRENT_NOTIFICATION_HANDLER: u64;
}

#[derive(Default)]
struct HandlerActivity {
    running: AtomicUsize,
    idle: Notify,
}

impl HandlerActivity {
    fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            activity: self.clone(),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ActivityGuard {
    activity: Arc<HandlerActivity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.activity.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.activity.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
struct RegisteredNotificationHandler {
    id: u64,
    handler: NotificationHandlerFn,
    activity: Arc<HandlerActivity>,
}

struct Outbound {
    message: JsonRpcMessage,
    sink: Option<ReplySink>,
    ack: oneshot::Sender<Result<(), DynamicTransportError>>,
}

struct SessionInner {
    session_id: Arc<str>,
    transport_kind: &'static str,
    outbound_tx: mpsc::Sender<Outbound>,
    // each pending id is present at most once; removed on response, error,
    // cancellation, or shutdown
    pending_requests: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, ErrorData>>>>,
    // present iff a handler task is executing for that id
    handling_requests: Mutex<HashMap<RequestId, CancellationToken>>,
    notification_handlers: RwLock<HashMap<String, Vec<RegisteredNotificationHandler>>>,
    last_outbound_id: AtomicU64,
    next_registration_id: AtomicU64,
    started_at: Instant,
}

/// Handle to the remote endpoint of a running session.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("session_id", &self.inner.session_id)
            .field("transport", &self.inner.transport_kind)
            .finish()
    }
}

impl Peer {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Fire-and-forget write of any message, serialized with all other
    /// outbound traffic on this session.
    pub async fn send_message(&self, message: JsonRpcMessage) -> Result<(), ServiceError> {
        self.write(message, None).await
    }

    pub async fn send_notification(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.send_message(JsonRpcMessage::notification(method, params))
            .await
    }

    pub async fn notify_cancelled(
        &self,
        param: CancelledNotificationParam,
    ) -> Result<(), ServiceError> {
        let params = serde_json::to_value(param).ok();
        self.send_notification(method::NOTIFICATION_CANCELLED, params)
            .await
    }

    pub async fn notify_progress(
        &self,
        param: ProgressNotificationParam,
    ) -> Result<(), ServiceError> {
        let params = serde_json::to_value(param).ok();
        self.send_notification(method::NOTIFICATION_PROGRESS, params)
            .await
    }

    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, ServiceError> {
        self.send_request_with_meta(method, params, Meta::default(), CancellationToken::new())
            .await
    }

    pub async fn send_request_with_ct(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        ct: CancellationToken,
    ) -> Result<Value, ServiceError> {
        self.send_request_with_meta(method, params, Meta::default(), ct)
            .await
    }

    /// Send a request and await the matching response.
    ///
    /// The pending slot is registered before the write, and the caller's
    /// cancellation is honored only after the request has actually reached
    /// the wire: a `notifications/cancelled` is never sent for an id the
    /// peer has not observed. A token that is already cancelled short-circuits
    /// without writing anything.
    pub async fn send_request_with_meta(
        &self,
        method: impl Into<String>,
        mut params: Option<Value>,
        mut meta: Meta,
        ct: CancellationToken,
    ) -> Result<Value, ServiceError> {
        if ct.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let method = method.into();
        let id = RequestId::Number(self.inner.last_outbound_id.fetch_add(1, Ordering::Relaxed) as i64);

        TraceContext::generate().apply(&mut meta);
        meta.inject(&mut params);

        let target = telemetry::method_target(&method, params.as_ref());
        let span = telemetry::request_span(
            "outbound",
            &method,
            target.as_deref(),
            &self.inner.session_id,
            &id.to_string(),
            self.inner.transport_kind,
        );
        let started = Instant::now();

        let (slot_tx, slot_rx) = oneshot::channel();
        self.inner
            .pending_requests
            .lock()
            .await
            .insert(id.clone(), slot_tx);

        if let Err(error) = self
            .write(JsonRpcMessage::request(id.clone(), method.clone(), params), None)
            .await
        {
            self.inner.pending_requests.lock().await.remove(&id);
            telemetry::record_operation(
                &span,
                &method,
                self.inner.transport_kind,
                Some("transport_error"),
                started,
            );
            return Err(error);
        }

        let outcome = tokio::select! {
            outcome = slot_rx => outcome,
            _ = ct.cancelled() => {
                self.inner.pending_requests.lock().await.remove(&id);
                let _ = self
                    .notify_cancelled(CancelledNotificationParam {
                        request_id: id,
                        reason: None,
                    })
                    .await;
                telemetry::record_operation(
                    &span,
                    &method,
                    self.inner.transport_kind,
                    Some("cancelled"),
                    started,
                );
                return Err(ServiceError::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(result)) => {
                let error_type =
                    telemetry::is_tool_error(&method, &result).then_some("tool_error");
                telemetry::record_operation(
                    &span,
                    &method,
                    self.inner.transport_kind,
                    error_type,
                    started,
                );
                Ok(result)
            }
            Ok(Err(error)) => {
                telemetry::record_operation(
                    &span,
                    &method,
                    self.inner.transport_kind,
                    Some("mcp_error"),
                    started,
                );
                Err(ServiceError::McpError(error))
            }
            Err(_) => {
                telemetry::record_operation(
                    &span,
                    &method,
                    self.inner.transport_kind,
                    Some("transport_closed"),
                    started,
                );
                Err(ServiceError::TransportClosed)
            }
        }
    }

    /// Add a handler for a notification method. Multiple handlers per
    /// method are allowed and run in registration order.
    pub async fn register_notification_handler<F, Fut>(
        &self,
        method: impl Into<String>,
        handler: F,
    ) -> NotificationHandlerHandle
    where
        F: Fn(NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let method = method.into();
        let id = self.inner.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let registered = RegisteredNotificationHandler {
            id,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            activity: Arc::new(HandlerActivity::default()),
        };
        self.inner
            .notification_handlers
            .write()
            .await
            .entry(method.clone())
            .or_default()
            .push(registered);
        NotificationHandlerHandle {
            inner: self.inner.clone(),
            method,
            id,
        }
    }

    async fn write(
        &self,
        message: JsonRpcMessage,
        sink: Option<ReplySink>,
    ) -> Result<(), ServiceError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .outbound_tx
            .send(Outbound {
                message,
                sink,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ServiceError::TransportClosed)?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ServiceError::TransportSend(error)),
            Err(_) => Err(ServiceError::TransportClosed),
        }
    }
}

/// Removes a notification handler registered through
/// [`Peer::register_notification_handler`].
pub struct NotificationHandlerHandle {
    inner: Arc<SessionInner>,
    method: String,
    id: u64,
}

impl NotificationHandlerHandle {
    /// Remove the handler. Returns only once every in-progress invocation of
    /// it has completed, unless called from inside the handler itself, in
    /// which case it returns immediately.
    pub async fn unregister(self) {
        let removed = {
            let mut registry = self.inner.notification_handlers.write().await;
            let Some(handlers) = registry.get_mut(&self.method) else {
                return;
            };
            let Some(position) = handlers.iter().position(|handler| handler.id == self.id)
            else {
                return;
            };
            let removed = handlers.remove(position);
            if handlers.is_empty() {
                registry.remove(&self.method);
            }
            removed
        };
        let reentrant = CURRENT_NOTIFICATION_HANDLER
            .try_with(|current| *current == self.id)
            .unwrap_or(false);
        if reentrant {
            return;
        }
        removed.activity.wait_idle().await;
    }
}

/// Why a session's read loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// The transport's message stream ended.
    Closed,
    /// The session's cancellation token fired.
    Cancelled,
}

/// A session whose read loop is running.
pub struct RunningSession {
    peer: Peer,
    ct: CancellationToken,
    handle: tokio::task::JoinHandle<QuitReason>,
}

impl RunningSession {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    pub async fn waiting(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.handle.await
    }

    pub async fn cancel(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.ct.cancel();
        self.handle.await
    }
}

/// Run a session over a transport without any initialization handshake.
pub fn serve_directly<T: Transport>(
    endpoint: Endpoint,
    transport: T,
    ct: CancellationToken,
) -> RunningSession {
    let session_id: Arc<str> = uuid::Uuid::new_v4().to_string().into();
    spawn_session(endpoint, transport, ct, session_id, 1)
}

pub(crate) fn spawn_session<T: Transport>(
    endpoint: Endpoint,
    transport: T,
    ct: CancellationToken,
    session_id: Arc<str>,
    first_outbound_id: u64,
) -> RunningSession {
    let (outbound_tx, outbound_rx) = mpsc::channel(64);

    let mut next_registration_id = 1u64;
    let mut notification_handlers: HashMap<String, Vec<RegisteredNotificationHandler>> =
        HashMap::new();
    for (method, handler) in endpoint.notification_handlers {
        let registered = RegisteredNotificationHandler {
            id: next_registration_id,
            handler,
            activity: Arc::new(HandlerActivity::default()),
        };
        next_registration_id += 1;
        notification_handlers.entry(method).or_default().push(registered);
    }

    let transport_kind = transport.kind().as_str();
    let inner = Arc::new(SessionInner {
        session_id: session_id.clone(),
        transport_kind,
        outbound_tx,
        pending_requests: Mutex::new(HashMap::new()),
        handling_requests: Mutex::new(HashMap::new()),
        notification_handlers: RwLock::new(notification_handlers),
        last_outbound_id: AtomicU64::new(first_outbound_id),
        next_registration_id: AtomicU64::new(next_registration_id),
        started_at: Instant::now(),
    });
    let peer = Peer {
        inner: inner.clone(),
    };
    let request_handlers = Arc::new(endpoint.request_handlers);

    let span = tracing::info_span!(
        "mcp.session",
        mcp.session.id = session_id.as_ref(),
        network.transport = transport_kind,
    );
    let handle = tokio::spawn(
        run_session(
            transport,
            inner,
            outbound_rx,
            request_handlers,
            peer.clone(),
            ct.clone(),
        )
        .instrument(span),
    );
    RunningSession { peer, ct, handle }
}

async fn run_session<T: Transport>(
    mut transport: T,
    inner: Arc<SessionInner>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    request_handlers: Arc<HashMap<String, RequestHandlerFn>>,
    peer: Peer,
    ct: CancellationToken,
) -> QuitReason {
    let quit_reason = loop {
        tokio::select! {
            _ = ct.cancelled() => break QuitReason::Cancelled,
            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else {
                    break QuitReason::Closed;
                };
                write_outbound(&mut transport, outbound).await;
            }
            inbound = transport.receive() => {
                let Some(inbound) = inbound else {
                    tracing::debug!("transport stream ended");
                    break QuitReason::Closed;
                };
                dispatch_inbound(inbound, &inner, &request_handlers, &peer, &ct).await;
            }
        }
    };

    // fail every remaining awaiter and cancel in-flight inbound handlers
    inner.pending_requests.lock().await.clear();
    for (_, token) in inner.handling_requests.lock().await.drain() {
        token.cancel();
    }
    let _ = transport.close().await;
    telemetry::record_session_duration(
        &inner.session_id,
        inner.transport_kind,
        inner.started_at,
    );
    tracing::info!(reason = ?quit_reason, "session terminated");
    quit_reason
}

async fn write_outbound<T: Transport>(transport: &mut T, outbound: Outbound) {
    let Outbound { message, sink, ack } = outbound;
    let result = match sink {
        Some(sink) => {
            // pinned to a request/reply channel instead of the transport
            if sink.send(message).await.is_err() {
                tracing::warn!("reply channel closed before the reply could be written");
            }
            Ok(())
        }
        None => transport
            .send(message)
            .await
            .map_err(DynamicTransportError::new::<T>),
    };
    let _ = ack.send(result);
}

async fn dispatch_inbound(
    inbound: Inbound,
    inner: &Arc<SessionInner>,
    request_handlers: &Arc<HashMap<String, RequestHandlerFn>>,
    peer: &Peer,
    ct: &CancellationToken,
) {
    let Inbound { message, context } = inbound;
    tracing::debug!(kind = message.kind(), "received message");
    match message {
        JsonRpcMessage::Request(request) => {
            let request_ct = ct.child_token();
            {
                let mut handling = inner.handling_requests.lock().await;
                if handling.contains_key(&request.id) {
                    drop(handling);
                    tracing::warn!(id = %request.id, "duplicate in-flight request id");
                    let reply = JsonRpcMessage::error(
                        request.id,
                        ErrorData::invalid_request("duplicate request id", None),
                    );
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let _ = peer.write(reply, context.reply_sink).await;
                    });
                    return;
                }
                // registered before the handler task exists, so a cancelled
                // notification arriving on the heels of the request cannot
                // race past it
                handling.insert(request.id.clone(), request_ct.clone());
            }
            tokio::spawn(handle_request(
                request,
                context,
                request_ct,
                inner.clone(),
                request_handlers.clone(),
                peer.clone(),
            ));
        }
        JsonRpcMessage::Notification(notification) => {
            dispatch_notification(notification, context, inner, peer).await;
        }
        JsonRpcMessage::Response(response) => {
            complete_pending(inner, response.id, Ok(response.result)).await;
        }
        JsonRpcMessage::Error(error) => {
            complete_pending(inner, error.id, Err(error.error)).await;
        }
    }
}

async fn dispatch_notification(
    mut notification: JsonRpcNotification,
    context: MessageContext,
    inner: &Arc<SessionInner>,
    peer: &Peer,
) {
    if notification.method == method::NOTIFICATION_CANCELLED {
        // fire the in-flight request's token before any user handler runs;
        // malformed payloads are ignored
        if let Some(params) = notification.params.clone() {
            if let Ok(param) = serde_json::from_value::<CancelledNotificationParam>(params) {
                if let Some(token) = inner.handling_requests.lock().await.get(&param.request_id) {
                    tracing::debug!(
                        id = %param.request_id,
                        reason = ?param.reason,
                        "peer cancelled in-flight request"
                    );
                    token.cancel();
                }
            }
        }
    }

    let meta = Meta::extract(&mut notification.params);
    let handlers = inner
        .notification_handlers
        .read()
        .await
        .get(&notification.method)
        .cloned()
        .unwrap_or_default();
    if handlers.is_empty() {
        tracing::debug!(method = %notification.method, "no handler for notification");
        return;
    }
    let ctx = NotificationContext {
        method: notification.method,
        params: notification.params,
        meta,
        extensions: context.extensions,
        peer: peer.clone(),
    };
    tokio::spawn(run_notification_handlers(handlers, ctx));
}

async fn run_notification_handlers(
    handlers: Vec<RegisteredNotificationHandler>,
    ctx: NotificationContext,
) {
    for registered in handlers {
        let guard = registered.activity.begin();
        let result = CURRENT_NOTIFICATION_HANDLER
            .scope(registered.id, (registered.handler)(ctx.clone()))
            .await;
        drop(guard);
        // one handler failing must not starve the others
        if let Err(error) = result {
            tracing::warn!(method = %ctx.method, error = %error, "notification handler failed");
        }
    }
}

async fn complete_pending(
    inner: &Arc<SessionInner>,
    id: RequestId,
    outcome: Result<Value, ErrorData>,
) {
    let slot = inner.pending_requests.lock().await.remove(&id);
    match slot {
        Some(slot) => {
            let _ = slot.send(outcome);
        }
        None => {
            tracing::warn!(id = %id, "dropping response with no matching pending request");
        }
    }
}

async fn handle_request(
    mut request: JsonRpcRequest,
    context: MessageContext,
    request_ct: CancellationToken,
    inner: Arc<SessionInner>,
    request_handlers: Arc<HashMap<String, RequestHandlerFn>>,
    peer: Peer,
) {
    let meta = Meta::extract(&mut request.params);
    let target = telemetry::method_target(&request.method, request.params.as_ref());
    let span = telemetry::request_span(
        "inbound",
        &request.method,
        target.as_deref(),
        &inner.session_id,
        &request.id.to_string(),
        inner.transport_kind,
    );
    let started = Instant::now();
    let id = request.id.clone();
    let request_method = request.method.clone();
    let reply_sink = context.reply_sink.clone();

    let (reply, error_type) = async {
        let Some(handler) = request_handlers.get(&request.method) else {
            return (
                Some(JsonRpcMessage::error(
                    request.id,
                    ErrorData::method_not_found(&request.method),
                )),
                Some("method_not_found"),
            );
        };
        let ctx = RequestContext {
            id: request.id.clone(),
            method: request.method.clone(),
            params: request.params,
            meta,
            extensions: context.extensions,
            peer: peer.clone(),
            ct: request_ct.clone(),
        };
        match handler(ctx).await {
            Ok(result) => {
                let error_type =
                    telemetry::is_tool_error(&request.method, &result).then_some("tool_error");
                (Some(JsonRpcMessage::response(request.id, result)), error_type)
            }
            Err(HandlerError::Cancelled) => {
                tracing::debug!(id = %request.id, "handler observed cancellation, no reply sent");
                (None, Some("cancelled"))
            }
            Err(HandlerError::Protocol(error)) => (
                Some(JsonRpcMessage::error(request.id, error)),
                Some("protocol_error"),
            ),
            Err(HandlerError::Other(error)) => {
                if request_ct.is_cancelled() {
                    tracing::debug!(id = %request.id, "handler failed after cancellation, no reply sent");
                    (None, Some("cancelled"))
                } else {
                    // the original error is logged but never put on the wire
                    tracing::error!(id = %request.id, error = %error, "request handler failed");
                    (
                        Some(JsonRpcMessage::error(
                            request.id,
                            ErrorData::internal_error("an internal error occurred", None),
                        )),
                        Some("internal_error"),
                    )
                }
            }
        }
    }
    .instrument(span.clone())
    .await;

    inner.handling_requests.lock().await.remove(&id);

    if let Some(message) = reply {
        if let Err(error) = peer.write(message, reply_sink).await {
            tracing::warn!(id = %id, error = %error, "failed to send reply");
        }
    }
    telemetry::record_operation(
        &span,
        &request_method,
        inner.transport_kind,
        error_type,
        started,
    );
}
