//! Per-session channel plumbing for the Streamable HTTP transport.
//!
//! HTTP handlers feed inbound messages into the session through
//! [`SessionChannels::feed`]; replies pinned to a POST are routed by the
//! session onto that request's reply sink, and every other outbound message
//! lands in the [`CommonChannel`], which the (single) GET stream drains.

use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use super::registry::ReferenceGuard;
use crate::{
    error::TransportError,
    model::JsonRpcMessage,
    transport::{Inbound, Transport, TransportKind, common::sse::{SseEvent, keep_alive_frame}},
};

pub(crate) const CHANNEL_CAPACITY: usize = 64;
const COMMON_BACKLOG_CAPACITY: usize = 64;
pub(crate) const REPLY_CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
struct CommonState {
    tx: Option<mpsc::Sender<JsonRpcMessage>>,
    backlog: VecDeque<JsonRpcMessage>,
}

/// Server→client channel for messages not pinned to a POST reply.
///
/// Until a GET stream attaches, messages are buffered with the oldest
/// dropped beyond capacity. At most one consumer ever attaches (the GET
/// once-flag lives on the session entry).
#[derive(Clone, Default)]
pub(crate) struct CommonChannel {
    state: Arc<Mutex<CommonState>>,
}

impl CommonChannel {
    pub(crate) async fn publish(&self, message: JsonRpcMessage) {
        let tx = {
            let mut state = self.state.lock().await;
            match &state.tx {
                Some(tx) => tx.clone(),
                None => {
                    if state.backlog.len() >= COMMON_BACKLOG_CAPACITY {
                        tracing::debug!("push backlog full, dropping oldest message");
                        state.backlog.pop_front();
                    }
                    state.backlog.push_back(message);
                    return;
                }
            }
        };
        if tx.send(message).await.is_err() {
            tracing::debug!("server push stream closed, dropping message");
            self.state.lock().await.tx = None;
        }
    }

    pub(crate) async fn attach(&self) -> mpsc::Receiver<JsonRpcMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.state.lock().await;
        for message in state.backlog.drain(..) {
            let _ = tx.try_send(message);
        }
        state.tx = Some(tx);
        rx
    }

    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.tx = None;
        state.backlog.clear();
    }
}

pub(crate) struct SessionChannels {
    pub(crate) feed: mpsc::Sender<Inbound>,
    pub(crate) common: CommonChannel,
}

/// Build the channel pair backing one HTTP session: the handles the HTTP
/// layer keeps, and the transport the per-session server loop runs on.
pub(crate) fn session_channels() -> (SessionChannels, StreamableHttpSessionTransport) {
    let (feed_tx, feed_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let common = CommonChannel::default();
    let channels = SessionChannels {
        feed: feed_tx,
        common: common.clone(),
    };
    let transport = StreamableHttpSessionTransport {
        inbound: feed_rx,
        common,
        connected: true,
    };
    (channels, transport)
}

/// The session side of the Streamable HTTP plumbing.
pub struct StreamableHttpSessionTransport {
    inbound: mpsc::Receiver<Inbound>,
    common: CommonChannel,
    connected: bool,
}

impl Transport for StreamableHttpSessionTransport {
    type Error = TransportError;

    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.common.publish(message).await;
        Ok(())
    }

    async fn receive(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.inbound.close();
        self.common.shutdown().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}

/// `text/event-stream` body over a message channel.
///
/// Holds the session reference for as long as the response body is alive.
/// In single-reply mode (POST) the stream ends after the first event; in
/// continuous mode (GET) it runs until the channel closes or the client
/// disconnects.
pub(crate) struct SseBodyStream {
    rx: mpsc::Receiver<JsonRpcMessage>,
    keep_alive: Option<tokio::time::Interval>,
    stop_after_first: bool,
    done: bool,
    _reference: Option<ReferenceGuard>,
}

impl SseBodyStream {
    pub(crate) fn single_reply(
        rx: mpsc::Receiver<JsonRpcMessage>,
        keep_alive: Option<std::time::Duration>,
        reference: Option<ReferenceGuard>,
    ) -> Self {
        Self::new(rx, keep_alive, true, reference)
    }

    pub(crate) fn continuous(
        rx: mpsc::Receiver<JsonRpcMessage>,
        keep_alive: Option<std::time::Duration>,
        reference: Option<ReferenceGuard>,
    ) -> Self {
        Self::new(rx, keep_alive, false, reference)
    }

    fn new(
        rx: mpsc::Receiver<JsonRpcMessage>,
        keep_alive: Option<std::time::Duration>,
        stop_after_first: bool,
        reference: Option<ReferenceGuard>,
    ) -> Self {
        Self {
            rx,
            keep_alive: keep_alive.map(tokio::time::interval),
            stop_after_first,
            done: false,
            _reference: reference,
        }
    }
}

impl Stream for SseBodyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                let data =
                    serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
                if this.stop_after_first {
                    this.done = true;
                }
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

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_common_channel_buffers_until_attach() {
        let common = CommonChannel::default();
        common
            .publish(JsonRpcMessage::notification("notifications/a", None))
            .await;
        common
            .publish(JsonRpcMessage::notification("notifications/b", None))
            .await;

        let mut rx = common.attach().await;
        assert_eq!(
            rx.recv().await,
            Some(JsonRpcMessage::notification("notifications/a", None))
        );
        assert_eq!(
            rx.recv().await,
            Some(JsonRpcMessage::notification("notifications/b", None))
        );
    }

    #[tokio::test]
    async fn test_common_channel_shutdown_ends_stream() {
        let common = CommonChannel::default();
        let mut rx = common.attach().await;
        common.shutdown().await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_transport_close_is_idempotent() {
        let (_channels, mut transport) = session_channels();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport
                .send(JsonRpcMessage::notification("notifications/x", None))
                .await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_single_reply_stream_ends_after_first_event() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(JsonRpcMessage::response(1.into(), serde_json::json!({})))
            .await
            .unwrap();
        let mut stream = SseBodyStream::single_reply(rx, None, None);
        let first = stream.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("event: message\n"));
        assert!(stream.next().await.is_none());
    }
}
