//! Transport over any `AsyncRead`/`AsyncWrite` pair.
//!
//! Messages are framed as newline-delimited JSON. This is the transport for
//! stdio-hosted servers and for in-process pipes in tests.

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::{Inbound, Transport, TransportKind};
use crate::{error::TransportError, model::JsonRpcMessage};

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcMessageCodec;

impl Decoder for JsonRpcMessageCodec {
    type Item = JsonRpcMessage;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(position) = src.iter().position(|byte| *byte == b'\n') {
            let line = src.split_to(position + 1);
            let mut line = &line[..position];
            if let [head @ .., b'\r'] = line {
                line = head;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(serde_json::from_slice(line)?));
        }
        Ok(None)
    }
}

impl Encoder<JsonRpcMessage> for JsonRpcMessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)?;
        dst.reserve(data.len() + 1);
        dst.put_slice(&data);
        dst.put_u8(b'\n');
        Ok(())
    }
}

pub struct AsyncRwTransport<R, W> {
    reader: FramedRead<R, JsonRpcMessageCodec>,
    writer: FramedWrite<W, JsonRpcMessageCodec>,
    kind: TransportKind,
    connected: bool,
}

impl<R: AsyncRead, W: AsyncWrite> AsyncRwTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonRpcMessageCodec),
            writer: FramedWrite::new(writer, JsonRpcMessageCodec),
            kind: TransportKind::Stream,
            connected: true,
        }
    }
}

impl AsyncRwTransport<Stdin, Stdout> {
    pub fn stdio() -> Self {
        let mut transport = Self::new(tokio::io::stdin(), tokio::io::stdout());
        transport.kind = TransportKind::Stdio;
        transport
    }
}

impl<R, W> Transport for AsyncRwTransport<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    type Error = TransportError;

    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.writer.send(message).await
    }

    async fn receive(&mut self) -> Option<Inbound> {
        if !self.connected {
            return None;
        }
        loop {
            match self.reader.next().await {
                Some(Ok(message)) => return Some(message.into()),
                Some(Err(TransportError::Json(error))) => {
                    // a bad frame does not end the stream
                    tracing::warn!(%error, "skipping malformed frame");
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "transport read failed");
                    return None;
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.writer.close().await
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonRpcMessage;

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        let mut a = AsyncRwTransport::new(left_read, left_write);
        let mut b = AsyncRwTransport::new(right_read, right_write);

        a.send(JsonRpcMessage::request(1.into(), "ping", None))
            .await
            .unwrap();
        let received = b.receive().await.unwrap();
        assert_eq!(
            received.message,
            JsonRpcMessage::request(1.into(), "ping", None)
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        use tokio::io::AsyncWriteExt;

        let (mut left, right) = tokio::io::duplex(4096);
        let (right_read, right_write) = tokio::io::split(right);
        let mut transport = AsyncRwTransport::new(right_read, right_write);

        left.write_all(b"this is not json\n").await.unwrap();
        left.write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();
        left.shutdown().await.unwrap();

        let received = transport.receive().await.unwrap();
        assert_eq!(
            received.message,
            JsonRpcMessage::notification("notifications/initialized", None)
        );
        assert!(transport.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (left, _right) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(left);
        let mut transport = AsyncRwTransport::new(read, write);
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }
}
