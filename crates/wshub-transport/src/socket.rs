//! Axum WebSocket adapter for the core transport traits.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::Mutex;
use tracing::debug;
use wshub_core::{MessageSink, MessageStream, Payload, TransportError};

/// Split an upgraded socket into the halves the hub expects.
pub fn split(socket: WebSocket) -> (WsSink, WsStream) {
    let (tx, rx) = socket.split();
    (
        WsSink {
            inner: Mutex::new(tx),
            closed: AtomicBool::new(false),
        },
        WsStream { inner: rx },
    )
}

/// Write half of a WebSocket.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl MessageSink for WsSink {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes),
        };

        let mut tx = self.inner.lock().await;
        // A close may have won the lock first
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        tx.send(message).await.map_err(TransportError::other)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tx = self.inner.lock().await;
        let _ = tx.send(Message::Close(None)).await;
        if let Err(e) = tx.close().await {
            debug!("WebSocket close failed: {e}");
        }
    }
}

/// Read half of a WebSocket.
///
/// Only text and binary frames are delivered. Pings are answered by the
/// socket itself and never count as activity.
pub struct WsStream {
    inner: SplitStream<WebSocket>,
}

impl MessageStream for WsStream {
    async fn receive(&mut self) -> Option<Result<Payload, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Payload::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Payload::Binary(bytes))),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::other(e))),
            }
        }
    }
}
