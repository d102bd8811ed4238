//! In-memory transport for tests. Enabled by the `test-util` feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::payload::Payload;
use crate::transport::{MessageSink, MessageStream};

#[derive(Debug, Default, Clone)]
pub struct MockSink {
    sent: Arc<Mutex<Vec<Payload>>>,
    closes: Arc<AtomicUsize>,
}

impl MockSink {
    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl MessageSink for MockSink {
    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.close_count() > 0 {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<Payload, TransportError>>,
}

impl MessageStream for MockStream {
    async fn receive(&mut self) -> Option<Result<Payload, TransportError>> {
        self.rx.recv().await
    }
}

/// Peer side of a mock connection. Dropping it disconnects the stream.
pub type MockPeer = mpsc::UnboundedSender<Result<Payload, TransportError>>;

pub fn mock_transport() -> (MockSink, MockStream, MockPeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MockSink::default(), MockStream { rx }, tx)
}
