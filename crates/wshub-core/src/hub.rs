//! Accepting connections, driving their tasks, and closing them.
//!
//! Each accepted connection gets two tasks:
//!
//! ```text
//! receive loop ── stream.receive() ── on_message ── liveness.touch()
//! monitor      ── sleep_until(deadline) ── Expired → close(IdleTimeout)
//! ```
//!
//! Both stop when the close path raises the connection's cancellation
//! token. The close path itself is gated by `Registry::remove`, so only
//! one caller ever closes the transport or fires `on_close`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::hooks::{Admission, CloseReason, Hooks, RequestMeta};
use crate::id::{ConnectionId, IdAllocator};
use crate::liveness::MonitorOutcome;
use crate::payload::Payload;
use crate::registry::{Connection, Registry};
use crate::stats::Stats;
use crate::transport::{MessageSink, MessageStream};

/// Connection registry plus the machinery that drives each connection.
pub struct Hub<S> {
    registry: Registry<S>,
    ids: IdAllocator,
    hooks: Arc<dyn Hooks>,
    idle_timeout: Option<Duration>,
    tasks: TaskTracker,
}

impl<S: MessageSink> Hub<S> {
    /// Create a hub. `idle_timeout = None` disables liveness monitoring.
    pub fn new(idle_timeout: Option<Duration>, hooks: Arc<dyn Hooks>) -> Arc<Self> {
        Self::with_limit(idle_timeout, None, hooks)
    }

    /// Create a hub that holds at most `max_connections` open connections.
    pub fn with_limit(
        idle_timeout: Option<Duration>,
        max_connections: Option<usize>,
        hooks: Arc<dyn Hooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::with_limit(max_connections),
            ids: IdAllocator::new(),
            hooks,
            idle_timeout,
            tasks: TaskTracker::new(),
        })
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Run the admission hook. Nothing is allocated here.
    pub fn admit(&self, request: &RequestMeta) -> Result<(), HubError> {
        match self.hooks.on_open(request) {
            Admission::Admit => Ok(()),
            Admission::Reject(code) => {
                debug!("Connection to {} rejected with status {code}", request.path);
                Err(HubError::AdmissionRejected { code })
            }
        }
    }

    /// Register an upgraded connection and spawn its tasks.
    pub fn accept<R: MessageStream>(
        self: &Arc<Self>,
        sink: S,
        stream: R,
    ) -> Result<ConnectionId, HubError> {
        let id = self.ids.next();
        let connection = Arc::new(Connection::new(id, sink, self.idle_timeout));

        if let Err(e) = self.registry.insert(connection.clone()) {
            match &e {
                HubError::DuplicateIdentifier(_) => error!("Registry invariant violated: {e}"),
                _ => debug!("Connection {id} refused: {e}"),
            }
            // Never registered: no close callback, only release the transport
            self.tasks.spawn(async move { connection.sink().close().await });
            return Err(e);
        }
        info!("Connection opened: {id} (open: {})", self.registry.len());

        self.tasks.spawn(self.clone().receive_loop(connection.clone(), stream));
        if self.idle_timeout.is_some() {
            self.tasks.spawn(self.clone().monitor(connection));
        }
        Ok(id)
    }

    async fn receive_loop<R: MessageStream>(
        self: Arc<Self>,
        connection: Arc<Connection<S>>,
        mut stream: R,
    ) {
        let id = connection.id();
        let cancel = connection.cancel_token().clone();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Receive loop cancelled: {id}");
                    break;
                }
                msg = stream.receive() => {
                    match msg {
                        Some(Ok(payload)) => {
                            debug!("Connection {id} received {} bytes", payload.len());
                            self.hooks.on_message(id, payload);
                            connection.liveness().touch();
                        }
                        Some(Err(e)) => {
                            warn!("Receive error on connection {id}: {e}");
                            self.close_with(id, CloseReason::ReceiveError).await;
                            break;
                        }
                        None => {
                            debug!("Peer closed connection {id}");
                            self.close_with(id, CloseReason::PeerClosed).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn monitor(self: Arc<Self>, connection: Arc<Connection<S>>) {
        let id = connection.id();
        match connection.liveness().monitor(connection.cancel_token()).await {
            MonitorOutcome::Expired => {
                let idle = self.idle_timeout.unwrap_or_default();
                info!("Connection {id} idle for {idle:?}, closing");
                self.close_with(id, CloseReason::IdleTimeout).await;
            }
            MonitorOutcome::Cancelled => debug!("Liveness monitor cancelled: {id}"),
        }
    }

    /// Send a message to one connection.
    pub async fn send(&self, id: ConnectionId, payload: impl Into<Payload>) -> Result<(), HubError> {
        self.registry.send(id, payload.into()).await
    }

    /// Send a message to every open connection. Returns how many accepted it.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        let mut delivered = 0;
        // Snapshot first so no lock is held across the sends
        for connection in self.registry.snapshot() {
            if connection.is_closed() {
                continue;
            }
            match connection.sink().send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} failed: {e}", connection.id()),
            }
        }
        delivered
    }

    /// Close a connection on behalf of the application.
    ///
    /// Returns `false` if it was already closed or never existed.
    pub async fn close(&self, id: ConnectionId) -> bool {
        self.close_with(id, CloseReason::Requested).await
    }

    /// The close path. Safe to call any number of times from any task.
    ///
    /// Removal from the registry (with its counter update) happens first
    /// and decides the winner. The winner cancels the connection's tasks,
    /// closes the transport, then fires `on_close`.
    pub async fn close_with(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some(connection) = self.registry.remove(id) else {
            return false;
        };

        connection.cancel_token().cancel();
        connection.sink().close().await;
        info!("Connection closed: {id} ({reason}, open: {})", self.registry.len());

        self.hooks.on_close(id, reason);
        true
    }

    pub fn stats(&self) -> Stats {
        self.registry.stats()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }

    /// Stop taking connections, close every open one with reason
    /// `Shutdown`, and wait for all connection tasks to finish.
    ///
    /// `accept` fails with `ShuttingDown` from the moment this starts.
    pub async fn shutdown(&self) {
        self.registry.begin_closing();
        loop {
            let ids = self.registry.ids();
            if ids.is_empty() {
                break;
            }
            info!("Closing {} connections for shutdown", ids.len());
            for id in ids {
                self.close_with(id, CloseReason::Shutdown).await;
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Callbacks, NoopHooks};
    use crate::test_support::{MockPeer, MockSink, mock_transport};
    use parking_lot::Mutex;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn accept_registers_and_counts() {
        let hub = Hub::new(None, Arc::new(NoopHooks));
        let (sink, stream, _peer) = mock_transport();

        let id = hub.accept(sink, stream).unwrap();
        assert_eq!(id, ConnectionId::new(1));
        assert!(hub.contains(id));

        let stats = hub.stats();
        assert_eq!(stats.total_accepted, 1);
        assert_eq!(stats.current_open, 1);
        assert_eq!(stats.total_closed, 0);
    }

    #[tokio::test]
    async fn admission_rejection_allocates_nothing() {
        let hooks = Callbacks::new().with_open(|_| Admission::Reject(403));
        let hub: Arc<Hub<MockSink>> = Hub::new(None, Arc::new(hooks));

        let err = hub.admit(&RequestMeta::default()).unwrap_err();
        assert!(matches!(err, HubError::AdmissionRejected { code: 403 }));
        assert!(hub.is_empty());
        assert_eq!(hub.stats().total_accepted, 0);

        // The first accepted connection still gets id 1
        let (sink, stream, _peer) = mock_transport();
        assert_eq!(hub.accept(sink, stream).unwrap(), ConnectionId::new(1));
    }

    #[tokio::test]
    async fn close_callback_sees_connection_gone() {
        let observed = Arc::new(Mutex::new(None));
        let hub_slot: Arc<Mutex<Option<Arc<Hub<MockSink>>>>> = Arc::new(Mutex::new(None));

        let hooks = Callbacks::new().with_close({
            let observed = observed.clone();
            let hub_slot = hub_slot.clone();
            move |id, reason| {
                let still_present = hub_slot.lock().as_ref().map(|hub| hub.contains(id));
                *observed.lock() = Some((id, reason, still_present));
            }
        });
        let hub = Hub::new(None, Arc::new(hooks));
        *hub_slot.lock() = Some(hub.clone());

        let (sink, stream, _peer) = mock_transport();
        let id = hub.accept(sink.clone(), stream).unwrap();
        assert!(hub.close(id).await);
        assert!(!hub.close(id).await);

        assert_eq!(*observed.lock(), Some((id, CloseReason::Requested, Some(false))));
        assert_eq!(sink.close_count(), 1);
        hub_slot.lock().take();
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let hooks = Callbacks::new().with_close({
            let closed = closed.clone();
            move |id, reason| closed.lock().push((id, reason))
        });
        let hub = Hub::new(Some(Duration::from_secs(60)), Arc::new(hooks));

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (sink, stream, peer) = mock_transport();
            hub.accept(sink, stream).unwrap();
            peers.push(peer);
        }

        timeout(Duration::from_secs(5), hub.shutdown()).await.unwrap();
        assert!(hub.is_empty());
        assert_eq!(hub.stats().total_closed, 3);
        let closed = closed.lock();
        assert_eq!(closed.len(), 3);
        assert!(closed.iter().all(|(_, reason)| *reason == CloseReason::Shutdown));
    }

    #[tokio::test]
    async fn connection_landing_during_shutdown_is_refused() {
        type Late = (MockSink, MockPeer, Result<ConnectionId, HubError>);
        let hub_slot: Arc<Mutex<Option<Arc<Hub<MockSink>>>>> = Arc::new(Mutex::new(None));
        let late: Arc<Mutex<Option<Late>>> = Arc::new(Mutex::new(None));

        // An upgrade that completes while the first connection is being closed
        let hooks = Callbacks::new().with_close({
            let hub_slot = hub_slot.clone();
            let late = late.clone();
            move |_, _| {
                let Some(hub) = hub_slot.lock().clone() else {
                    return;
                };
                let mut late = late.lock();
                if late.is_none() {
                    let (sink, stream, peer) = mock_transport();
                    let result = hub.accept(sink.clone(), stream);
                    *late = Some((sink, peer, result));
                }
            }
        });
        let hub = Hub::new(Some(Duration::from_secs(60)), Arc::new(hooks));
        *hub_slot.lock() = Some(hub.clone());

        let (sink, stream, _peer) = mock_transport();
        hub.accept(sink, stream).unwrap();

        timeout(Duration::from_secs(3), hub.shutdown())
            .await
            .expect("shutdown did not finish");
        assert!(hub.is_empty());
        assert_eq!(hub.stats().total_accepted, 1);

        {
            let slot = late.lock();
            let (late_sink, _late_peer, result) = slot.as_ref().unwrap();
            assert!(matches!(result, Err(HubError::ShuttingDown)));
            assert_eq!(late_sink.close_count(), 1);
        }

        let (sink, stream, _peer) = mock_transport();
        assert!(matches!(hub.accept(sink, stream), Err(HubError::ShuttingDown)));
        hub_slot.lock().take();
    }

    #[tokio::test]
    async fn accept_beyond_limit_releases_transport() {
        let hub = Hub::with_limit(None, Some(1), Arc::new(NoopHooks));
        let (sink_a, stream_a, _peer_a) = mock_transport();
        hub.accept(sink_a, stream_a).unwrap();

        let (sink_b, stream_b, _peer_b) = mock_transport();
        let err = hub.accept(sink_b.clone(), stream_b).unwrap_err();
        assert!(matches!(err, HubError::AtCapacity { max: 1 }));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink_b.close_count(), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.stats().total_accepted, 1);
    }

    #[tokio::test]
    async fn broadcast_skips_closed_connections() {
        let hub = Hub::new(None, Arc::new(NoopHooks));
        let (sink_a, stream_a, _peer_a) = mock_transport();
        let (sink_b, stream_b, _peer_b) = mock_transport();
        let a = hub.accept(sink_a.clone(), stream_a).unwrap();
        hub.accept(sink_b.clone(), stream_b).unwrap();

        assert_eq!(hub.broadcast("one").await, 2);
        hub.close(a).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.broadcast("two").await, 1);

        assert_eq!(sink_a.sent(), vec![Payload::from("one")]);
        assert_eq!(sink_b.sent(), vec![Payload::from("one"), Payload::from("two")]);
    }
}
