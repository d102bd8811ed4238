//! Connection registry — the only shared mutable state in the hub.
//!
//! Entries and counters live behind one `parking_lot::RwLock`, so an
//! insert or remove and its statistics update are a single step. Readers
//! get `Arc` clones of entries; nothing holds the lock across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HubError, TransportError};
use crate::id::ConnectionId;
use crate::liveness::Liveness;
use crate::payload::Payload;
use crate::stats::Stats;
use crate::transport::MessageSink;

/// One open connection.
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    sink: S,
    liveness: Liveness,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl<S> Connection<S> {
    /// Build an entry whose liveness deadline is armed at `now + idle_timeout`.
    pub fn new(id: ConnectionId, sink: S, idle_timeout: Option<Duration>) -> Self {
        Self {
            id,
            sink,
            liveness: Liveness::new(idle_timeout),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Raised by the close path; connection tasks stop when it fires.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
struct Inner<S> {
    connections: HashMap<ConnectionId, Arc<Connection<S>>>,
    total_accepted: u64,
    total_closed: u64,
    /// Set once shutdown starts; inserts fail from then on.
    closing: bool,
}

/// Identifier → connection map plus the counters that track it.
#[derive(Debug)]
pub struct Registry<S> {
    inner: RwLock<Inner<S>>,
    max_connections: Option<usize>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// A registry that refuses inserts beyond `max_connections` open entries.
    pub fn with_limit(max_connections: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                total_accepted: 0,
                total_closed: 0,
                closing: false,
            }),
            max_connections,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Register a new connection and count it as accepted.
    pub fn insert(&self, connection: Arc<Connection<S>>) -> Result<(), HubError> {
        let id = connection.id();
        let mut inner = self.inner.write();
        if inner.closing {
            return Err(HubError::ShuttingDown);
        }
        if inner.connections.contains_key(&id) {
            return Err(HubError::DuplicateIdentifier(id));
        }
        if let Some(max) = self.max_connections {
            if inner.connections.len() >= max {
                return Err(HubError::AtCapacity { max });
            }
        }
        inner.connections.insert(id, connection);
        inner.total_accepted += 1;
        Ok(())
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        self.inner.read().connections.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains_key(&id)
    }

    /// Remove a connection and count it as closed.
    ///
    /// Returns `None` if it was already gone, which makes this the gate
    /// that lets exactly one closer through.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<S>>> {
        let mut inner = self.inner.write();
        let removed = inner.connections.remove(&id)?;
        inner.total_closed += 1;
        Some(removed)
    }

    /// Refuse every later insert. Entries already present stay until removed.
    pub fn begin_closing(&self) {
        self.inner.write().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.inner.read().closing
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    /// Copy of every open connection handle, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection<S>>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Open connection ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.read().connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.read();
        Stats {
            started_at: self.started_at,
            uptime: self.started.elapsed(),
            total_accepted: inner.total_accepted,
            current_open: inner.connections.len() as u64,
            total_closed: inner.total_closed,
        }
    }
}

impl<S: MessageSink> Registry<S> {
    /// Look up `id` and write `payload` to it.
    ///
    /// A connection that disappears between the lookup and the write
    /// yields `NotConnected`, never a write to a closed transport.
    pub async fn send(&self, id: ConnectionId, payload: Payload) -> Result<(), HubError> {
        let connection = self.lookup(id).ok_or(HubError::NotConnected(id))?;
        if connection.is_closed() {
            return Err(HubError::NotConnected(id));
        }
        match connection.sink().send(payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(HubError::NotConnected(id)),
            Err(source) => {
                debug!("Send to connection {id} failed: {source}");
                Err(HubError::Transport { id, source })
            }
        }
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSink;

    fn entry(id: u64) -> Arc<Connection<MockSink>> {
        Arc::new(Connection::new(ConnectionId::new(id), MockSink::default(), None))
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = Registry::new();
        registry.insert(entry(1)).unwrap();
        registry.insert(entry(2)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(ConnectionId::new(1)).is_some());
        assert_eq!(registry.ids(), vec![ConnectionId::new(1), ConnectionId::new(2)]);

        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(registry.lookup(ConnectionId::new(1)).is_none());
        assert!(!registry.contains(ConnectionId::new(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = Registry::new();
        registry.insert(entry(5)).unwrap();
        let err = registry.insert(entry(5)).unwrap_err();
        assert!(matches!(err, HubError::DuplicateIdentifier(id) if id.get() == 5));

        let stats = registry.stats();
        assert_eq!(stats.total_accepted, 1);
        assert_eq!(stats.current_open, 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        registry.insert(entry(1)).unwrap();
        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(registry.remove(ConnectionId::new(1)).is_none());
        assert!(registry.remove(ConnectionId::new(99)).is_none());

        let stats = registry.stats();
        assert_eq!(stats.total_accepted, 1);
        assert_eq!(stats.current_open, 0);
        assert_eq!(stats.total_closed, 1);
    }

    #[test]
    fn closing_registry_refuses_inserts() {
        let registry = Registry::new();
        registry.insert(entry(1)).unwrap();
        registry.begin_closing();

        let err = registry.insert(entry(2)).unwrap_err();
        assert!(matches!(err, HubError::ShuttingDown));
        assert!(registry.is_closing());

        // Existing entries can still be drained
        assert!(registry.remove(ConnectionId::new(1)).is_some());
        let stats = registry.stats();
        assert_eq!(stats.total_accepted, 1);
        assert_eq!(stats.total_closed, 1);
    }

    #[test]
    fn limit_is_enforced_on_insert() {
        let registry = Registry::with_limit(Some(2));
        registry.insert(entry(1)).unwrap();
        registry.insert(entry(2)).unwrap();

        let err = registry.insert(entry(3)).unwrap_err();
        assert!(matches!(err, HubError::AtCapacity { max: 2 }));
        assert_eq!(registry.stats().total_accepted, 2);

        registry.remove(ConnectionId::new(1));
        registry.insert(entry(3)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn limit_holds_under_concurrent_inserts() {
        let registry = Arc::new(Registry::with_limit(Some(10)));
        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50u64)
                        .filter(|i| registry.insert(entry(worker * 1000 + i)).is_ok())
                        .count()
                })
            })
            .collect();
        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(inserted, 10);
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn counters_track_entries_under_contention() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        let id = worker * 1000 + i;
                        registry.insert(entry(id)).unwrap();
                        if i % 2 == 0 {
                            registry.remove(ConnectionId::new(id));
                        }
                        let stats = registry.stats();
                        assert_eq!(stats.current_open, stats.total_accepted - stats.total_closed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.total_accepted, 1000);
        assert_eq!(stats.total_closed, 500);
        assert_eq!(stats.current_open, registry.len() as u64);
    }

    #[tokio::test]
    async fn send_reaches_open_connection_only() {
        let registry = Registry::new();
        let connection = entry(1);
        registry.insert(connection.clone()).unwrap();

        registry.send(ConnectionId::new(1), Payload::from("hi")).await.unwrap();
        assert_eq!(connection.sink().sent(), vec![Payload::from("hi")]);

        let err = registry.send(ConnectionId::new(2), Payload::from("x")).await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected(_)));

        registry.remove(ConnectionId::new(1));
        let err = registry.send(ConnectionId::new(1), Payload::from("x")).await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected(_)));
    }

    #[tokio::test]
    async fn send_racing_a_close_maps_to_not_connected() {
        let registry = Registry::new();
        let connection = entry(3);
        registry.insert(connection.clone()).unwrap();

        // Transport already closed but entry not yet removed
        connection.sink().close().await;
        let err = registry.send(ConnectionId::new(3), Payload::from("x")).await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected(id) if id.get() == 3));
    }
}
