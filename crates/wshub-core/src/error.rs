//! Error types for the hub and its transport boundary.

use crate::id::ConnectionId;

/// Errors surfaced by hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The admission hook declined the connection attempt.
    #[error("connection rejected by admission hook (status {code})")]
    AdmissionRejected { code: u16 },

    /// The transport handshake failed before a connection existed.
    #[error("transport upgrade failed: {0}")]
    UpgradeFailed(String),

    /// The identifier is not (or no longer) in the registry.
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),

    /// An identifier was allocated twice. Indicates a bug in the allocator.
    #[error("connection id {0} is already registered")]
    DuplicateIdentifier(ConnectionId),

    /// The hub is shutting down and takes no new connections.
    #[error("hub is shutting down")]
    ShuttingDown,

    /// The connection limit was reached.
    #[error("connection limit reached ({max})")]
    AtCapacity { max: usize },

    /// Writing to a live connection failed.
    #[error("transport error on connection {id}: {source}")]
    Transport {
        id: ConnectionId,
        #[source]
        source: TransportError,
    },
}

/// Errors reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying channel was already closed.
    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}
