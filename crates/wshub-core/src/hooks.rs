//! Application lifecycle hooks.
//!
//! Hooks run inline on connection tasks, so they should return quickly.
//! Hand long-running work off to another task.

use std::fmt;
use std::net::SocketAddr;

use crate::id::ConnectionId;
use crate::payload::Payload;

/// Metadata of an inbound connection request, before any upgrade.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Request path, e.g. `/ws`
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// Peer address, when the listener provides it
    pub remote_addr: Option<SocketAddr>,
    /// Request headers as (lowercase name, value) pairs
    pub headers: Vec<(String, String)>,
}

impl RequestMeta {
    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Value of a query parameter, without percent-decoding.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// Result of the admission hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Refuse the request with this HTTP status code.
    Reject(u16),
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer closed the channel
    PeerClosed,
    /// Reading from the transport failed
    ReceiveError,
    /// No inbound activity within the idle timeout
    IdleTimeout,
    /// Closed through `Hub::close`
    Requested,
    /// Closed because the server is stopping
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReceiveError => "receive_error",
            Self::IdleTimeout => "idle_timeout",
            Self::Requested => "requested",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks invoked by the hub. Every method has a no-op default;
/// admission defaults to admitting everyone.
pub trait Hooks: Send + Sync + 'static {
    /// Decide whether to accept a connection request.
    fn on_open(&self, _request: &RequestMeta) -> Admission {
        Admission::Admit
    }

    /// A message arrived on connection `id`.
    fn on_message(&self, _id: ConnectionId, _payload: Payload) {}

    /// Connection `id` has been closed and removed from the registry.
    fn on_close(&self, _id: ConnectionId, _reason: CloseReason) {}
}

/// Hooks that do nothing and admit everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

type OpenFn = Box<dyn Fn(&RequestMeta) -> Admission + Send + Sync>;
type MessageFn = Box<dyn Fn(ConnectionId, Payload) + Send + Sync>;
type CloseFn = Box<dyn Fn(ConnectionId, CloseReason) + Send + Sync>;

/// Closure-based hooks with three optional slots.
///
/// ```ignore
/// let hooks = Callbacks::new()
///     .with_message(|id, payload| println!("{id}: {payload:?}"))
///     .with_close(|id, reason| println!("{id} closed ({reason})"));
/// ```
#[derive(Default)]
pub struct Callbacks {
    open: Option<OpenFn>,
    message: Option<MessageFn>,
    close: Option<CloseFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open(mut self, f: impl Fn(&RequestMeta) -> Admission + Send + Sync + 'static) -> Self {
        self.open = Some(Box::new(f));
        self
    }

    pub fn with_message(mut self, f: impl Fn(ConnectionId, Payload) + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn with_close(mut self, f: impl Fn(ConnectionId, CloseReason) + Send + Sync + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }
}

impl Hooks for Callbacks {
    fn on_open(&self, request: &RequestMeta) -> Admission {
        self.open.as_ref().map_or(Admission::Admit, |f| f(request))
    }

    fn on_message(&self, id: ConnectionId, payload: Payload) {
        if let Some(f) = &self.message {
            f(id, payload);
        }
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        if let Some(f) = &self.close {
            f(id, reason);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.open.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_close", &self.close.is_some())
            .finish()
    }
}
