//! Transport boundary.
//!
//! A transport hands the hub one established duplex channel per peer,
//! already split into a send half (owned by the registry) and a receive
//! half (owned by the connection's receive loop). Framing and handshake
//! are the transport's business.

use std::future::Future;

use crate::error::TransportError;
use crate::payload::Payload;

/// Send half of a connection. Shared between the registry and callers of
/// `Hub::send`, so every method takes `&self`.
pub trait MessageSink: Send + Sync + 'static {
    /// Write one message to the peer.
    fn send(&self, payload: Payload) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the channel. Must tolerate being called more than once.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Receive half of a connection.
pub trait MessageStream: Send + 'static {
    /// Wait for the next message.
    ///
    /// `None` means the peer closed the channel; `Some(Err(_))` is a
    /// read or protocol failure. Both end the connection.
    fn receive(&mut self) -> impl Future<Output = Option<Result<Payload, TransportError>>> + Send;
}
