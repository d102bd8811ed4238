//! wshub Transport Layer
//!
//! Provides the WebSocket transport and HTTP listener for the hub.
//! The transport layer handles:
//! - HTTP routing and admission (connection limit, `on_open` hook)
//! - WebSocket upgrade and upgrader tuning
//! - Adapting axum sockets to the core's sink/stream traits
//! - A `/health` endpoint reporting runtime statistics
//!
//! Connection lifecycle, liveness and close semantics live in `wshub-core`.

pub mod server;
pub mod socket;

pub use server::{ServerError, TransportConfig, TransportServer};
pub use socket::{WsSink, WsStream};
