//! wshub core — connection registry and liveness monitoring.
//!
//! Sits above a message-oriented duplex transport and handles:
//! - Connection identifier allocation
//! - The shared connection registry and runtime statistics
//! - Per-connection receive/dispatch loops
//! - Idle-timeout eviction
//! - Idempotent close with lifecycle callbacks
//!
//! The core is decoupled from any concrete transport via the
//! `MessageSink` / `MessageStream` traits.

pub mod error;
pub mod hooks;
pub mod hub;
pub mod id;
pub mod liveness;
pub mod payload;
pub mod registry;
pub mod stats;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use error::{HubError, TransportError};
pub use hooks::{Admission, Callbacks, CloseReason, Hooks, NoopHooks, RequestMeta};
pub use hub::Hub;
pub use id::{ConnectionId, IdAllocator};
pub use liveness::{Liveness, MonitorOutcome};
pub use payload::Payload;
pub use registry::{Connection, Registry};
pub use stats::Stats;
pub use transport::{MessageSink, MessageStream};
