//! Per-connection idle deadline and the monitor that enforces it.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Liveness deadline for one connection.
///
/// With no timeout configured there is no deadline and the connection is
/// never considered idle.
#[derive(Debug)]
pub struct Liveness {
    timeout: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
}

/// How a monitor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The deadline passed with no activity. The caller must close the connection.
    Expired,
    /// The connection was closed by someone else first.
    Cancelled,
}

impl Liveness {
    /// Arm the deadline at `now + timeout`.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(timeout.map(|t| Instant::now() + t)),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Record inbound activity, pushing the deadline out to `now + timeout`.
    pub fn touch(&self) {
        if let Some(timeout) = self.timeout {
            *self.deadline.lock() = Some(Instant::now() + timeout);
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Wait until the deadline passes without being pushed out, or until
    /// `cancel` fires.
    ///
    /// The timer is re-armed lazily: on wake-up the current deadline is
    /// re-read, and if activity moved it forward the monitor sleeps again.
    pub async fn monitor(&self, cancel: &CancellationToken) -> MonitorOutcome {
        loop {
            let Some(deadline) = self.deadline() else {
                cancel.cancelled().await;
                return MonitorOutcome::Cancelled;
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return MonitorOutcome::Cancelled,
                () = sleep_until(deadline) => {
                    if self.is_expired(Instant::now()) {
                        return MonitorOutcome::Expired;
                    }
                }
            }
        }
    }
}
