//! Runtime statistics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Point-in-time view of the hub's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub started_at: DateTime<Utc>,
    #[serde(rename = "uptimeSecs", serialize_with = "as_secs")]
    pub uptime: Duration,
    pub total_accepted: u64,
    pub current_open: u64,
    pub total_closed: u64,
}

fn as_secs<S: Serializer>(uptime: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(uptime.as_secs())
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Started:             {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Uptime:              {}s", self.uptime.as_secs())?;
        writeln!(f, "Total connections:   {}", self.total_accepted)?;
        writeln!(f, "Current connections: {}", self.current_open)?;
        write!(f, "Closed connections:  {}", self.total_closed)
    }
}
