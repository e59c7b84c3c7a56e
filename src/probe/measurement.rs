use std::fmt;

use chrono::{DateTime, Utc};

/// One probe result reported by fping.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Target host exactly as fping printed it. Never empty.
    pub host: String,
    /// Round-trip time in milliseconds, `None` when the probe timed out.
    pub latency_ms: Option<f64>,
    /// Probe time taken from fping's `-D` prefix.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Measurement {
    /// Returns true if the probe received no reply.
    pub fn is_timeout(&self) -> bool {
        self.latency_ms.is_none()
    }

    /// Returns the outcome label used in logs and metrics.
    pub fn outcome(&self) -> Outcome {
        match self.latency_ms {
            Some(_) => Outcome::Reply,
            None => Outcome::Timeout,
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reply,
    Timeout,
}

impl Outcome {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
