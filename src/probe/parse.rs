//! Line parsing for fping `-D -l` output.
//!
//! Every result line has the same token layout:
//!
//! ```text
//! [1700000000.123456] 8.8.8.8 : [12], 84 bytes, 11.2 ms (11.4 avg, 0% loss)
//! [1700000000.123456] 8.8.8.8 : [13], timed out (11.4 avg, 7% loss)
//! ```
//!
//! Anything that does not match the layout (ICMP error reports, summaries,
//! startup warnings) is rejected with a [`ParseError`] and never becomes a
//! [`Measurement`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::measurement::Measurement;

/// Token holding the bracketed `-D` timestamp.
const POS_TIMESTAMP: usize = 0;
/// Token holding the target host.
const POS_HOST: usize = 1;
/// Token holding the literal `:` separator.
const POS_SEPARATOR: usize = 2;
/// Token holding [`TIMEOUT_KEYWORD`] for timed-out probes.
const POS_TIMEOUT: usize = 4;
/// Token holding the round-trip time for answered probes.
const POS_LATENCY: usize = 6;

/// Tokens needed to decide between a reply and a timeout.
pub const MIN_TOKENS: usize = POS_TIMEOUT + 1;
/// Tokens needed to read a latency value.
pub const MIN_REPLY_TOKENS: usize = POS_LATENCY + 1;

const SEPARATOR: &str = ":";
const TIMEOUT_KEYWORD: &str = "timed";
const LATENCY_PREFIX: &str = "time=";

/// Reasons a probe output line is rejected.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("line has {count} tokens, need at least {need}")]
    TooFewTokens { count: usize, need: usize },

    #[error("invalid timestamp token {token:?}")]
    InvalidTimestamp { token: String },

    #[error("expected \":\" after host, found {token:?}")]
    MissingSeparator { token: String },

    #[error("invalid latency token {token:?}")]
    InvalidLatency { token: String },
}

impl ParseError {
    /// Short label for metrics.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::TooFewTokens { .. } => "too_few_tokens",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::MissingSeparator { .. } => "missing_separator",
            Self::InvalidLatency { .. } => "invalid_latency",
        }
    }
}

/// Parse one line of fping output into a [`Measurement`].
pub fn parse_line(line: &str) -> Result<Measurement, ParseError> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();

    let (Some(ts_token), Some(host), Some(separator), Some(timeout_token)) = (
        tokens.get(POS_TIMESTAMP),
        tokens.get(POS_HOST),
        tokens.get(POS_SEPARATOR),
        tokens.get(POS_TIMEOUT),
    ) else {
        return Err(ParseError::TooFewTokens {
            count: tokens.len(),
            need: MIN_TOKENS,
        });
    };

    let timestamp = parse_timestamp(ts_token).ok_or_else(|| ParseError::InvalidTimestamp {
        token: (*ts_token).to_string(),
    })?;

    if *separator != SEPARATOR {
        return Err(ParseError::MissingSeparator {
            token: (*separator).to_string(),
        });
    }

    if *timeout_token == TIMEOUT_KEYWORD {
        return Ok(Measurement {
            host: (*host).to_string(),
            latency_ms: None,
            timestamp: Some(timestamp),
        });
    }

    let latency_token = tokens
        .get(POS_LATENCY)
        .ok_or(ParseError::TooFewTokens {
            count: tokens.len(),
            need: MIN_REPLY_TOKENS,
        })?;

    let latency_ms =
        parse_latency(latency_token).ok_or_else(|| ParseError::InvalidLatency {
            token: (*latency_token).to_string(),
        })?;

    Ok(Measurement {
        host: (*host).to_string(),
        latency_ms: Some(latency_ms),
        timestamp: Some(timestamp),
    })
}

/// Parses `[<secs>.<fraction>]` into a UTC timestamp without going through f64.
fn parse_timestamp(token: &str) -> Option<DateTime<Utc>> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    let (secs, frac) = inner.split_once('.').unwrap_or((inner, ""));

    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs: i64 = secs.parse().ok()?;

    // Right-pad or truncate the fraction to nanoseconds.
    let mut nanos: u32 = 0;
    for i in 0..9 {
        let digit = frac.as_bytes().get(i).map_or(0, |b| u32::from(b - b'0'));
        nanos = nanos * 10 + digit;
    }

    DateTime::from_timestamp(secs, nanos)
}

/// Parses a millisecond value, accepting an optional `time=` prefix.
fn parse_latency(token: &str) -> Option<f64> {
    let value = token.strip_prefix(LATENCY_PREFIX).unwrap_or(token);
    let ms: f64 = value.parse().ok()?;

    if ms.is_finite() && ms >= 0.0 {
        Some(ms)
    } else {
        None
    }
}
