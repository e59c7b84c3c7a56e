use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::probe::Measurement;

/// Measurement name for latency points.
pub const MEASUREMENT: &str = "latency";

/// Tag carrying the probed host.
pub const TAG_URL: &str = "url";

/// Field carrying the round-trip time in milliseconds.
pub const FIELD_PING: &str = "ping";

/// Suffix of the boolean field written in place of a field with no value.
pub const ABSENT_SUFFIX: &str = "_absent";

/// A store-ready data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    /// Field values; `None` is an explicit "no value", never zero.
    pub fields: BTreeMap<String, Option<f64>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Point {
    /// Builds the latency point for a measurement.
    pub fn from_measurement(m: &Measurement) -> Self {
        Self {
            measurement: MEASUREMENT.to_string(),
            tags: BTreeMap::from([(TAG_URL.to_string(), m.host.clone())]),
            fields: BTreeMap::from([(FIELD_PING.to_string(), m.latency_ms)]),
            timestamp: m.timestamp,
        }
    }

    /// Returns the value of a field, `None` if the field is missing or absent.
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied().flatten()
    }

    /// Returns a tag value.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Encodes the point as one InfluxDB line protocol line (no trailing newline).
    ///
    /// A field without a value `f` is written as `f_absent=true`, keeping the
    /// point in the store without inventing a number.
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(64);

        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (k, v) in &self.tags {
            line.push(',');
            escape_into(&mut line, k, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, v, &[',', '=', ' ']);
        }

        line.push(' ');

        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(&mut line, k, &[',', '=', ' ']);
            match v {
                Some(value) => {
                    let _ = write!(line, "={value}");
                }
                None => {
                    escape_into(&mut line, ABSENT_SUFFIX, &[]);
                    line.push_str("=true");
                }
            }
        }

        if let Some(ts) = self.timestamp.and_then(|t| t.timestamp_nanos_opt()) {
            let _ = write!(line, " {ts}");
        }

        line
    }
}

impl From<&Measurement> for Point {
    fn from(m: &Measurement) -> Self {
        Self::from_measurement(m)
    }
}

/// Appends `s`, backslash-escaping the given characters and any backslash.
fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
