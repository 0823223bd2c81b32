//! Events: immutable records of something notable, as carried on the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use super::vocab::{Channel, Severity};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_HOUR: i64 = 3_600 * MICROS_PER_SECOND;

/// Time-ordered unique event identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// First 8 chars, for log lines and CLI tables.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// An event as produced, fanned out and persisted.
///
/// `channel` and `severity` always come from the code's registry binding.
/// `recipients` is the per-destination set: each transport message carries
/// the recipients for the topic it was written to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub trace_id: String,
    pub cluster: String,
    pub code: String,
    pub channel: Channel,
    pub facility: String,
    pub severity: Severity,
    pub message: String,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub detail: HashMap<String, String>,
    #[serde(default)]
    pub recipients: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    /// Microseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<i64>,
}

impl Event {
    /// Detail entries sorted by key, the order every renderer uses.
    pub fn sorted_detail(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .detail
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn time_bucket(&self) -> i64 {
        time_bucket(self.timestamp)
    }
}

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn micros_to_secs(micros: i64) -> i64 {
    micros.div_euclid(MICROS_PER_SECOND)
}

pub fn secs_to_micros(secs: i64) -> i64 {
    secs.saturating_mul(MICROS_PER_SECOND)
}

/// Hour bucket used to partition persisted events.
pub fn time_bucket(micros: i64) -> i64 {
    micros.div_euclid(MICROS_PER_HOUR)
}

/// Render a microsecond timestamp as a UTC wall-clock string.
pub fn format_timestamp(micros: i64) -> String {
    match DateTime::<Utc>::from_timestamp(micros_to_secs(micros), 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => micros.to_string(),
    }
}
