//! Per-job options, kept as the wire contract defines them: a string-to-string
//! mapping serialized as a JSON object in the job hash. Only the keys below are
//! interpreted; unknown keys survive round-trips untouched so that options
//! written by a peer implementation are never dropped.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;

const LIFO_KEY: &str = "lifo";
const DELAY_KEY: &str = "delay";
const TIMESTAMP_KEY: &str = "timestamp";

/// Dynamic job options.
///
/// Values are strings to preserve wire compatibility; typed accessors parse the
/// recognized keys on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    entries: HashMap<String, String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an arbitrary option key.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Enqueue onto `wait` via right-push, so the job is popped next.
    pub fn lifo(self) -> Self {
        self.set(LIFO_KEY, "true")
    }

    /// Defer the job by `delay_ms` milliseconds from its creation timestamp.
    pub fn delay(self, delay_ms: u64) -> Self {
        self.set(DELAY_KEY, delay_ms.to_string())
    }

    /// Override the job's creation timestamp (unix ms).
    pub fn timestamp(self, timestamp_ms: i64) -> Self {
        self.set(TIMESTAMP_KEY, timestamp_ms.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether enqueueing should right-push. Only the exact string `"true"`
    /// counts; any other value or absence means FIFO.
    pub fn is_lifo(&self) -> bool {
        self.get(LIFO_KEY) == Some("true")
    }

    /// Delay in milliseconds, if present and positive.
    pub fn delay_ms(&self) -> Option<i64> {
        let parsed = self.get(DELAY_KEY)?.parse::<f64>().ok()?;
        if parsed > 0.0 {
            Some(parsed as i64)
        } else {
            None
        }
    }

    /// Creation timestamp override in unix ms, if present.
    pub fn timestamp_ms(&self) -> Option<i64> {
        let parsed = self.get(TIMESTAMP_KEY)?.parse::<f64>().ok()?;
        Some(parsed as i64)
    }

    /// Parse the serialized `opts` hash field. `null`, the empty string and the
    /// empty object are all equivalent to no options.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(raw)?;
        let mut entries = HashMap::new();
        if let Value::Object(map) = value {
            for (key, value) in map {
                entries.insert(key, stringify(value));
            }
        }

        Ok(Self { entries })
    }

    /// Serialized form stored in the job hash.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }
}

/// Peers are expected to write string values, but a number or boolean written
/// by a loose producer still has an obvious string reading.
fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
