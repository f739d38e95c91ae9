//! Diagnostic records
//!
//! A [`DiagnosticRecord`] is the unit queued for delivery and handed to the
//! notifier. It is built once per report by the message builder and dropped
//! after the notifier has seen it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Level;
use crate::utils::gelf_timestamp;

pub const GELF_VERSION: &str = "1.1";

/// Structured report of one failure or logged event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiagnosticRecord {
    pub short_message: String,

    /// Environment and backtrace sections
    pub full_message: String,

    pub facility: String,

    /// Name of the reporting application or machine
    pub host: String,

    pub level: Level,

    /// Source file of the first backtrace frame
    pub file: Option<String>,

    pub line: Option<u32>,

    pub timestamp: DateTime<Utc>,

    /// Configured extra fields and passthrough environment entries
    pub extra: Map<String, Value>,
}

impl DiagnosticRecord {
    /// GELF 1.1 payload for this record
    ///
    /// Non-standard fields (`facility`, `file`, `line` and every extra) are
    /// sent as `_`-prefixed additional fields; an extra named `id` is dropped.
    pub fn to_gelf(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("version".to_string(), Value::from(GELF_VERSION));
        payload.insert("host".to_string(), Value::from(self.host.clone()));
        payload.insert("short_message".to_string(), Value::from(self.short_message.clone()));
        if !self.full_message.is_empty() {
            payload.insert("full_message".to_string(), Value::from(self.full_message.clone()));
        }
        payload.insert("timestamp".to_string(), Value::from(gelf_timestamp(self.timestamp)));
        payload.insert("level".to_string(), Value::from(self.level.ordinal()));
        payload.insert("_facility".to_string(), Value::from(self.facility.clone()));
        if let Some(file) = &self.file {
            payload.insert("_file".to_string(), Value::from(file.clone()));
        }
        if let Some(line) = self.line {
            payload.insert("_line".to_string(), Value::from(line));
        }

        for (key, value) in &self.extra {
            let key = if key.starts_with('_') {
                key.clone()
            } else {
                format!("_{key}")
            };
            if key == "_id" {
                continue;
            }
            payload.insert(key, value.clone());
        }

        Value::Object(payload)
    }
}

#[cfg(test)]
pub(crate) fn sample_record(short_message: &str) -> DiagnosticRecord {
    DiagnosticRecord {
        short_message: short_message.to_string(),
        full_message: ">> BACKTRACE <<\n/src/lib.rs:1".to_string(),
        facility: "test".to_string(),
        host: "test-host".to_string(),
        level: Level::Error,
        file: Some("./src/lib.rs".to_string()),
        line: Some(1),
        timestamp: Utc::now(),
        extra: Map::new(),
    }
}
