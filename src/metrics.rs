//! Protocol log buffering and per-call metrics payloads.
//!
//! The protocol log is a feature of the system, not developer diagnostics:
//! entries accumulate per call while a session runs and are flushed to the
//! host's upload callback when the call is released.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

/// Crate identification embedded in metrics payloads.
pub(crate) const SOFTWARE: &str = concat!("callflow/", env!("CARGO_PKG_VERSION"));

/// One buffered protocol-log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: String) -> Self {
        Self {
            ts: Utc::now(),
            message,
        }
    }
}

/// Renders buffered entries into the upload body, one timestamped line each.
pub fn format_log(entries: &[LogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.ts.format("%Y/%m/%d %H:%M:%S%.3f").to_string());
        out.push(' ');
        out.push_str(&entry.message);
        out.push('\n');
    }
    out
}

/// Snapshot of a call for the metrics post issued on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStats {
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub flows: usize,
    pub established: bool,
}

impl CallStats {
    pub fn to_json(&self) -> Value {
        json!({
            "version": SOFTWARE,
            "started": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "duration": self.duration_ms,
            "flows": self.flows,
            "established": self.established,
        })
    }
}
