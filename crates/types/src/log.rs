//! Log entry type streamed over the control RPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured log line, either from a downstream instance's stderr or from
/// the control plane's own audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was captured.
    pub timestamp: DateTime<Utc>,
    /// Spec key the line belongs to, or `core` for control-plane entries.
    pub source: String,
    /// Severity as a lowercase string (`debug`, `info`, `warn`, `error`).
    pub level: String,
    /// The sanitized message text.
    pub message: String,
}

impl LogEntry {
    /// Build an entry stamped with the current time.
    pub fn now(source: impl Into<String>, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            level: level.into(),
            message: message.into(),
        }
    }
}
