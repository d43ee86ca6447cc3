//! Bounded in-memory log ring buffer.
//!
//! Backs the `StreamLogs` RPC with the most recent captured lines (instance
//! stderr, audit entries). Writers never block: when the ring is full the
//! oldest entry is dropped. Live followers receive entries over a broadcast
//! channel with the same drop-oldest behavior.

use std::collections::VecDeque;
use std::sync::Mutex;

use shoal_types::LogEntry;
use tokio::sync::broadcast;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Bounded ring of recent log entries plus a live follower channel.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer with an explicit capacity (must be non-zero).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        let _ = self.tx.send(entry);
    }

    /// Snapshot of the retained entries, oldest first, optionally filtered
    /// by source.
    pub fn tail(&self, source: Option<&str>, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|e| source.is_none_or(|s| e.source == s))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Follow new entries as they arrive.
    pub fn follow(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip control characters from text destined for logs or status fields.
pub fn sanitize_log_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() && c != '\n' && c != '\t' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, msg: &str) -> LogEntry {
        LogEntry::now(source, "info", msg)
    }

    #[test]
    fn drops_oldest_on_overflow() {
        let buf = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push(entry("core", &format!("m{i}")));
        }
        let tail = buf.tail(None, 10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "m2");
        assert_eq!(tail[2].message, "m4");
    }

    #[test]
    fn tail_filters_by_source() {
        let buf = LogBuffer::with_capacity(8);
        buf.push(entry("alpha", "a"));
        buf.push(entry("beta", "b"));
        buf.push(entry("alpha", "c"));
        let tail = buf.tail(Some("alpha"), 10);
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|e| e.source == "alpha"));
    }

    #[tokio::test]
    async fn follow_receives_new_entries() {
        let buf = LogBuffer::with_capacity(8);
        let mut rx = buf.follow();
        buf.push(entry("core", "hello"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message, "hello");
    }

    #[test]
    fn sanitize_replaces_control_chars() {
        assert_eq!(sanitize_log_text("a\u{1b}[31mb"), "a [31mb");
        assert_eq!(sanitize_log_text("line\nok\ttab"), "line\nok\ttab");
    }
}
