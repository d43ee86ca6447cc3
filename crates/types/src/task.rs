//! Task descriptors for long-running asynchronous tool calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an asynchronous task. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task runner is executing.
    Working,
    /// The runner is blocked on caller input.
    InputRequired,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Serializable view of a task, as returned by the control RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Monotonically increasing task id.
    pub task_id: String,
    /// Registered client that owns the task.
    pub owner: String,
    /// Current status.
    pub status: TaskStatus,
    /// Optional human-readable progress message.
    pub status_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status or message change.
    pub last_updated_at: DateTime<Utc>,
    /// Time-to-live after creation, in milliseconds.
    pub ttl_ms: u64,
    /// Suggested poll interval for the caller, in milliseconds.
    pub poll_interval_ms: u64,
    /// Result payload when `Completed`.
    pub result: Option<serde_json::Value>,
    /// Error message when `Failed`.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Working.is_terminal());
        assert!(!TaskStatus::InputRequired.is_terminal());
    }
}
