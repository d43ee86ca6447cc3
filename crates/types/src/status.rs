//! Status types for instances, pools, and server initialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of one downstream MCP server instance.
///
/// `Stopped` and `Failed` are terminal; once entered, an instance never
/// leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Process spawn / connection establishment in progress.
    Starting,
    /// Transport connected, `initialize` not yet sent.
    Initializing,
    /// `initialize` in flight.
    Handshaking,
    /// Handshake complete, capacity available.
    Ready,
    /// At least one call in flight.
    Busy,
    /// Shutting down; no new leases, in-flight calls draining.
    Draining,
    /// Cleanly stopped.
    Stopped,
    /// Stopped after an error; removed from rotation.
    Failed,
}

impl InstanceState {
    /// Whether the instance can never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Whether the instance can accept a new lease.
    pub fn is_leasable(&self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Busy)
    }

    /// Display text used by status surfaces.
    pub fn display(&self) -> &'static str {
        match self {
            InstanceState::Starting => "Starting",
            InstanceState::Initializing => "Initializing",
            InstanceState::Handshaking => "Handshaking",
            InstanceState::Ready => "Ready",
            InstanceState::Busy => "Busy",
            InstanceState::Draining => "Draining",
            InstanceState::Stopped => "Stopped",
            InstanceState::Failed => "Failed",
        }
    }
}

/// Why an instance was started. Carried on the instance for status export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause", content = "detail")]
pub enum StartCause {
    /// Started during initial bootstrap.
    Bootstrap,
    /// Started to serve a tool call; carries the namespaced tool name.
    ToolCall(String),
    /// Started because a client explicitly activated the spec.
    ClientActivate(String),
    /// Kept warm by `activation_mode = always-on`.
    PolicyAlwaysOn,
    /// Kept warm by the `min_ready` top-up loop.
    PolicyMinReady,
}

impl StartCause {
    /// Tag used in status export and metrics labels.
    pub fn tag(&self) -> &'static str {
        match self {
            StartCause::Bootstrap => "bootstrap",
            StartCause::ToolCall(_) => "tool_call",
            StartCause::ClientActivate(_) => "client_activate",
            StartCause::PolicyAlwaysOn => "policy_always_on",
            StartCause::PolicyMinReady => "policy_min_ready",
        }
    }
}

/// Snapshot of one instance for status export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Opaque instance identity.
    pub instance_id: Uuid,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Calls currently in flight.
    pub busy_count: u32,
    /// When the process was spawned / connection opened.
    pub spawned_at: DateTime<Utc>,
    /// When the handshake completed, if it did.
    pub handshaked_at: Option<DateTime<Utc>>,
    /// Last time a call completed on this instance.
    pub last_active: Option<DateTime<Utc>>,
    /// Last successful liveness probe.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Why the instance exists.
    pub start_cause: StartCause,
}

/// Aggregate snapshot of one spec's pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Spec key the pool belongs to.
    pub spec_key: String,
    /// All instances, any state.
    pub total: u32,
    /// Per-state counts. Invariant: they sum to `total`.
    pub ready: u32,
    pub busy: u32,
    pub starting: u32,
    pub initializing: u32,
    pub handshaking: u32,
    pub draining: u32,
    pub failed: u32,
    /// Rolling counters since pool creation.
    pub starts: u64,
    pub stops: u64,
    pub total_calls: u64,
    pub total_errors: u64,
    /// Sum of call durations in milliseconds.
    pub total_duration_ms: u64,
    /// Last time any call was routed through the pool.
    pub last_call_at: Option<DateTime<Utc>>,
    /// Instance detail rows.
    pub instances: Vec<InstanceStatus>,
}

/// Initialization state for one spec, driven by the top-up loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerInitState {
    /// No start has been attempted yet.
    Pending,
    /// A start attempt is in flight.
    Starting,
    /// The spec has at least its required ready population.
    Ready,
    /// The last start attempt failed; a retry is scheduled.
    Failed,
}

/// Per-spec initialization status surfaced over `WatchServerInitStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInitStatus {
    /// Spec key this status describes.
    pub spec_key: String,
    /// Current init state.
    pub state: ServerInitState,
    /// Consecutive failed attempts.
    pub attempts: u32,
    /// Last error string, sanitized, if any.
    pub last_error: Option<String>,
    /// When the next retry will run, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Stopped.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Draining.is_terminal());
        assert!(!InstanceState::Ready.is_terminal());
    }

    #[test]
    fn start_cause_tags() {
        assert_eq!(StartCause::Bootstrap.tag(), "bootstrap");
        assert_eq!(StartCause::ToolCall("alpha__echo".into()).tag(), "tool_call");
        assert_eq!(StartCause::PolicyMinReady.tag(), "policy_min_ready");
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&InstanceState::Handshaking).unwrap();
        assert_eq!(json, "\"handshaking\"");
    }
}
