//! Shared types for the shoal MCP control plane.
//!
//! This crate holds the small, serializable vocabulary that crosses crate
//! boundaries: stable error codes, instance/pool status snapshots, task
//! descriptors, and log entries. Behavior lives in `shoal-core`; these types
//! deliberately carry none.

pub mod codes;
pub mod log;
pub mod status;
pub mod task;

pub use codes::ErrorCode;
pub use log::LogEntry;
pub use status::{
    InstanceState, InstanceStatus, PoolStatus, ServerInitState, ServerInitStatus, StartCause,
};
pub use task::{TaskDescriptor, TaskStatus};
