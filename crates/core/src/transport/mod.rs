//! Downstream connections.
//!
//! A [`Connection`] is one live bidirectional MCP channel to a downstream
//! instance. The rmcp-backed implementation lives in [`rmcp_conn`]; the
//! trait exists so the scheduler and router can be exercised against scripted
//! connections in tests.

mod rmcp_conn;
#[cfg(test)]
pub mod testing;

pub use rmcp_conn::{
    handshake_http, handshake_stdio, launch_stdio, spawn_stderr_logger, InstanceHandler,
    RmcpConnection, StdioLaunch,
};

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    InitializeResult, Prompt, ReadResourceResult, Resource, Tool,
};
use thiserror::Error;

use crate::catalog::SpecKey;
use crate::events::IndexKind;

/// Failure modes of a downstream connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed: {message}")]
    ConnectionClosed { message: String },

    #[error("unavailable: {message}")]
    Unavailable { message: String },

    #[error("timed out during {operation}")]
    TimedOut { operation: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl TransportError {
    /// Create a connection-closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed { message: message.into() }
    }

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Create a timed-out error.
    pub fn timed_out(operation: impl Into<String>) -> Self {
        Self::TimedOut { operation: operation.into() }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Whether the instance behind this error is gone for good.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed { .. })
    }
}

/// Classify an rmcp service error by its display text. rmcp flattens all
/// peer failures into one error type, so the text is what there is.
pub(crate) fn classify_rmcp_error(err: impl std::fmt::Display) -> TransportError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("closed") || lower.contains("broken pipe") || lower.contains("channel") {
        TransportError::closed(text)
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("elapsed") {
        TransportError::timed_out(text)
    } else {
        TransportError::unavailable(text)
    }
}

/// List-changed notification forwarded from a connection's handler to the
/// aggregator. Emitted only when the instance's negotiated capability
/// actually declares `listChanged: true`.
#[derive(Debug, Clone)]
pub struct ListChangedNotice {
    /// Spec the notifying instance belongs to.
    pub spec: SpecKey,
    /// Which index kind changed.
    pub kind: IndexKind,
}

/// One live MCP channel to a downstream instance.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Fetch the full tool list.
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError>;

    /// Invoke a tool.
    async fn call_tool(&self, params: CallToolRequestParams)
        -> Result<CallToolResult, TransportError>;

    /// Fetch the full resource list.
    async fn list_resources(&self) -> Result<Vec<Resource>, TransportError>;

    /// Read one resource by URI.
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, TransportError>;

    /// Fetch the full prompt list.
    async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError>;

    /// Materialize one prompt.
    async fn get_prompt(&self, params: GetPromptRequestParams)
        -> Result<GetPromptResult, TransportError>;

    /// Liveness probe with a short internal deadline.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Close the channel; for stdio this terminates the child.
    async fn close(&self) -> Result<(), TransportError>;

    /// Negotiated handshake result, once available.
    fn server_info(&self) -> Option<InitializeResult>;

    /// Child process id for stdio transports, used for group teardown.
    fn child_pid(&self) -> Option<u32> {
        None
    }
}
