//! MCP gateway bridge.
//!
//! Terminates an MCP session from an external AI client over stdio or
//! streamable HTTP and translates each JSON-RPC call into core invocations
//! scoped by the session's registered caller. Aggregator ETag changes for
//! the caller's visible set are pushed back as `*_list_changed`
//! notifications.

mod host;
mod notify;
mod service;

pub use host::{serve_http, serve_stdio, RunningHttpGateway};
pub use service::{GatewayMode, GatewayService};
