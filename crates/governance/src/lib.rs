//! Governance pipeline and plugin host.
//!
//! Plugins are separate OS processes reached over newline-delimited JSON on
//! a Unix domain socket whose path the host chooses and passes through the
//! environment. The pipeline sequences plugin slots by category, with
//! observability evaluated in parallel and only `content` allowed to mutate
//! payloads.

#[cfg(unix)]
pub mod host;
pub mod pipeline;
pub mod proto;
#[cfg(unix)]
pub mod serve;
#[cfg(unix)]
mod socket;

pub use pipeline::{GovernancePipeline, PluginEndpoint, PluginSlot};
pub use proto::{
    PluginCategory, PluginDecision, PluginFlow, PluginMetadata, PluginRequest, PluginResponse,
};

use thiserror::Error;

/// Environment variable carrying the socket path to the plugin process.
pub const PLUGIN_SOCKET_ENV: &str = "MCPV_PLUGIN_SOCKET";
/// Accepted legacy alias for the socket path variable.
pub const PLUGIN_SOCKET_ENV_ALIAS: &str = "MCPD_PLUGIN_SOCKET";
/// Identity variables exported to the plugin process.
pub const PLUGIN_NAME_ENV: &str = "MCPV_PLUGIN_NAME";
pub const PLUGIN_CATEGORY_ENV: &str = "MCPV_PLUGIN_CATEGORY";
pub const PLUGIN_COMMIT_HASH_ENV: &str = "MCPV_PLUGIN_COMMIT_HASH";
pub const PLUGIN_FLOWS_ENV: &str = "MCPV_PLUGIN_FLOWS";

/// Errors raised by the plugin host and pipeline.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{name}' IO failure: {message}")]
    Io { name: String, message: String },

    #[error("plugin '{name}' handshake failed: {reason}")]
    Handshake { name: String, reason: String },

    #[error("plugin '{name}' is unavailable")]
    Unavailable { name: String },

    #[error("plugin '{name}' protocol violation: {message}")]
    Protocol { name: String, message: String },
}

impl PluginError {
    pub fn io(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn handshake(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handshake {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::Unavailable { name: name.into() }
    }

    pub fn protocol(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            name: name.into(),
            message: message.into(),
        }
    }
}
