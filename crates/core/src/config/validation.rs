//! Structural validation for the declarative spec file.
//!
//! Validation is fatal at `validate` and at initial `serve`; during reload a
//! failure aborts the diff and leaves the previous catalog intact.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::model::{ProxyMode, ServerSpec, ShoalConfig, Strategy, TransportKind};

/// Server names: lowercase alphanumerics plus `.`, `_`, `-`.
static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("name regex compiles"));

/// Protocol versions are dates.
static PROTOCOL_VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("version regex compiles"));

/// Protocol versions accepted for stdio transports.
pub const STDIO_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Protocol versions accepted for streamable HTTP transports. The older
/// 2024-11-05 revision predates streamable HTTP.
pub const HTTP_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2025-06-18"];

/// Header names the transport owns; user config cannot override them.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "mcp-protocol-version",
    "mcp-session-id",
    "last-event-id",
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Governance plugin categories, in pipeline order.
pub const PLUGIN_CATEGORIES: &[&str] = &[
    "observability",
    "authentication",
    "authorization",
    "rate_limiting",
    "validation",
    "content",
    "audit",
];

/// Validate the entire configuration document.
pub fn validate_config(config: &ShoalConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for spec in &config.servers {
        if !seen.insert(spec.name.clone()) {
            return Err(ConfigError::DuplicateServerName { name: spec.name.clone() });
        }
        validate_server(spec)?;
        debug!(server = %spec.name, "validated server spec");
    }

    for plugin in &config.runtime.plugins {
        validate_plugin(plugin)?;
    }

    if config.runtime.target_utilization_factor <= 0.0 {
        return Err(ConfigError::InvalidRuntime {
            field: "targetUtilizationFactor".into(),
            reason: "must be positive".into(),
        });
    }
    if config.runtime.server_init_retry_base_seconds > config.runtime.server_init_retry_max_seconds
    {
        return Err(ConfigError::InvalidRuntime {
            field: "serverInitRetryBaseSeconds".into(),
            reason: "must not exceed serverInitRetryMaxSeconds".into(),
        });
    }
    Ok(())
}

/// Validate a single server spec.
pub fn validate_server(spec: &ServerSpec) -> Result<(), ConfigError> {
    validate_server_name(&spec.name)?;

    if spec.max_concurrent < 1 {
        return Err(ConfigError::InvalidField {
            server: spec.name.clone(),
            field: "maxConcurrent".into(),
            reason: "must be at least 1".into(),
        });
    }

    validate_protocol_version(spec)?;

    match spec.transport {
        TransportKind::Stdio => validate_stdio(spec)?,
        TransportKind::StreamableHttp => validate_http(spec)?,
    }

    if spec.session_ttl_seconds.is_some() && spec.strategy != Strategy::Stateful {
        return Err(ConfigError::InvalidField {
            server: spec.name.clone(),
            field: "sessionTtlSeconds".into(),
            reason: "only valid with the stateful strategy".into(),
        });
    }

    Ok(())
}

/// Validate a server name.
pub fn validate_server_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || !NAME_REGEX.is_match(name) {
        return Err(ConfigError::InvalidServerName {
            name: name.to_string(),
            reason: "must be non-empty lowercase letters, digits, dots, underscores, or hyphens"
                .into(),
        });
    }
    Ok(())
}

fn validate_protocol_version(spec: &ServerSpec) -> Result<(), ConfigError> {
    if !PROTOCOL_VERSION_REGEX.is_match(&spec.protocol_version) {
        return Err(ConfigError::UnsupportedProtocolVersion {
            server: spec.name.clone(),
            version: spec.protocol_version.clone(),
            transport: spec.transport.to_string(),
        });
    }
    let supported = match spec.transport {
        TransportKind::Stdio => STDIO_PROTOCOL_VERSIONS,
        TransportKind::StreamableHttp => HTTP_PROTOCOL_VERSIONS,
    };
    if !supported.contains(&spec.protocol_version.as_str()) {
        return Err(ConfigError::UnsupportedProtocolVersion {
            server: spec.name.clone(),
            version: spec.protocol_version.clone(),
            transport: spec.transport.to_string(),
        });
    }
    Ok(())
}

fn validate_stdio(spec: &ServerSpec) -> Result<(), ConfigError> {
    if spec.cmd.is_empty() {
        return Err(ConfigError::MissingField {
            server: spec.name.clone(),
            field: "cmd".into(),
            transport: "stdio".into(),
        });
    }
    if spec.endpoint.is_some() {
        return Err(ConfigError::InvalidField {
            server: spec.name.clone(),
            field: "endpoint".into(),
            reason: "not valid for stdio transport".into(),
        });
    }
    for key in spec.env.keys() {
        validate_env_key(&spec.name, key)?;
    }
    Ok(())
}

fn validate_http(spec: &ServerSpec) -> Result<(), ConfigError> {
    let Some(endpoint) = &spec.endpoint else {
        return Err(ConfigError::MissingField {
            server: spec.name.clone(),
            field: "endpoint".into(),
            transport: "streamable_http".into(),
        });
    };
    let scheme = endpoint.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ConfigError::InvalidField {
            server: spec.name.clone(),
            field: "endpoint".into(),
            reason: format!("unsupported URL scheme '{scheme}' (expected http/https)"),
        });
    }
    if !spec.cmd.is_empty() {
        return Err(ConfigError::InvalidField {
            server: spec.name.clone(),
            field: "cmd".into(),
            reason: "not valid for streamable_http transport".into(),
        });
    }
    for name in spec.headers.keys() {
        validate_header_name(&spec.name, name)?;
    }
    if let Some(proxy) = &spec.proxy {
        match proxy.mode {
            ProxyMode::Url if proxy.url.is_none() => {
                return Err(ConfigError::InvalidField {
                    server: spec.name.clone(),
                    field: "proxy.url".into(),
                    reason: "required when proxy.mode = url".into(),
                });
            }
            ProxyMode::None | ProxyMode::Env if proxy.url.is_some() => {
                return Err(ConfigError::InvalidField {
                    server: spec.name.clone(),
                    field: "proxy.url".into(),
                    reason: "only valid when proxy.mode = url".into(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

static ENV_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex compiles"));

fn validate_env_key(server: &str, key: &str) -> Result<(), ConfigError> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(ConfigError::InvalidField {
            server: server.to_string(),
            field: format!("env.{key}"),
            reason: "environment keys must start with a letter or underscore".into(),
        });
    }
    Ok(())
}

fn validate_header_name(server: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ConfigError::InvalidField {
            server: server.to_string(),
            field: format!("headers.{name}"),
            reason: "header names must be non-empty printable tokens".into(),
        });
    }
    if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::ReservedHeader {
            server: server.to_string(),
            header: name.to_string(),
        });
    }
    Ok(())
}

fn validate_plugin(plugin: &super::model::PluginSpec) -> Result<(), ConfigError> {
    if !PLUGIN_CATEGORIES.contains(&plugin.category.as_str()) {
        return Err(ConfigError::InvalidPlugin {
            plugin: plugin.name.clone(),
            reason: format!("unknown category '{}'", plugin.category),
        });
    }
    if plugin.cmd.is_empty() {
        return Err(ConfigError::InvalidPlugin {
            plugin: plugin.name.clone(),
            reason: "cmd must not be empty".into(),
        });
    }
    for flow in &plugin.flows {
        if flow != "request" && flow != "response" {
            return Err(ConfigError::InvalidPlugin {
                plugin: plugin.name.clone(),
                reason: format!("unknown flow '{flow}'"),
            });
        }
    }
    Ok(())
}

/// Errors raised by configuration parsing and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },

    #[error("duplicate server name '{name}'")]
    DuplicateServerName { name: String },

    #[error("server '{server}': missing required field '{field}' for {transport} transport")]
    MissingField {
        server: String,
        field: String,
        transport: String,
    },

    #[error("server '{server}': invalid field '{field}': {reason}")]
    InvalidField {
        server: String,
        field: String,
        reason: String,
    },

    #[error("server '{server}': header '{header}' is reserved by the transport")]
    ReservedHeader { server: String, header: String },

    #[error("server '{server}': protocol version '{version}' is unsupported for {transport}")]
    UnsupportedProtocolVersion {
        server: String,
        version: String,
        transport: String,
    },

    #[error("runtime field '{field}': {reason}")]
    InvalidRuntime { field: String, reason: String },

    #[error("plugin '{plugin}': {reason}")]
    InvalidPlugin { plugin: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn stdio_spec(name: &str) -> ServerSpec {
        serde_yaml::from_str(&format!(
            "name: {name}\ntransport: stdio\ncmd: [\"true\"]\n"
        ))
        .unwrap()
    }

    #[test]
    fn accepts_valid_names() {
        for name in ["github", "my-server", "server_1", "test.server"] {
            assert!(validate_server_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["", "GitHub", "my server", "server@example"] {
            assert!(validate_server_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn stdio_requires_cmd() {
        let mut spec = stdio_spec("alpha");
        spec.cmd.clear();
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn http_requires_endpoint_and_scheme() {
        let mut spec = stdio_spec("remote");
        spec.transport = TransportKind::StreamableHttp;
        spec.cmd.clear();
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::UnsupportedProtocolVersion { .. }) | Err(ConfigError::MissingField { .. })
        ));
        spec.protocol_version = "2025-03-26".into();
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::MissingField { .. })
        ));
        spec.endpoint = Some(Url::parse("ws://example.com").unwrap());
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::InvalidField { .. })
        ));
        spec.endpoint = Some(Url::parse("https://example.com/mcp").unwrap());
        assert!(validate_server(&spec).is_ok());
    }

    #[test]
    fn reserved_headers_are_rejected() {
        let mut spec = stdio_spec("remote");
        spec.transport = TransportKind::StreamableHttp;
        spec.cmd.clear();
        spec.endpoint = Some(Url::parse("https://example.com/mcp").unwrap());
        spec.headers.insert("MCP-Session-Id".into(), "x".into());
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::ReservedHeader { .. })
        ));
    }

    #[test]
    fn protocol_version_gate_per_transport() {
        let mut spec = stdio_spec("alpha");
        spec.protocol_version = "2024-11-05".into();
        assert!(validate_server(&spec).is_ok());

        spec.transport = TransportKind::StreamableHttp;
        spec.cmd.clear();
        spec.endpoint = Some(Url::parse("https://example.com").unwrap());
        assert!(matches!(
            validate_server(&spec),
            Err(ConfigError::UnsupportedProtocolVersion { .. })
        ));
    }

    #[test]
    fn session_ttl_requires_stateful() {
        let mut spec = stdio_spec("alpha");
        spec.session_ttl_seconds = Some(10);
        assert!(validate_server(&spec).is_err());
        spec.strategy = Strategy::Stateful;
        assert!(validate_server(&spec).is_ok());
    }

    #[test]
    fn duplicate_names_rejected() {
        let cfg = ShoalConfig {
            servers: vec![stdio_spec("alpha"), stdio_spec("alpha")],
            runtime: Default::default(),
        };
        assert!(matches!(
            validate_config(&cfg),
            Err(ConfigError::DuplicateServerName { .. })
        ));
    }
}
