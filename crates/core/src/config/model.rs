//! Data models for the declarative spec file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// Top-level configuration document: `servers` plus `runtime`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShoalConfig {
    /// Downstream server specs, in catalog order.
    #[serde(default)]
    pub servers: Vec<ServerSpec>,

    /// Runtime tunables.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Transport used to reach a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking MCP over stdio.
    Stdio,
    /// Remote endpoint speaking MCP over streamable HTTP with SSE.
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::StreamableHttp => write!(f, "streamable_http"),
        }
    }
}

/// When instances of a spec may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationMode {
    /// Start on first demand, reap when idle.
    #[default]
    OnDemand,
    /// Keep at least one instance warm from bootstrap onward.
    AlwaysOn,
    /// Never start; hidden from aggregation and routing.
    Disabled,
}

/// How requests map onto instances of a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Any ready instance with spare capacity.
    #[default]
    Stateless,
    /// Routing-key affinity with a session TTL.
    Stateful,
    /// Like stateless but exempt from idle recycling.
    Persistent,
    /// At most one instance; acquires queue on it.
    Singleton,
}

/// Proxy behavior for HTTP transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// No proxy, ignore the environment.
    #[default]
    None,
    /// Honor the process environment (HTTP_PROXY and friends).
    Env,
    /// Use the explicitly configured URL.
    Url,
}

/// Proxy configuration for a streamable HTTP spec.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyConfig {
    /// Proxy selection mode.
    #[serde(default)]
    pub mode: ProxyMode,
    /// Proxy URL; required when `mode = url`.
    pub url: Option<Url>,
}

/// One downstream MCP server specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerSpec {
    /// Human name; unique within the catalog after validation.
    pub name: String,

    /// Transport selection.
    pub transport: TransportKind,

    /// Command and arguments for stdio transport.
    #[serde(default)]
    pub cmd: Vec<String>,

    /// Environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,

    /// Endpoint URL for streamable HTTP transport.
    pub endpoint: Option<Url>,

    /// Extra HTTP headers; reserved header names are rejected.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// HTTP connect retry budget; `-1` disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Proxy configuration for HTTP transport.
    pub proxy: Option<ProxyConfig>,

    /// Tags used for client visibility scoping.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Declared MCP protocol version (`YYYY-MM-DD`).
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Maximum concurrent calls per instance.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Seconds of inactivity before a ready instance is recycled.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,

    /// Instances to keep warm at all times.
    #[serde(default)]
    pub min_ready: u32,

    /// Activation policy. `None` means the file left it out, so the
    /// runtime-level default may apply; an explicit value always wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_mode: Option<ActivationMode>,

    /// Request-to-instance mapping strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Session TTL for `stateful` strategy, in seconds.
    pub session_ttl_seconds: Option<u64>,

    /// Grace window for shutdown before force kill.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,

    /// Allow-list of tool names to expose; `None` exposes everything.
    pub expose_tools: Option<Vec<String>>,

    /// Whether the spec is disabled without being removed.
    #[serde(default)]
    pub disabled: bool,
}

fn default_max_retries() -> i32 {
    3
}

fn default_protocol_version() -> String {
    "2025-03-26".to_string()
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_idle_seconds() -> u64 {
    300
}

fn default_drain_timeout() -> u64 {
    10
}

impl ServerSpec {
    /// Whether this spec uses the stdio transport.
    pub fn is_stdio(&self) -> bool {
        self.transport == TransportKind::Stdio
    }

    /// Whether this spec uses the streamable HTTP transport.
    pub fn is_http(&self) -> bool {
        self.transport == TransportKind::StreamableHttp
    }

    /// Effective activation policy. The runtime-level default is folded
    /// into `activation_mode` at load time, so an unset field here means
    /// plain on-demand.
    pub fn activation(&self) -> ActivationMode {
        self.activation_mode.unwrap_or_default()
    }

    /// Effective keep-warm floor: `always-on` implies at least one.
    pub fn keep_warm_floor(&self) -> u32 {
        match self.activation() {
            ActivationMode::AlwaysOn => self.min_ready.max(1),
            ActivationMode::OnDemand => self.min_ready,
            ActivationMode::Disabled => 0,
        }
    }

    /// Whether instances of this spec are exempt from idle recycling.
    pub fn idle_exempt(&self) -> bool {
        matches!(self.strategy, Strategy::Persistent | Strategy::Stateful)
    }
}

/// External namespace placement for aggregated item names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStrategy {
    /// `<server>__<name>`
    #[default]
    Prefix,
    /// `<name>__<server>`
    Suffix,
}

/// Which metadata the first snapshot waits for at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    /// Wait for metadata of warmed specs.
    #[default]
    Metadata,
    /// Wait for metadata and full min-ready populations.
    Full,
    /// Do not block the first snapshot.
    None,
}

/// How a mutated spec is applied during reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadMode {
    /// Update tunables on the live pool.
    #[default]
    InPlace,
    /// Drain the pool and restart under the new spec.
    Recreate,
}

/// Optional observability listener.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Address for the health/status HTTP listener.
    pub listen_address: Option<String>,
}

/// TLS material for the control RPC listener.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub client_auth: bool,
}

/// Control RPC listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RpcConfig {
    /// Unix socket path or `host:port`. A value containing `/` or ending in
    /// `.sock` is treated as a socket path.
    #[serde(default = "default_rpc_listen")]
    pub listen_address: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_msg_size")]
    pub max_recv_msg_size: usize,

    /// Maximum outbound frame size in bytes.
    #[serde(default = "default_max_msg_size")]
    pub max_send_msg_size: usize,

    /// Keepalive probe interval, seconds (TCP only).
    #[serde(default = "default_keepalive_time")]
    pub keepalive_time: u64,

    /// Keepalive probe timeout, seconds (TCP only).
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,

    /// Octal mode applied to the Unix socket file.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Optional TLS wrap for TCP listeners.
    pub tls: Option<TlsConfig>,
}

fn default_rpc_listen() -> String {
    "shoal.sock".to_string()
}

fn default_max_msg_size() -> usize {
    16 * 1024 * 1024
}

fn default_keepalive_time() -> u64 {
    30
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_socket_mode() -> u32 {
    0o600
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_address: default_rpc_listen(),
            max_recv_msg_size: default_max_msg_size(),
            max_send_msg_size: default_max_msg_size(),
            keepalive_time: default_keepalive_time(),
            keepalive_timeout: default_keepalive_timeout(),
            socket_mode: default_socket_mode(),
            tls: None,
        }
    }
}

impl RpcConfig {
    /// Whether the listen address names a Unix socket path.
    pub fn is_unix(&self) -> bool {
        self.listen_address.contains('/') || self.listen_address.ends_with(".sock")
    }
}

/// Pluggable tool-selection subagent configuration. The core treats the
/// selector as a black box behind [`crate::selector::ToolSelector`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubAgentConfig {
    #[serde(default)]
    pub enabled: bool,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub api_key_env_var: Option<String>,
    pub base_url: Option<Url>,
    pub max_tools_per_request: Option<u32>,
    pub filter_prompt: Option<String>,
    #[serde(default)]
    pub enabled_tags: Vec<String>,
}

/// One governance plugin process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginSpec {
    /// Plugin name; must match the identity reported over the plugin RPC.
    pub name: String,
    /// Category string (`observability`, `authentication`, `authorization`,
    /// `rate_limiting`, `validation`, `content`, `audit`).
    pub category: String,
    /// Command and arguments to launch the plugin process.
    pub cmd: Vec<String>,
    /// Extra environment for the plugin process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Flows the plugin participates in (`request`, `response`).
    #[serde(default = "default_plugin_flows")]
    pub flows: Vec<String>,
    /// Whether the request path blocks when this plugin is unavailable.
    #[serde(default)]
    pub required: bool,
    /// Opaque configuration JSON handed to `Configure`.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Expected commit hash of the plugin binary, if pinned.
    pub commit_hash: Option<String>,
}

fn default_plugin_flows() -> Vec<String> {
    vec!["request".to_string()]
}

/// Runtime tunables for the elastic runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Per-request budget shared by acquire + call, seconds.
    #[serde(default = "default_route_timeout")]
    pub route_timeout_seconds: u64,

    /// Liveness probe cadence, seconds. `0` disables the probe.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,

    /// Periodic metadata refresh cadence, seconds.
    #[serde(default = "default_tool_refresh")]
    pub tool_refresh_seconds: u64,

    /// Concurrent spec refreshes during a sweep.
    #[serde(default = "default_tool_refresh_concurrency")]
    pub tool_refresh_concurrency: usize,

    /// Namespace placement for aggregated names.
    #[serde(default)]
    pub tool_namespace_strategy: NamespaceStrategy,

    /// Runtime-level tool allow-list, applied after the spec-level one.
    pub expose_tools: Option<Vec<String>>,

    /// Client staleness check cadence, seconds.
    #[serde(default = "default_client_check")]
    pub client_check_seconds: u64,

    /// Seconds without a heartbeat before a client is evicted.
    #[serde(default = "default_client_inactive")]
    pub client_inactive_seconds: u64,

    /// Initial backoff between min-ready spawn attempts, seconds.
    #[serde(default = "default_init_retry_base")]
    pub server_init_retry_base_seconds: u64,

    /// Backoff ceiling for min-ready spawn attempts, seconds.
    #[serde(default = "default_init_retry_max")]
    pub server_init_retry_max_seconds: u64,

    /// Attempt cap for min-ready spawning before the spec is parked.
    #[serde(default = "default_init_max_retries")]
    pub server_init_max_retries: u32,

    /// Reload behavior for mutated specs.
    #[serde(default)]
    pub reload_mode: ReloadMode,

    /// What bootstrap blocks the first snapshot on.
    #[serde(default)]
    pub bootstrap_mode: BootstrapMode,

    /// Concurrent spec warm-ups during bootstrap.
    #[serde(default = "default_bootstrap_concurrency")]
    pub bootstrap_concurrency: usize,

    /// Overall bootstrap budget, seconds.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_seconds: u64,

    /// Activation mode applied to specs that do not set one.
    pub default_activation_mode: Option<ActivationMode>,

    /// Soft-cap multiplier: a pool may grow to
    /// `max(min_ready, ceil(max_concurrent * factor))` instances.
    #[serde(default = "default_target_utilization")]
    pub target_utilization_factor: f64,

    /// Optional health/status HTTP listener.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Control RPC listener settings.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Tool-selection subagent settings.
    #[serde(default)]
    pub sub_agent: SubAgentConfig,

    /// Governance plugin processes, evaluated in category order.
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

fn default_route_timeout() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    30
}

fn default_tool_refresh() -> u64 {
    300
}

fn default_tool_refresh_concurrency() -> usize {
    4
}

fn default_client_check() -> u64 {
    30
}

fn default_client_inactive() -> u64 {
    300
}

fn default_init_retry_base() -> u64 {
    1
}

fn default_init_retry_max() -> u64 {
    60
}

fn default_init_max_retries() -> u32 {
    5
}

fn default_bootstrap_concurrency() -> usize {
    4
}

fn default_bootstrap_timeout() -> u64 {
    60
}

fn default_target_utilization() -> f64 {
    1.0
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            route_timeout_seconds: default_route_timeout(),
            ping_interval_seconds: default_ping_interval(),
            tool_refresh_seconds: default_tool_refresh(),
            tool_refresh_concurrency: default_tool_refresh_concurrency(),
            tool_namespace_strategy: NamespaceStrategy::default(),
            expose_tools: None,
            client_check_seconds: default_client_check(),
            client_inactive_seconds: default_client_inactive(),
            server_init_retry_base_seconds: default_init_retry_base(),
            server_init_retry_max_seconds: default_init_retry_max(),
            server_init_max_retries: default_init_max_retries(),
            reload_mode: ReloadMode::default(),
            bootstrap_mode: BootstrapMode::default(),
            bootstrap_concurrency: default_bootstrap_concurrency(),
            bootstrap_timeout_seconds: default_bootstrap_timeout(),
            default_activation_mode: None,
            target_utilization_factor: default_target_utilization(),
            observability: ObservabilityConfig::default(),
            rpc: RpcConfig::default(),
            sub_agent: SubAgentConfig::default(),
            plugins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_stdio_spec() {
        let yaml = r#"
servers:
  - name: alpha
    transport: stdio
    cmd: ["node", "echo.js"]
    maxConcurrent: 2
    idleSeconds: 60
runtime:
  routeTimeoutSeconds: 15
"#;
        let cfg: ShoalConfig = serde_yaml::from_str(yaml).expect("config deserializes");
        assert_eq!(cfg.servers.len(), 1);
        let spec = &cfg.servers[0];
        assert!(spec.is_stdio());
        assert_eq!(spec.max_concurrent, 2);
        assert_eq!(spec.idle_seconds, 60);
        assert_eq!(spec.min_ready, 0);
        assert_eq!(spec.strategy, Strategy::Stateless);
        assert_eq!(cfg.runtime.route_timeout_seconds, 15);
    }

    #[test]
    fn deserialize_http_spec_with_headers() {
        let yaml = r#"
servers:
  - name: remote
    transport: streamable_http
    endpoint: "https://mcp.example.com/mcp"
    headers:
      Authorization: "Bearer abc"
    activationMode: always-on
    strategy: stateful
    sessionTtlSeconds: 30
"#;
        let cfg: ShoalConfig = serde_yaml::from_str(yaml).expect("config deserializes");
        let spec = &cfg.servers[0];
        assert!(spec.is_http());
        assert_eq!(spec.activation(), ActivationMode::AlwaysOn);
        assert_eq!(spec.strategy, Strategy::Stateful);
        assert_eq!(spec.session_ttl_seconds, Some(30));
        assert_eq!(spec.keep_warm_floor(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r#"
servers:
  - name: alpha
    transport: stdio
    cmd: ["true"]
    bogus: 1
"#;
        assert!(serde_yaml::from_str::<ShoalConfig>(yaml).is_err());
    }

    #[test]
    fn rpc_listen_address_classification() {
        let mut rpc = RpcConfig::default();
        assert!(rpc.is_unix());
        rpc.listen_address = "/run/shoal/control.sock".into();
        assert!(rpc.is_unix());
        rpc.listen_address = "127.0.0.1:7450".into();
        assert!(!rpc.is_unix());
    }
}
