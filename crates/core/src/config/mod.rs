//! Declarative configuration for the control plane.
//!
//! The spec file is a YAML document with two top-level sections: `servers`
//! (the downstream MCP server specs) and `runtime` (tunables for the
//! elastic runtime itself). Parsing and structural validation live here;
//! applying a parsed configuration to a live fleet is the catalog's job.

mod io;
mod model;
pub mod validation;

pub use io::{load_config, load_config_from_dir, CONFIG_FILE_NAME};
pub use model::{
    ActivationMode, BootstrapMode, NamespaceStrategy, ObservabilityConfig, PluginSpec,
    ProxyConfig, ProxyMode, ReloadMode, RpcConfig, RuntimeConfig, ServerSpec, ShoalConfig,
    Strategy, SubAgentConfig, TlsConfig, TransportKind,
};
pub use validation::{validate_config, ConfigError};
