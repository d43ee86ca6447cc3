//! Configuration IO helpers.

use std::path::Path;

use super::model::ShoalConfig;
use super::validation::{validate_config, ConfigError};

/// File name expected inside the `--config` directory.
pub const CONFIG_FILE_NAME: &str = "shoal.yaml";

/// Load, parse, and validate the configuration from a directory.
///
/// The directory must contain [`CONFIG_FILE_NAME`]. A missing file is an
/// error here, unlike optional per-user config files: the config directory
/// is always passed explicitly.
pub fn load_config_from_dir(dir: &Path) -> Result<ShoalConfig, ConfigError> {
    load_config(&dir.join(CONFIG_FILE_NAME))
}

/// Load, parse, and validate the configuration from a specific file.
pub fn load_config(path: &Path) -> Result<ShoalConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: ShoalConfig = serde_yaml::from_str(&content)?;
    apply_defaults(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Fold runtime-level defaults into individual specs. An explicit per-spec
/// value always wins over the runtime default; `activation_mode` stays
/// `None` in serde exactly so omission is distinguishable here.
fn apply_defaults(config: &mut ShoalConfig) {
    if let Some(mode) = config.runtime.default_activation_mode {
        for spec in &mut config.servers {
            if spec.activation_mode.is_none() {
                spec.activation_mode = Some(mode);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
servers:
  - name: alpha
    transport: stdio
    cmd: ["node", "echo.js"]
runtime:
  toolRefreshSeconds: 60
"#,
        )
        .unwrap();
        let cfg = load_config_from_dir(dir.path()).expect("loads");
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.runtime.tool_refresh_seconds, 60);
    }

    #[test]
    fn validation_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
servers:
  - name: Alpha
    transport: stdio
    cmd: ["true"]
"#,
        )
        .unwrap();
        assert!(load_config_from_dir(dir.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from_dir(dir.path()).is_err());
    }

    #[test]
    fn explicit_activation_mode_beats_runtime_default() {
        use crate::config::ActivationMode;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
servers:
  - name: pinned
    transport: stdio
    cmd: ["true"]
    activationMode: on-demand
  - name: defaulted
    transport: stdio
    cmd: ["true"]
runtime:
  defaultActivationMode: always-on
"#,
        )
        .unwrap();
        let cfg = load_config_from_dir(dir.path()).expect("loads");
        assert_eq!(cfg.servers[0].activation(), ActivationMode::OnDemand);
        assert_eq!(cfg.servers[1].activation(), ActivationMode::AlwaysOn);
    }
}
