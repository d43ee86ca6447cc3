//! Catalog snapshots and reload diffing.
//!
//! A [`CatalogState`] is an immutable value built from a validated
//! configuration. Reload produces a new snapshot and a [`CatalogDiff`]
//! describing what the fleet has to do about it; applying the diff is the
//! scheduler's and aggregator's job.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::{ActivationMode, RuntimeConfig, ServerSpec, ShoalConfig};

/// Stable identity of a spec within the catalog.
///
/// Server names are unique after validation, so the key wraps the name.
/// Pool generations (for `recreate` reloads) are tracked inside the
/// scheduler, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecKey(String);

impl SpecKey {
    /// Build a key from a server name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The server name this key wraps.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Immutable catalog snapshot: ordered specs plus runtime tunables.
#[derive(Debug, Clone)]
pub struct CatalogState {
    /// Monotonic snapshot version; bumped on every reload.
    version: u64,
    /// Specs in catalog order, keyed by spec key.
    specs: IndexMap<SpecKey, Arc<ServerSpec>>,
    /// Runtime tunables in force for this snapshot.
    runtime: Arc<RuntimeConfig>,
}

impl CatalogState {
    /// Build the initial snapshot from a validated configuration.
    pub fn from_config(config: ShoalConfig) -> Self {
        Self::with_version(config, 1)
    }

    /// Build a snapshot with an explicit version (used by reload).
    pub fn with_version(config: ShoalConfig, version: u64) -> Self {
        let specs = config
            .servers
            .into_iter()
            .map(|spec| (SpecKey::new(&spec.name), Arc::new(spec)))
            .collect();
        Self {
            version,
            specs,
            runtime: Arc::new(config.runtime),
        }
    }

    /// Snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Runtime tunables.
    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.runtime
    }

    /// Look up a spec by key.
    pub fn get(&self, key: &SpecKey) -> Option<&Arc<ServerSpec>> {
        self.specs.get(key)
    }

    /// All specs in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = (&SpecKey, &Arc<ServerSpec>)> {
        self.specs.iter()
    }

    /// Keys of specs that may serve traffic (not disabled, not
    /// `activation_mode = disabled`).
    pub fn enabled_keys(&self) -> Vec<SpecKey> {
        self.specs
            .iter()
            .filter(|(_, spec)| Self::is_enabled(spec))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether a spec may serve traffic.
    pub fn is_enabled(spec: &ServerSpec) -> bool {
        !spec.disabled && spec.activation() != ActivationMode::Disabled
    }

    /// Keys visible to a caller with the given tags: empty caller tags see
    /// every enabled spec, otherwise tag intersection decides.
    pub fn visible_keys(&self, tags: &[String]) -> Vec<SpecKey> {
        self.specs
            .iter()
            .filter(|(_, spec)| Self::is_enabled(spec))
            .filter(|(_, spec)| {
                tags.is_empty() || spec.tags.iter().any(|t| tags.contains(t))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys of specs that should be warmed at bootstrap: `always-on` or a
    /// positive keep-warm floor.
    pub fn warm_keys(&self) -> Vec<SpecKey> {
        self.specs
            .iter()
            .filter(|(_, spec)| Self::is_enabled(spec) && spec.keep_warm_floor() > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// What changed between two catalog snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogDiff {
    /// Keys present only in the new snapshot.
    pub added: Vec<SpecKey>,
    /// Keys present only in the old snapshot.
    pub removed: Vec<SpecKey>,
    /// Keys present in both with differing spec bodies.
    pub changed: Vec<SpecKey>,
}

impl CatalogDiff {
    /// Whether the two snapshots describe the same fleet.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compute the fleet-facing diff between two snapshots.
pub fn diff(old: &CatalogState, new: &CatalogState) -> CatalogDiff {
    let mut out = CatalogDiff::default();
    for (key, spec) in new.iter() {
        match old.get(key) {
            None => out.added.push(key.clone()),
            Some(prev) if prev.as_ref() != spec.as_ref() => out.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for (key, _) in old.iter() {
        if new.get(key).is_none() {
            out.removed.push(key.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(names: &[&str]) -> ShoalConfig {
        let servers = names
            .iter()
            .map(|name| {
                serde_yaml::from_str(&format!(
                    "name: {name}\ntransport: stdio\ncmd: [\"true\"]\n"
                ))
                .unwrap()
            })
            .collect();
        ShoalConfig {
            servers,
            runtime: Default::default(),
        }
    }

    #[test]
    fn diff_detects_added_and_removed() {
        let old = CatalogState::from_config(config(&["a", "b"]));
        let new = CatalogState::with_version(config(&["a", "c"]), 2);
        let d = diff(&old, &new);
        assert_eq!(d.added, vec![SpecKey::new("c")]);
        assert_eq!(d.removed, vec![SpecKey::new("b")]);
        assert!(d.changed.is_empty());
    }

    #[test]
    fn diff_detects_mutation() {
        let old = CatalogState::from_config(config(&["a"]));
        let mut cfg = config(&["a"]);
        cfg.servers[0].max_concurrent = 4;
        let new = CatalogState::with_version(cfg, 2);
        let d = diff(&old, &new);
        assert_eq!(d.changed, vec![SpecKey::new("a")]);
        assert!(d.added.is_empty() && d.removed.is_empty());
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let old = CatalogState::from_config(config(&["a", "b"]));
        let new = CatalogState::with_version(config(&["a", "b"]), 2);
        assert!(diff(&old, &new).is_empty());
    }

    #[test]
    fn visibility_by_tags() {
        let mut cfg = config(&["a", "b", "c"]);
        cfg.servers[0].tags = vec!["code".into()];
        cfg.servers[1].tags = vec!["gh".into()];
        cfg.servers[2].disabled = true;
        let state = CatalogState::from_config(cfg);

        let all = state.visible_keys(&[]);
        assert_eq!(all.len(), 2);

        let code = state.visible_keys(&["code".to_string()]);
        assert_eq!(code, vec![SpecKey::new("a")]);
    }

    #[test]
    fn untagged_specs_hidden_from_tagged_callers() {
        let state = CatalogState::from_config(config(&["plain"]));
        assert!(state.visible_keys(&["code".to_string()]).is_empty());
        assert_eq!(state.visible_keys(&[]).len(), 1);
    }
}
