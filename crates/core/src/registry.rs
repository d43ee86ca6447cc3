//! Client registry: caller identity and visibility scoping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{CatalogState, SpecKey};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::scheduler::SharedCatalog;

/// One registered caller.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Registry-assigned identity.
    pub client_id: Uuid,
    /// Caller-supplied name, used for task ownership.
    pub name: String,
    /// Caller pid, informational.
    pub pid: u32,
    /// Tags scoping visibility; empty means everything.
    pub tags: Vec<String>,
    /// Explicit server pin; wins over tags when set.
    pub server_pin: Option<SpecKey>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat, monotonic.
    last_heartbeat: Instant,
}

/// Registry of callers with staleness eviction.
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, ClientRecord>>,
    catalog: SharedCatalog,
    events: EventBus,
    cancel: CancellationToken,
}

impl ClientRegistry {
    /// Create a registry over the shared catalog.
    pub fn new(catalog: SharedCatalog, events: EventBus, cancel: CancellationToken) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            catalog,
            events,
            cancel,
        }
    }

    fn catalog_snapshot(&self) -> Arc<CatalogState> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Register a caller. A pin naming an unknown spec is rejected so typos
    /// surface at registration, not at first call.
    pub fn register(
        &self,
        name: &str,
        pid: u32,
        tags: Vec<String>,
        server_pin: Option<SpecKey>,
    ) -> CoreResult<Uuid> {
        if name.trim().is_empty() {
            return Err(CoreError::invalid_argument("client name must not be empty"));
        }
        if let Some(pin) = &server_pin {
            if self.catalog_snapshot().get(pin).is_none() {
                return Err(CoreError::invalid_argument(format!(
                    "pinned server '{pin}' is not in the catalog"
                )));
            }
        }
        let record = ClientRecord {
            client_id: Uuid::new_v4(),
            name: name.to_string(),
            pid,
            tags,
            server_pin,
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
        };
        let id = record.client_id;
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, record);
        info!(client = name, %id, "client registered");
        self.events.publish(CoreEvent::ClientsChanged);
        Ok(id)
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, client_id: Uuid) -> CoreResult<()> {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let record = clients
            .get_mut(&client_id)
            .ok_or_else(|| CoreError::not_found(format!("client {client_id}")))?;
        record.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Deregister a caller.
    pub fn deregister(&self, client_id: Uuid) {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&client_id);
        if removed.is_some() {
            self.events.publish(CoreEvent::ClientsChanged);
        }
    }

    /// Look up a caller.
    pub fn get(&self, client_id: Uuid) -> CoreResult<ClientRecord> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("client {client_id}")))
    }

    /// Spec keys visible to a caller, computed from the current catalog:
    /// explicit pin wins; otherwise tag intersection; empty caller tags see
    /// every enabled spec.
    pub fn resolve_visible(&self, client_id: Uuid) -> CoreResult<Vec<SpecKey>> {
        let record = self.get(client_id)?;
        let catalog = self.catalog_snapshot();
        if let Some(pin) = &record.server_pin {
            return Ok(match catalog.get(pin) {
                Some(spec) if CatalogState::is_enabled(spec) => vec![pin.clone()],
                _ => Vec::new(),
            });
        }
        Ok(catalog.visible_keys(&record.tags))
    }

    /// All registered callers.
    pub fn list(&self) -> Vec<ClientRecord> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Evict callers without a heartbeat inside `max_age`. Returns how many
    /// were dropped.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let before = clients.len();
        clients.retain(|_, record| record.last_heartbeat.elapsed() < max_age);
        let evicted = before - clients.len();
        drop(clients);
        if evicted > 0 {
            debug!(evicted, "evicted stale clients");
            self.events.publish(CoreEvent::ClientsChanged);
        }
        evicted
    }

    /// Spawn the staleness sweep.
    pub fn spawn_workers(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let (check, inactive) = {
                let runtime = registry.catalog_snapshot().runtime().clone();
                (
                    Duration::from_secs(runtime.client_check_seconds.max(1)),
                    Duration::from_secs(runtime.client_inactive_seconds.max(1)),
                )
            };
            let mut ticker = tokio::time::interval(check);
            loop {
                tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_stale(inactive);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShoalConfig;

    fn registry(names: &[&str]) -> ClientRegistry {
        let servers = names
            .iter()
            .map(|name| {
                serde_yaml::from_str(&format!(
                    "name: {name}\ntransport: stdio\ncmd: [\"true\"]\ntags: [\"code\"]\n"
                ))
                .unwrap()
            })
            .collect();
        let config = ShoalConfig {
            servers,
            runtime: Default::default(),
        };
        let catalog = Arc::new(RwLock::new(Arc::new(CatalogState::from_config(config))));
        ClientRegistry::new(catalog, EventBus::new(), CancellationToken::new())
    }

    #[test]
    fn pin_wins_over_tags() {
        let registry = registry(&["a", "b"]);
        let id = registry
            .register("cli", 42, vec!["other".into()], Some(SpecKey::new("b")))
            .unwrap();
        assert_eq!(registry.resolve_visible(id).unwrap(), vec![SpecKey::new("b")]);
    }

    #[test]
    fn tag_intersection_and_empty_tags() {
        let registry = registry(&["a", "b"]);
        let tagged = registry
            .register("tagged", 1, vec!["code".into()], None)
            .unwrap();
        assert_eq!(registry.resolve_visible(tagged).unwrap().len(), 2);

        let mismatched = registry
            .register("mismatched", 2, vec!["gh".into()], None)
            .unwrap();
        assert!(registry.resolve_visible(mismatched).unwrap().is_empty());

        let open = registry.register("open", 3, vec![], None).unwrap();
        assert_eq!(registry.resolve_visible(open).unwrap().len(), 2);
    }

    #[test]
    fn unknown_pin_rejected() {
        let registry = registry(&["a"]);
        assert!(registry
            .register("cli", 1, vec![], Some(SpecKey::new("nope")))
            .is_err());
    }

    #[test]
    fn stale_eviction() {
        let registry = registry(&["a"]);
        let id = registry.register("cli", 1, vec![], None).unwrap();
        assert_eq!(registry.evict_stale(Duration::from_secs(60)), 0);
        assert!(registry.get(id).is_ok());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(registry.evict_stale(Duration::from_millis(1)), 1);
        assert!(registry.get(id).is_err());
    }
}
