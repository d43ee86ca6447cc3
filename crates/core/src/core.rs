//! Composition root: wiring, startup, reload, shutdown.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use shoal_types::{PoolStatus, ServerInitStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::aggregator::{AggregatedItem, Aggregator};
use crate::bootstrap::{self, BootstrapReport};
use crate::catalog::{self, CatalogDiff, CatalogState, SpecKey};
use crate::config::{validate_config, ReloadMode, ShoalConfig};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus, IndexKind};
use crate::governance::Governor;
use crate::lifecycle::{LifecycleManager, StartObserver, TracingObserver};
use crate::logbuf::LogBuffer;
use crate::probe::Probe;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::router::{RouteRequest, Router};
use crate::scheduler::{Scheduler, SharedCatalog};
use crate::selector::{PassthroughSelector, ToolSelector};
use crate::tasks::TaskManager;

/// Which stage a failed reload died in. Earlier state is left intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Structural validation of the new document.
    Validate,
    /// Applying the diff to the fleet.
    Apply,
}

/// A failed reload.
#[derive(Debug, Error)]
#[error("reload failed during {stage:?}: {error}")]
pub struct ReloadError {
    /// Stage that failed.
    pub stage: FailureStage,
    /// Underlying error.
    #[source]
    pub error: CoreError,
}

/// Outcome of a successful reload.
#[derive(Debug)]
pub struct ReloadOutcome {
    /// New catalog version (unchanged for a no-op reload).
    pub version: u64,
    /// What changed.
    pub diff: CatalogDiff,
}

/// Builder-style options for [`Core::new`].
pub struct CoreOptions {
    /// Governance seam; defaults to pass-through.
    pub governor: Arc<dyn Governor>,
    /// Tool selector seam; defaults to pass-through.
    pub selector: Arc<dyn ToolSelector>,
    /// Start diagnostics observer; defaults to tracing.
    pub observer: Arc<dyn StartObserver>,
    /// Launcher override; defaults to the real lifecycle manager. Tests use
    /// this to schedule scripted instances.
    pub launcher: Option<Arc<dyn crate::scheduler::InstanceLauncher>>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            governor: Arc::new(crate::governance::NoopGovernor),
            selector: Arc::new(PassthroughSelector),
            observer: Arc::new(TracingObserver),
            launcher: None,
        }
    }
}

/// The elastic runtime, fully wired.
pub struct Core {
    catalog: SharedCatalog,
    scheduler: Arc<Scheduler>,
    aggregator: Arc<Aggregator>,
    registry: Arc<ClientRegistry>,
    tasks: Arc<TaskManager>,
    router: Router,
    selector: Arc<dyn ToolSelector>,
    logs: Arc<LogBuffer>,
    events: EventBus,
    cancel: CancellationToken,
    reload_lock: tokio::sync::Mutex<()>,
    notifications: std::sync::Mutex<
        Option<mpsc::UnboundedReceiver<crate::transport::ListChangedNotice>>,
    >,
}

impl Core {
    /// Wire a core from a validated configuration.
    pub fn new(config: ShoalConfig, options: CoreOptions) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let events = EventBus::new();
        let logs = Arc::new(LogBuffer::new());
        let catalog: SharedCatalog =
            Arc::new(RwLock::new(Arc::new(CatalogState::from_config(config))));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let launcher: Arc<dyn crate::scheduler::InstanceLauncher> = match options.launcher {
            Some(launcher) => launcher,
            None => Arc::new(LifecycleManager::new(
                notify_tx,
                Arc::clone(&logs),
                options.observer,
            )),
        };
        let scheduler = Arc::new(Scheduler::new(
            launcher,
            Arc::clone(&catalog),
            events.clone(),
            cancel.child_token(),
        ));
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&scheduler) as Arc<dyn crate::aggregator::MetadataSource>,
            Arc::clone(&catalog),
            events.clone(),
            cancel.child_token(),
        ));
        let registry = Arc::new(ClientRegistry::new(
            Arc::clone(&catalog),
            events.clone(),
            cancel.child_token(),
        ));
        let tasks = Arc::new(TaskManager::new(cancel.child_token()));
        let router = Router::new(
            Arc::clone(&scheduler),
            Arc::clone(&aggregator),
            Arc::clone(&registry),
            options.governor,
            Arc::clone(&catalog),
        );

        Arc::new(Self {
            catalog,
            scheduler,
            aggregator,
            registry,
            tasks,
            router,
            selector: options.selector,
            logs,
            events,
            cancel,
            reload_lock: tokio::sync::Mutex::new(()),
            notifications: std::sync::Mutex::new(Some(notify_rx)),
        })
    }

    /// Spawn background workers and run bootstrap.
    pub async fn start(self: &Arc<Self>) -> BootstrapReport {
        let Some(notifications) = self
            .notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            // Second start is a no-op; workers are already running.
            return BootstrapReport::default();
        };
        self.scheduler.spawn_workers();
        self.aggregator.spawn_workers(notifications);
        self.registry.spawn_workers();
        self.tasks.spawn_workers();
        Arc::new(Probe::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.catalog),
            self.cancel.child_token(),
        ))
        .spawn_workers();

        bootstrap::run(&self.scheduler, &self.aggregator, &self.catalog).await
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<CatalogState> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Event bus handle.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared log ring.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Task manager.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Cancellation root, for embedding hosts.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ----- client registry surface -----

    /// Register a caller.
    pub fn register_client(
        &self,
        name: &str,
        pid: u32,
        tags: Vec<String>,
        server_pin: Option<SpecKey>,
    ) -> CoreResult<Uuid> {
        self.registry.register(name, pid, tags, server_pin)
    }

    /// Record a caller heartbeat.
    pub fn heartbeat(&self, client_id: Uuid) -> CoreResult<()> {
        self.registry.heartbeat(client_id)
    }

    /// Remove a caller.
    pub fn deregister_client(&self, client_id: Uuid) {
        self.registry.deregister(client_id)
    }

    /// Look up a caller record.
    pub fn client(&self, client_id: Uuid) -> CoreResult<ClientRecord> {
        self.registry.get(client_id)
    }

    /// Spec keys visible to a caller.
    pub fn visible_keys(&self, client_id: Option<Uuid>) -> CoreResult<Vec<SpecKey>> {
        match client_id {
            Some(id) => self.registry.resolve_visible(id),
            None => Ok(self.catalog().enabled_keys()),
        }
    }

    // ----- aggregated listings -----

    /// List tools visible to a caller, after the selector pass. Returns the
    /// items and the subset ETag.
    pub async fn list_tools(
        &self,
        client_id: Option<Uuid>,
        intent: Option<&str>,
    ) -> CoreResult<(Vec<AggregatedItem>, String)> {
        let visible = self.visible_keys(client_id)?;
        let snapshot = self.aggregator.snapshot(IndexKind::Tools).await;
        let etag = snapshot.subset_etag(&visible);
        let items: Vec<AggregatedItem> = snapshot
            .visible_items(&visible)
            .into_iter()
            .cloned()
            .collect();
        let client_name = match client_id.and_then(|id| self.registry.get(id).ok()) {
            Some(record) => record.name,
            None => String::new(),
        };
        let items = self
            .selector
            .select_tools_for_client(&client_name, intent, items)
            .await?;
        Ok((items, etag))
    }

    /// List resources visible to a caller.
    pub async fn list_resources(
        &self,
        client_id: Option<Uuid>,
    ) -> CoreResult<(Vec<AggregatedItem>, String)> {
        self.list_kind(client_id, IndexKind::Resources).await
    }

    /// List prompts visible to a caller.
    pub async fn list_prompts(
        &self,
        client_id: Option<Uuid>,
    ) -> CoreResult<(Vec<AggregatedItem>, String)> {
        self.list_kind(client_id, IndexKind::Prompts).await
    }

    async fn list_kind(
        &self,
        client_id: Option<Uuid>,
        kind: IndexKind,
    ) -> CoreResult<(Vec<AggregatedItem>, String)> {
        let visible = self.visible_keys(client_id)?;
        let snapshot = self.aggregator.snapshot(kind).await;
        let etag = snapshot.subset_etag(&visible);
        let items = snapshot
            .visible_items(&visible)
            .into_iter()
            .cloned()
            .collect();
        Ok((items, etag))
    }

    /// ETag of a caller's visible projection, for change notifications.
    pub fn visible_etag(&self, client_id: Option<Uuid>, kind: IndexKind) -> CoreResult<String> {
        let visible = self.visible_keys(client_id)?;
        Ok(self.aggregator.snapshot_now(kind).subset_etag(&visible))
    }

    // ----- routed calls -----

    /// Call a tool by namespaced name.
    pub async fn call_tool(
        &self,
        client_id: Option<Uuid>,
        namespaced_name: &str,
        arguments: Value,
        routing_key: Option<String>,
    ) -> CoreResult<Value> {
        self.router
            .route(RouteRequest {
                client_id,
                method: "tools/call".to_string(),
                target: namespaced_name.to_string(),
                routing_key,
                payload: arguments,
            })
            .await
    }

    /// Read a resource by URI.
    pub async fn read_resource(
        &self,
        client_id: Option<Uuid>,
        uri: &str,
    ) -> CoreResult<Value> {
        self.router
            .route(RouteRequest {
                client_id,
                method: "resources/read".to_string(),
                target: uri.to_string(),
                routing_key: None,
                payload: Value::Null,
            })
            .await
    }

    /// Materialize a prompt by namespaced name.
    pub async fn get_prompt(
        &self,
        client_id: Option<Uuid>,
        namespaced_name: &str,
        arguments: Value,
    ) -> CoreResult<Value> {
        self.router
            .route(RouteRequest {
                client_id,
                method: "prompts/get".to_string(),
                target: namespaced_name.to_string(),
                routing_key: None,
                payload: arguments,
            })
            .await
    }

    // ----- status surfaces -----

    /// Pool snapshots for every spec.
    pub fn pool_statuses(&self) -> Vec<PoolStatus> {
        self.scheduler.all_pool_statuses()
    }

    /// Init statuses for every spec.
    pub fn init_statuses(&self) -> Vec<ServerInitStatus> {
        self.scheduler.all_init_statuses()
    }

    // ----- reload -----

    /// Apply a new configuration to the live fleet.
    ///
    /// Runs under a single critical section. Validation failure leaves the
    /// previous catalog fully intact; reloading an identical document is a
    /// no-op that emits no events.
    pub async fn reload(&self, config: ShoalConfig) -> Result<ReloadOutcome, ReloadError> {
        let _guard = self.reload_lock.lock().await;

        validate_config(&config).map_err(|err| ReloadError {
            stage: FailureStage::Validate,
            error: CoreError::from(err),
        })?;

        let old = self.catalog();
        let new = Arc::new(CatalogState::with_version(config, old.version() + 1));
        let diff = catalog::diff(&old, &new);
        if diff.is_empty() {
            return Ok(ReloadOutcome {
                version: old.version(),
                diff,
            });
        }

        let reload_mode = new.runtime().reload_mode;
        {
            let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
            *catalog = Arc::clone(&new);
        }

        for key in &diff.removed {
            self.scheduler.drain_spec(key);
        }
        for key in &diff.changed {
            match reload_mode {
                ReloadMode::InPlace => {
                    if let Some(spec) = new.get(key) {
                        self.scheduler.update_spec_in_place(key, Arc::clone(spec));
                    }
                }
                ReloadMode::Recreate => self.scheduler.recreate_spec(key),
            }
        }

        self.aggregator.update_specs(&diff).await;

        // Warm added (and recreated) specs per their activation policy,
        // off the critical path.
        let warm_targets: Vec<SpecKey> = diff
            .added
            .iter()
            .chain(
                diff.changed
                    .iter()
                    .filter(|_| reload_mode == ReloadMode::Recreate),
            )
            .filter(|key| {
                new.get(key)
                    .is_some_and(|spec| CatalogState::is_enabled(spec) && spec.keep_warm_floor() > 0)
            })
            .cloned()
            .collect();
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            for key in warm_targets {
                let _ = scheduler
                    .warm_spec(&key, shoal_types::StartCause::Bootstrap)
                    .await;
            }
        });

        info!(version = new.version(), added = diff.added.len(), removed = diff.removed.len(), changed = diff.changed.len(), "reload applied");
        self.events.publish(CoreEvent::ReloadApplied {
            version: new.version(),
        });
        Ok(ReloadOutcome {
            version: new.version(),
            diff,
        })
    }

    /// Graceful shutdown: stop intake, drain pools, cancel workers.
    pub async fn shutdown(&self) {
        info!("shutting down core");
        self.cancel.cancel();
        self.scheduler.shutdown().await;
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("catalog_version", &self.catalog().version())
            .finish_non_exhaustive()
    }
}
