//! Aggregated tool/resource/prompt indexes.
//!
//! For each kind the aggregator keeps a per-spec metadata cache and an
//! atomically swapped, catalog-ordered snapshot with a stable ETag. Refresh
//! sources: the periodic worker, list-changed notifications (already gated
//! on the declared capability by the transport handler), and reload.
//!
//! Scale-to-zero interplay: a periodic refresh never cold-starts an
//! instance. When a spec has no live instance the cached entry keeps
//! serving (`Source = cache`); only a spec with no cache entry at all is
//! fetched cold, which happens once on first use or during bootstrap.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmcp::model::{Prompt, Resource, Tool};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogState, SpecKey};
use crate::config::NamespaceStrategy;
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus, IndexKind};
use crate::scheduler::SharedCatalog;
use crate::transport::ListChangedNotice;

/// Items fetched from one spec for one kind.
#[derive(Debug, Clone)]
pub enum MetadataItems {
    Tools(Vec<Tool>),
    Resources(Vec<Resource>),
    Prompts(Vec<Prompt>),
}

impl MetadataItems {
    fn len(&self) -> usize {
        match self {
            MetadataItems::Tools(v) => v.len(),
            MetadataItems::Resources(v) => v.len(),
            MetadataItems::Prompts(v) => v.len(),
        }
    }
}

/// Where the aggregator fetches metadata from. Implemented by the scheduler;
/// the aggregator never sees pools or instances.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch the item list of one kind from one spec.
    async fn fetch(&self, key: &SpecKey, kind: IndexKind) -> CoreResult<MetadataItems>;

    /// Whether the spec currently has a leasable instance.
    fn has_live_instance(&self, key: &SpecKey) -> bool;
}

/// Whether a snapshot row came from a live fetch or the metadata cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Live,
    Cache,
}

/// One projected item in a snapshot.
#[derive(Debug, Clone)]
pub struct AggregatedItem {
    /// Owning spec.
    pub spec: SpecKey,
    /// Original item name.
    pub name: String,
    /// Externally visible namespaced name.
    pub namespaced_name: String,
    /// Resource URI, for resource items.
    pub uri: Option<String>,
    /// The underlying definition.
    pub item: Item,
}

/// The underlying MCP definition.
#[derive(Debug, Clone)]
pub enum Item {
    Tool(Tool),
    Resource(Resource),
    Prompt(Prompt),
}

/// Immutable, atomically swapped projection of one kind.
#[derive(Debug)]
pub struct KindSnapshot {
    /// Which kind this snapshot projects.
    pub kind: IndexKind,
    /// Stable hash of the ordered item list.
    pub etag: String,
    /// Items in catalog order, then item order as reported by the spec.
    pub items: Vec<AggregatedItem>,
    /// Reverse index: namespaced name → position in `items`.
    reverse: HashMap<String, usize>,
    /// Resource URIs → position, for reads addressed by URI.
    by_uri: HashMap<String, usize>,
    /// Per-spec data source for this snapshot.
    pub sources: HashMap<SpecKey, SnapshotSource>,
}

impl KindSnapshot {
    fn empty(kind: IndexKind) -> Self {
        Self {
            kind,
            etag: "0".to_string(),
            items: Vec::new(),
            reverse: HashMap::new(),
            by_uri: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Resolve a namespaced name to its item.
    pub fn resolve(&self, namespaced: &str) -> Option<&AggregatedItem> {
        self.reverse.get(namespaced).map(|&i| &self.items[i])
    }

    /// Resolve a resource URI to its item.
    pub fn resolve_uri(&self, uri: &str) -> Option<&AggregatedItem> {
        self.by_uri.get(uri).map(|&i| &self.items[i])
    }

    /// Items belonging to the given visible spec set, in snapshot order.
    pub fn visible_items(&self, visible: &[SpecKey]) -> Vec<&AggregatedItem> {
        self.items
            .iter()
            .filter(|item| visible.contains(&item.spec))
            .collect()
    }

    /// ETag of the projection restricted to a visible spec set.
    pub fn subset_etag(&self, visible: &[SpecKey]) -> String {
        let mut hasher = ahash::AHasher::default();
        for item in self.items.iter().filter(|i| visible.contains(&i.spec)) {
            item.namespaced_name.hash(&mut hasher);
        }
        format!("{:x}", hasher.finish())
    }
}

/// One cached per-spec fetch.
#[derive(Debug, Clone)]
struct CacheEntry {
    items: MetadataItems,
    fetched_at: DateTime<Utc>,
    source: SnapshotSource,
}

/// Per-kind mutable state.
struct KindState {
    cache: HashMap<SpecKey, CacheEntry>,
    snapshot: Arc<KindSnapshot>,
}

impl KindState {
    fn new(kind: IndexKind) -> Self {
        Self {
            cache: HashMap::new(),
            snapshot: Arc::new(KindSnapshot::empty(kind)),
        }
    }
}

/// Blocks first snapshots until bootstrap declares metadata ready.
#[derive(Debug, Default)]
struct BootstrapGate {
    ready: AtomicBool,
    notify: Notify,
}

impl BootstrapGate {
    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self, timeout: Duration) {
        if self.ready.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(timeout, async {
            loop {
                if self.ready.load(Ordering::SeqCst) {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await;
    }
}

/// The aggregator.
pub struct Aggregator {
    source: Arc<dyn MetadataSource>,
    catalog: SharedCatalog,
    events: EventBus,
    kinds: [RwLock<KindState>; 3],
    inflight: Mutex<HashSet<(SpecKey, IndexKind)>>,
    gate: BootstrapGate,
    cancel: CancellationToken,
}

impl Aggregator {
    /// Create an aggregator over a metadata source and the shared catalog.
    pub fn new(
        source: Arc<dyn MetadataSource>,
        catalog: SharedCatalog,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            catalog,
            events,
            kinds: [
                RwLock::new(KindState::new(IndexKind::Tools)),
                RwLock::new(KindState::new(IndexKind::Resources)),
                RwLock::new(KindState::new(IndexKind::Prompts)),
            ],
            inflight: Mutex::new(HashSet::new()),
            gate: BootstrapGate::default(),
            cancel,
        }
    }

    fn kind_state(&self, kind: IndexKind) -> &RwLock<KindState> {
        match kind {
            IndexKind::Tools => &self.kinds[0],
            IndexKind::Resources => &self.kinds[1],
            IndexKind::Prompts => &self.kinds[2],
        }
    }

    fn catalog_snapshot(&self) -> Arc<CatalogState> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Declare bootstrap metadata ready; unblocks waiting snapshots.
    pub fn mark_bootstrap_ready(&self) {
        self.gate.mark_ready();
    }

    /// Current snapshot for a kind. The first call per process blocks until
    /// bootstrap reports metadata ready (unless `bootstrap_mode = none`).
    pub async fn snapshot(&self, kind: IndexKind) -> Arc<KindSnapshot> {
        let runtime = self.catalog_snapshot().runtime().clone();
        if runtime.bootstrap_mode != crate::config::BootstrapMode::None {
            self.gate
                .wait(Duration::from_secs(runtime.bootstrap_timeout_seconds))
                .await;
        }
        Arc::clone(
            &self
                .kind_state(kind)
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot,
        )
    }

    /// Non-blocking snapshot access for status surfaces.
    pub fn snapshot_now(&self, kind: IndexKind) -> Arc<KindSnapshot> {
        Arc::clone(
            &self
                .kind_state(kind)
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot,
        )
    }

    /// Refresh one `(spec, kind)` cell, single-flight.
    ///
    /// `force_live` bypasses the cache-serving shortcut (used by reload and
    /// list-changed notifications).
    pub async fn refresh_spec(&self, key: &SpecKey, kind: IndexKind, force_live: bool) {
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if !inflight.insert((key.clone(), kind)) {
                return;
            }
        }
        let result = self.refresh_spec_inner(key, kind, force_live).await;
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.remove(&(key.clone(), kind));
        }
        if let Err(err) = result {
            debug!(spec = %key, kind = kind.label(), error = %err, "metadata refresh failed");
        }
    }

    async fn refresh_spec_inner(
        &self,
        key: &SpecKey,
        kind: IndexKind,
        force_live: bool,
    ) -> CoreResult<()> {
        let catalog = self.catalog_snapshot();
        let Some(spec) = catalog.get(key) else {
            return Ok(());
        };
        if !CatalogState::is_enabled(spec) {
            return Ok(());
        }

        let has_cache = {
            let state = self.kind_state(kind).read().unwrap_or_else(|e| e.into_inner());
            state.cache.contains_key(key)
        };
        // Never cold-start an instance just to refresh metadata we already
        // have; the cached entry keeps serving until the spec is live again.
        if !force_live && has_cache && !self.source.has_live_instance(key) {
            return Ok(());
        }

        match self.source.fetch(key, kind).await {
            Ok(items) => {
                let items = filter_items(items, spec.expose_tools.as_deref(), catalog.runtime().expose_tools.as_deref());
                debug!(spec = %key, kind = kind.label(), count = items.len(), "metadata refreshed");
                let mut state = self.kind_state(kind).write().unwrap_or_else(|e| e.into_inner());
                state.cache.insert(
                    key.clone(),
                    CacheEntry {
                        items,
                        fetched_at: Utc::now(),
                        source: SnapshotSource::Live,
                    },
                );
                drop(state);
                self.rebuild(kind);
                Ok(())
            }
            Err(err) => {
                // Transient failure: keep the cached entry but downgrade its
                // source tag so callers can see it is stale.
                let mut state = self.kind_state(kind).write().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = state.cache.get_mut(key) {
                    entry.source = SnapshotSource::Cache;
                    drop(state);
                    self.rebuild(kind);
                }
                Err(err)
            }
        }
    }

    /// Rebuild the snapshot for one kind from the cache, in catalog order,
    /// and publish an event when the ETag moved.
    fn rebuild(&self, kind: IndexKind) {
        let catalog = self.catalog_snapshot();
        let strategy = catalog.runtime().tool_namespace_strategy;

        let mut items = Vec::new();
        let mut reverse = HashMap::new();
        let mut by_uri = HashMap::new();
        let mut sources = HashMap::new();

        let state = self.kind_state(kind).read().unwrap_or_else(|e| e.into_inner());
        for (key, spec) in catalog.iter() {
            if !CatalogState::is_enabled(spec) {
                continue;
            }
            let Some(entry) = state.cache.get(key) else {
                continue;
            };
            sources.insert(key.clone(), entry.source);
            for item in iter_items(&entry.items) {
                let name = item_name(&item);
                let namespaced = namespaced_name(strategy, key.name(), &name);
                if reverse.contains_key(&namespaced) {
                    warn!(
                        spec = %key,
                        name = %namespaced,
                        "duplicate namespaced name; keeping the first occurrence"
                    );
                    continue;
                }
                let uri = match &item {
                    Item::Resource(resource) => Some(resource.uri.to_string()),
                    _ => None,
                };
                let index = items.len();
                reverse.insert(namespaced.clone(), index);
                if let Some(uri) = &uri {
                    by_uri.entry(uri.clone()).or_insert(index);
                }
                items.push(AggregatedItem {
                    spec: key.clone(),
                    name,
                    namespaced_name: namespaced,
                    uri,
                    item,
                });
            }
        }
        drop(state);

        let etag = compute_etag(&items);
        let snapshot = Arc::new(KindSnapshot {
            kind,
            etag: etag.clone(),
            items,
            reverse,
            by_uri,
            sources,
        });

        let mut state = self.kind_state(kind).write().unwrap_or_else(|e| e.into_inner());
        let changed = state.snapshot.etag != etag;
        state.snapshot = snapshot;
        drop(state);

        if changed {
            self.events.publish(CoreEvent::SnapshotChanged { kind, etag });
        }
    }

    /// Apply a catalog diff: purge removed specs, force-refresh added and
    /// changed ones.
    pub async fn update_specs(&self, diff: &crate::catalog::CatalogDiff) {
        for kind in IndexKind::ALL {
            let mut state = self.kind_state(kind).write().unwrap_or_else(|e| e.into_inner());
            for key in &diff.removed {
                state.cache.remove(key);
            }
            drop(state);
            self.rebuild(kind);
        }
        for key in diff.added.iter().chain(diff.changed.iter()) {
            for kind in IndexKind::ALL {
                self.refresh_spec(key, kind, true).await;
            }
        }
    }

    /// Sweep every enabled spec once, with bounded concurrency.
    pub async fn refresh_all(self: &Arc<Self>, force_live: bool) {
        let catalog = self.catalog_snapshot();
        let concurrency = catalog.runtime().tool_refresh_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::new();
        for key in catalog.enabled_keys() {
            let permit = Arc::clone(&semaphore).acquire_owned().await;
            let Ok(permit) = permit else { return };
            let this = self.clone_handle();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                // Kinds fetch sequentially so one lease serves the sweep.
                for kind in IndexKind::ALL {
                    this.refresh_spec(&key, kind, force_live).await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawn the periodic refresh worker and the notification listener.
    pub fn spawn_workers(
        self: &Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<ListChangedNotice>,
    ) {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let interval = {
                let secs = aggregator
                    .catalog_snapshot()
                    .runtime()
                    .tool_refresh_seconds
                    .max(1);
                Duration::from_secs(secs)
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, bootstrap primes us.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = aggregator.cancel.cancelled() => break,
                    _ = ticker.tick() => aggregator.refresh_all(false).await,
                }
            }
        });

        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = aggregator.cancel.cancelled() => break,
                    notice = notifications.recv() => {
                        let Some(notice) = notice else { break };
                        info!(spec = %notice.spec, kind = notice.kind.label(), "list_changed notification");
                        aggregator.refresh_spec(&notice.spec, notice.kind, true).await;
                    }
                }
            }
        });
    }

    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }
}

fn iter_items(items: &MetadataItems) -> Vec<Item> {
    match items {
        MetadataItems::Tools(v) => v.iter().cloned().map(Item::Tool).collect(),
        MetadataItems::Resources(v) => v.iter().cloned().map(Item::Resource).collect(),
        MetadataItems::Prompts(v) => v.iter().cloned().map(Item::Prompt).collect(),
    }
}

fn item_name(item: &Item) -> String {
    match item {
        Item::Tool(tool) => tool.name.to_string(),
        Item::Resource(resource) => resource.name.to_string(),
        Item::Prompt(prompt) => prompt.name.to_string(),
    }
}

/// Project a bare name through the configured namespace.
pub fn namespaced_name(strategy: NamespaceStrategy, server: &str, name: &str) -> String {
    match strategy {
        NamespaceStrategy::Prefix => format!("{server}__{name}"),
        NamespaceStrategy::Suffix => format!("{name}__{server}"),
    }
}

/// Split a namespaced name back into `(server, name)`.
pub fn split_namespaced(strategy: NamespaceStrategy, namespaced: &str) -> Option<(String, String)> {
    match strategy {
        NamespaceStrategy::Prefix => namespaced
            .split_once("__")
            .map(|(server, name)| (server.to_string(), name.to_string())),
        NamespaceStrategy::Suffix => namespaced
            .rsplit_once("__")
            .map(|(name, server)| (server.to_string(), name.to_string())),
    }
}

/// Apply the spec-level allow-list (authoritative) and then the runtime-level
/// one. Only tools are filtered; resources and prompts pass through.
fn filter_items(
    items: MetadataItems,
    spec_allow: Option<&[String]>,
    runtime_allow: Option<&[String]>,
) -> MetadataItems {
    match items {
        MetadataItems::Tools(tools) => {
            let filtered = tools
                .into_iter()
                .filter(|tool| {
                    let name = tool.name.as_ref();
                    spec_allow.is_none_or(|allow| allow.iter().any(|a| a == name))
                        && runtime_allow.is_none_or(|allow| allow.iter().any(|a| a == name))
                })
                .collect();
            MetadataItems::Tools(filtered)
        }
        other => other,
    }
}

fn compute_etag(items: &[AggregatedItem]) -> String {
    let mut hasher = ahash::AHasher::default();
    for item in items {
        item.namespaced_name.hash(&mut hasher);
        if let Ok(json) = serde_json::to_string(&match &item.item {
            Item::Tool(t) => serde_json::to_value(t).unwrap_or_default(),
            Item::Resource(r) => serde_json::to_value(r).unwrap_or_default(),
            Item::Prompt(p) => serde_json::to_value(p).unwrap_or_default(),
        }) {
            json.hash(&mut hasher);
        }
    }
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShoalConfig;
    use std::sync::atomic::AtomicU64;

    struct FakeSource {
        tools: Mutex<HashMap<SpecKey, Vec<Tool>>>,
        live: Mutex<HashSet<SpecKey>>,
        fetches: AtomicU64,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                tools: Mutex::new(HashMap::new()),
                live: Mutex::new(HashSet::new()),
                fetches: AtomicU64::new(0),
            }
        }

        fn set_tools(&self, key: &str, names: &[&str]) {
            let tools = names
                .iter()
                .map(|n| Tool::new(n.to_string(), "t", serde_json::Map::new()))
                .collect();
            self.tools.lock().unwrap().insert(SpecKey::new(key), tools);
        }

        fn set_live(&self, key: &str, live: bool) {
            let mut set = self.live.lock().unwrap();
            if live {
                set.insert(SpecKey::new(key));
            } else {
                set.remove(&SpecKey::new(key));
            }
        }
    }

    #[async_trait]
    impl MetadataSource for FakeSource {
        async fn fetch(&self, key: &SpecKey, kind: IndexKind) -> CoreResult<MetadataItems> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match kind {
                IndexKind::Tools => Ok(MetadataItems::Tools(
                    self.tools
                        .lock()
                        .unwrap()
                        .get(key)
                        .cloned()
                        .ok_or_else(|| CoreError::unavailable("no tools scripted"))?,
                )),
                IndexKind::Resources => Ok(MetadataItems::Resources(vec![])),
                IndexKind::Prompts => Ok(MetadataItems::Prompts(vec![])),
            }
        }

        fn has_live_instance(&self, key: &SpecKey) -> bool {
            self.live.lock().unwrap().contains(key)
        }
    }

    fn catalog(names: &[&str]) -> SharedCatalog {
        let servers = names
            .iter()
            .map(|name| {
                serde_yaml::from_str(&format!(
                    "name: {name}\ntransport: stdio\ncmd: [\"true\"]\n"
                ))
                .unwrap()
            })
            .collect();
        let config = ShoalConfig {
            servers,
            runtime: Default::default(),
        };
        Arc::new(RwLock::new(Arc::new(CatalogState::from_config(config))))
    }

    fn aggregator(names: &[&str]) -> (Arc<Aggregator>, Arc<FakeSource>) {
        let source = Arc::new(FakeSource::new());
        let agg = Arc::new(Aggregator::new(
            Arc::clone(&source) as Arc<dyn MetadataSource>,
            catalog(names),
            EventBus::new(),
            CancellationToken::new(),
        ));
        agg.mark_bootstrap_ready();
        (agg, source)
    }

    #[tokio::test]
    async fn namespaced_projection_and_reverse_lookup() {
        let (agg, source) = aggregator(&["alpha"]);
        source.set_tools("alpha", &["echo", "sum"]);
        source.set_live("alpha", true);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;

        let snapshot = agg.snapshot(IndexKind::Tools).await;
        assert_eq!(snapshot.items.len(), 2);
        let item = snapshot.resolve("alpha__echo").expect("resolves");
        assert_eq!(item.spec, SpecKey::new("alpha"));
        assert_eq!(item.name, "echo");
    }

    #[tokio::test]
    async fn etag_changes_iff_items_change() {
        let (agg, source) = aggregator(&["alpha"]);
        source.set_tools("alpha", &["echo"]);
        source.set_live("alpha", true);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;
        let etag1 = agg.snapshot(IndexKind::Tools).await.etag.clone();

        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, true).await;
        let etag2 = agg.snapshot(IndexKind::Tools).await.etag.clone();
        assert_eq!(etag1, etag2);

        source.set_tools("alpha", &["echo", "sum"]);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, true).await;
        let etag3 = agg.snapshot(IndexKind::Tools).await.etag.clone();
        assert_ne!(etag1, etag3);
    }

    #[tokio::test]
    async fn cached_entry_served_when_spec_is_cold() {
        let (agg, source) = aggregator(&["alpha"]);
        source.set_tools("alpha", &["echo"]);
        source.set_live("alpha", true);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;
        let before = source.fetches.load(Ordering::SeqCst);

        // Spec scaled to zero: periodic refresh does not fetch again.
        source.set_live("alpha", false);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), before);
        assert_eq!(agg.snapshot(IndexKind::Tools).await.items.len(), 1);
    }

    #[tokio::test]
    async fn removed_spec_is_purged() {
        let (agg, source) = aggregator(&["alpha", "beta"]);
        source.set_tools("alpha", &["echo"]);
        source.set_tools("beta", &["sum"]);
        source.set_live("alpha", true);
        source.set_live("beta", true);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;
        agg.refresh_spec(&SpecKey::new("beta"), IndexKind::Tools, false).await;
        assert_eq!(agg.snapshot(IndexKind::Tools).await.items.len(), 2);

        let diff = crate::catalog::CatalogDiff {
            removed: vec![SpecKey::new("beta")],
            ..Default::default()
        };
        agg.update_specs(&diff).await;
        let snapshot = agg.snapshot(IndexKind::Tools).await;
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.resolve("beta__sum").is_none());
    }

    #[test]
    fn namespace_round_trip() {
        let n = namespaced_name(NamespaceStrategy::Prefix, "alpha", "echo");
        assert_eq!(n, "alpha__echo");
        assert_eq!(
            split_namespaced(NamespaceStrategy::Prefix, &n),
            Some(("alpha".to_string(), "echo".to_string()))
        );

        let n = namespaced_name(NamespaceStrategy::Suffix, "alpha", "echo");
        assert_eq!(n, "echo__alpha");
        assert_eq!(
            split_namespaced(NamespaceStrategy::Suffix, &n),
            Some(("alpha".to_string(), "echo".to_string()))
        );
    }

    #[tokio::test]
    async fn expose_tools_filters_apply() {
        let source = Arc::new(FakeSource::new());
        let servers = vec![serde_yaml::from_str::<crate::config::ServerSpec>(
            "name: alpha\ntransport: stdio\ncmd: [\"true\"]\nexposeTools: [\"echo\"]\n",
        )
        .unwrap()];
        let config = ShoalConfig {
            servers,
            runtime: Default::default(),
        };
        let catalog: SharedCatalog =
            Arc::new(RwLock::new(Arc::new(CatalogState::from_config(config))));
        let agg = Arc::new(Aggregator::new(
            Arc::clone(&source) as Arc<dyn MetadataSource>,
            catalog,
            EventBus::new(),
            CancellationToken::new(),
        ));
        agg.mark_bootstrap_ready();

        source.set_tools("alpha", &["echo", "hidden"]);
        source.set_live("alpha", true);
        agg.refresh_spec(&SpecKey::new("alpha"), IndexKind::Tools, false).await;
        let snapshot = agg.snapshot(IndexKind::Tools).await;
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.resolve("alpha__echo").is_some());
    }
}
