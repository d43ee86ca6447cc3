//! Scheduler: instance acquisition, release, idle recycling, and top-up.
//!
//! The scheduler owns one [`Pool`] per enabled spec and is the only
//! component that creates or destroys instances (through the launcher seam).
//! Strategy semantics live in [`Scheduler::acquire`]; the background sweep
//! handles idle reaping, affinity eviction, draining pools, and the
//! min-ready top-up loop with exponential backoff.

mod instance;
mod pool;
#[cfg(test)]
mod tests;

pub use instance::Instance;
pub use pool::{Pool, PoolMetrics};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shoal_types::{InstanceState, PoolStatus, ServerInitStatus, StartCause};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{MetadataItems, MetadataSource};
use crate::catalog::{CatalogState, SpecKey};
use crate::config::{ServerSpec, Strategy};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus, IndexKind};
use crate::lifecycle::LifecycleManager;
use crate::logbuf::sanitize_log_text;

/// Sweep cadence for the reaper/top-up loop.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default session TTL when a stateful spec does not set one.
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Shared, swappable catalog snapshot.
pub type SharedCatalog = Arc<RwLock<Arc<CatalogState>>>;

/// Seam between the scheduler and the lifecycle manager, so scheduling
/// behavior is testable without child processes.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Launch one instance and drive it to `Ready`.
    async fn launch(
        &self,
        key: &SpecKey,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>>;

    /// Stop an instance with the given drain window.
    async fn stop(&self, instance: &Instance, drain: Duration, reason: &str);
}

#[async_trait]
impl InstanceLauncher for LifecycleManager {
    async fn launch(
        &self,
        key: &SpecKey,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>> {
        self.start_instance(key, spec, cause).await
    }

    async fn stop(&self, instance: &Instance, drain: Duration, reason: &str) {
        self.stop_instance(instance, drain, reason).await;
    }
}

/// A leased instance. Capacity is returned on drop; error handling and
/// draining finalization happen in [`Scheduler::release`].
#[derive(Debug)]
pub struct Lease {
    instance: Arc<Instance>,
    pool: Arc<Pool>,
    _gate: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl Lease {
    fn new(instance: Arc<Instance>, pool: Arc<Pool>, gate: Option<OwnedMutexGuard<()>>) -> Self {
        Self {
            instance,
            pool,
            _gate: gate,
            released: false,
        }
    }

    /// The leased instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// The connection behind the lease.
    pub fn conn(&self) -> &Arc<dyn crate::transport::Connection> {
        self.instance.conn()
    }

    /// The pool the lease came from.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.instance.end_lease();
        }
    }
}

/// The scheduler: pools, strategies, and the background sweep.
pub struct Scheduler {
    pools: RwLock<HashMap<SpecKey, Arc<Pool>>>,
    launcher: Arc<dyn InstanceLauncher>,
    catalog: SharedCatalog,
    events: EventBus,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler over the shared catalog.
    pub fn new(
        launcher: Arc<dyn InstanceLauncher>,
        catalog: SharedCatalog,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            launcher,
            catalog,
            events,
            cancel,
        }
    }

    fn catalog_snapshot(&self) -> Arc<CatalogState> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Resolve a spec for routing; disabled specs are indistinguishable from
    /// missing ones.
    fn resolve_spec(&self, key: &SpecKey) -> CoreResult<Arc<ServerSpec>> {
        let catalog = self.catalog_snapshot();
        let spec = catalog
            .get(key)
            .ok_or_else(|| CoreError::not_found(format!("spec '{key}'")))?;
        if !CatalogState::is_enabled(spec) {
            return Err(CoreError::not_found(format!("spec '{key}'")));
        }
        Ok(Arc::clone(spec))
    }

    /// Get or create the pool for a spec.
    pub fn ensure_pool(&self, key: &SpecKey) -> CoreResult<Arc<Pool>> {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Ok(Arc::clone(pool));
        }
        let spec = self.resolve_spec(key)?;
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        let pool = pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Pool::new(key.clone(), spec)));
        Ok(Arc::clone(pool))
    }

    fn get_pool(&self, key: &SpecKey) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn all_pools(&self) -> Vec<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Acquire a leased instance for a request.
    pub async fn acquire(
        &self,
        key: &SpecKey,
        routing_key: Option<&str>,
        cause: StartCause,
    ) -> CoreResult<Lease> {
        let spec = self.resolve_spec(key)?;
        let pool = self.ensure_pool(key)?;
        if pool.is_draining() {
            return Err(CoreError::unavailable(format!("spec '{key}' is draining")));
        }

        match spec.strategy {
            Strategy::Stateless | Strategy::Persistent => {
                self.acquire_stateless(&pool, &spec, cause).await
            }
            Strategy::Stateful => {
                self.acquire_stateful(&pool, &spec, routing_key, cause).await
            }
            Strategy::Singleton => self.acquire_singleton(&pool, &spec, cause).await,
        }
    }

    async fn acquire_stateless(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Lease> {
        if let Some(instance) = pool.try_lease_any(false) {
            return Ok(Lease::new(instance, Arc::clone(pool), None));
        }
        let instance = self.cold_start(pool, spec, cause).await?;
        if instance.begin_lease() {
            Ok(Lease::new(instance, Arc::clone(pool), None))
        } else {
            Err(CoreError::unavailable("fresh instance refused the lease"))
        }
    }

    async fn acquire_stateful(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        routing_key: Option<&str>,
        cause: StartCause,
    ) -> CoreResult<Lease> {
        let Some(routing_key) = routing_key else {
            // No key supplied: behave statelessly but still serialize on the
            // chosen instance so per-instance ordering holds.
            return self.acquire_stateless(pool, spec, cause).await;
        };
        let ttl = spec
            .session_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TTL);

        if let Some(instance) = pool.bound_instance(routing_key, ttl) {
            let gate = instance.session_gate().lock_owned().await;
            if instance.begin_lease() {
                return Ok(Lease::new(instance, Arc::clone(pool), Some(gate)));
            }
            pool.unbind_instance(instance.id());
        }

        let instance = match pool.pick_for_binding(true) {
            Some(instance) => instance,
            None => self.cold_start(pool, spec, cause).await?,
        };
        pool.bind(routing_key, instance.id(), ttl);
        let gate = instance.session_gate().lock_owned().await;
        if instance.begin_lease() {
            Ok(Lease::new(instance, Arc::clone(pool), Some(gate)))
        } else {
            pool.unbind_instance(instance.id());
            Err(CoreError::unavailable("bound instance left rotation"))
        }
    }

    async fn acquire_singleton(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Lease> {
        let instance = match pool.any_instance() {
            Some(instance) => instance,
            None => self.cold_start(pool, spec, cause).await?,
        };
        // Concurrent acquires queue here in FIFO order; the caller's route
        // timeout bounds the wait.
        let gate = instance.session_gate().lock_owned().await;
        if instance.begin_lease() {
            Ok(Lease::new(instance, Arc::clone(pool), Some(gate)))
        } else {
            Err(CoreError::unavailable("singleton instance left rotation"))
        }
    }

    /// Perform a gated cold start. At most one runs per spec; a second
    /// caller fails fast with a busy error rather than queueing.
    async fn cold_start(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>> {
        let Ok(_guard) = pool.cold_start.clone().try_lock_owned() else {
            return Err(CoreError::busy(format!(
                "spec '{}' is saturated and a cold start is already in flight",
                pool.key()
            )));
        };

        // Capacity may have appeared while we raced for the gate.
        if let Some(instance) = pool.pick_for_binding(false) {
            return Ok(instance);
        }

        let cap = pool.soft_cap(self.catalog_snapshot().runtime().target_utilization_factor);
        if pool.total() >= cap {
            return Err(CoreError::busy(format!(
                "spec '{}' is at its soft cap of {cap} instances",
                pool.key()
            )));
        }
        if spec.strategy == Strategy::Singleton && pool.total() >= 1 {
            return Err(CoreError::busy(format!(
                "singleton spec '{}' already has an instance",
                pool.key()
            )));
        }

        self.launch_into(pool, spec, cause).await
    }

    /// Launch an instance and insert it into the pool.
    async fn launch_into(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>> {
        pool.launching.fetch_add(1, Ordering::Relaxed);
        let result = self.launcher.launch(pool.key(), spec, cause).await;
        pool.launching.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(instance) => {
                pool.insert(Arc::clone(&instance));
                self.events.publish(CoreEvent::InstanceStarted {
                    spec: pool.key().clone(),
                    instance_id: instance.id(),
                });
                info!(spec = %pool.key(), id = %instance.id(), cause = instance.start_cause().tag(), "instance ready");
                Ok(instance)
            }
            Err(err) => {
                warn!(spec = %pool.key(), error = %err, "instance launch failed");
                Err(err)
            }
        }
    }

    /// Release a lease, recording transport failures.
    ///
    /// A connection-loss error removes the instance from rotation and stops
    /// it; the router then retries on a fresh instance for non-stateful
    /// strategies.
    pub fn release(&self, mut lease: Lease, error: Option<&CoreError>) {
        lease.instance.end_lease();
        lease.released = true;

        let failed = matches!(error, Some(CoreError::ConnectionClosed { .. }));
        if failed {
            self.remove_instance(&lease.pool, &lease.instance, true, "connection lost");
        } else if lease.pool.is_draining() && lease.instance.busy_count() == 0 {
            self.remove_instance(&lease.pool, &lease.instance, false, "pool draining");
        }
    }

    /// Mark an instance failed and remove it from rotation immediately.
    pub fn mark_failed(&self, key: &SpecKey, instance: &Arc<Instance>, reason: &str) {
        if let Some(pool) = self.get_pool(key) {
            self.remove_instance(&pool, instance, true, reason);
        }
    }

    fn remove_instance(&self, pool: &Arc<Pool>, instance: &Arc<Instance>, failed: bool, reason: &str) {
        if pool.remove(instance.id()).is_none() {
            return;
        }
        pool.unbind_instance(instance.id());
        if failed {
            instance.set_state(InstanceState::Failed);
        }
        let drain = Duration::from_secs(pool.spec().drain_timeout_seconds);
        let launcher = Arc::clone(&self.launcher);
        let instance = Arc::clone(instance);
        let reason = reason.to_string();
        let events = self.events.clone();
        let spec = pool.key().clone();
        tokio::spawn(async move {
            launcher.stop(&instance, drain, &reason).await;
            events.publish(CoreEvent::InstanceStopped {
                spec,
                instance_id: instance.id(),
                failed,
            });
        });
    }

    /// Status snapshot for one pool.
    pub fn pool_status(&self, key: &SpecKey) -> Option<PoolStatus> {
        self.get_pool(key).map(|pool| pool.status())
    }

    /// Status snapshots for every pool.
    pub fn all_pool_statuses(&self) -> Vec<PoolStatus> {
        self.all_pools().iter().map(|p| p.status()).collect()
    }

    /// Init statuses for every pool.
    pub fn all_init_statuses(&self) -> Vec<ServerInitStatus> {
        self.all_pools().iter().map(|p| p.init_status()).collect()
    }

    /// Whether a spec currently has a leasable instance.
    pub fn has_live_instance(&self, key: &SpecKey) -> bool {
        self.get_pool(key).is_some_and(|pool| pool.live_count() > 0)
    }

    /// Warm a spec up to its keep-warm floor, sequentially. Used by
    /// bootstrap and after reload.
    pub async fn warm_spec(&self, key: &SpecKey, cause: StartCause) -> CoreResult<()> {
        let spec = self.resolve_spec(key)?;
        let pool = self.ensure_pool(key)?;
        let floor = spec.keep_warm_floor() as usize;
        while pool.live_count() < floor {
            if pool.is_draining() || self.cancel.is_cancelled() {
                break;
            }
            self.launch_into(&pool, &spec, cause.clone()).await?;
        }
        Ok(())
    }

    /// Begin draining a removed spec: stop idle instances now, leave busy
    /// ones to finish, destroy the pool once empty.
    pub fn drain_spec(&self, key: &SpecKey) {
        let Some(pool) = self.get_pool(key) else {
            return;
        };
        info!(spec = %key, "draining pool");
        pool.set_draining();
        for instance in pool.status().instances {
            if let Some(live) = pool.get(instance.instance_id) {
                if live.try_retire() {
                    self.remove_instance(&pool, &live, false, "spec removed");
                }
            }
        }
    }

    /// All Ready instances, for the liveness probe.
    pub fn probe_targets(&self) -> Vec<(SpecKey, Arc<Instance>)> {
        let mut out = Vec::new();
        for pool in self.all_pools() {
            if pool.is_draining() {
                continue;
            }
            for row in pool.status().instances {
                if row.state == InstanceState::Ready {
                    if let Some(instance) = pool.get(row.instance_id) {
                        out.push((pool.key().clone(), instance));
                    }
                }
            }
        }
        out
    }

    /// Record a heartbeat on a probed instance.
    pub fn mark_heartbeat(&self, instance: &Arc<Instance>) {
        instance.mark_heartbeat();
    }

    /// Replace a pool wholesale for a `recreate` reload: the old pool drains
    /// outside the map while a fresh one takes over the key on next use.
    pub fn recreate_spec(&self, key: &SpecKey) {
        let old = self
            .pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        let Some(pool) = old else {
            return;
        };
        info!(spec = %key, "recreating pool");
        pool.set_draining();
        for row in pool.status().instances {
            if let Some(instance) = pool.get(row.instance_id) {
                if instance.try_retire() {
                    self.remove_instance(&pool, &instance, false, "spec recreated");
                }
            }
        }
        // Busy instances finish their in-flight calls; release() sees the
        // draining flag and finalizes them.
    }

    /// Apply an in-place spec update to a live pool.
    pub fn update_spec_in_place(&self, key: &SpecKey, spec: Arc<ServerSpec>) {
        if let Some(pool) = self.get_pool(key) {
            pool.set_spec(spec);
        }
    }

    /// Drain every pool and wait until in-flight work completes or the
    /// per-spec drain window elapses.
    pub async fn shutdown(&self) {
        let pools = self.all_pools();
        for pool in &pools {
            pool.set_draining();
        }
        for pool in pools {
            let drain = Duration::from_secs(pool.spec().drain_timeout_seconds);
            let deadline = Instant::now() + drain;
            loop {
                let instances = pool.status().instances;
                if instances.is_empty() {
                    break;
                }
                let mut stopped_any = false;
                for row in &instances {
                    if let Some(instance) = pool.get(row.instance_id) {
                        if instance.busy_count() == 0 || Instant::now() >= deadline {
                            pool.remove(instance.id());
                            self.launcher
                                .stop(&instance, Duration::from_secs(1), "shutdown")
                                .await;
                            stopped_any = true;
                        }
                    }
                }
                if !stopped_any && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                } else if Instant::now() >= deadline && !stopped_any {
                    break;
                }
            }
        }
    }

    /// Spawn the background sweep (idle reap, affinity eviction, draining
    /// finalization, min-ready top-up).
    pub fn spawn_workers(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => scheduler.sweep().await,
                }
            }
            debug!("scheduler sweep stopped");
        });
    }

    /// One pass of the background sweep.
    pub async fn sweep(&self) {
        let runtime = self.catalog_snapshot().runtime().clone();
        for pool in self.all_pools() {
            let spec = pool.spec();

            if pool.is_draining() {
                self.finalize_draining(&pool);
                continue;
            }

            pool.sweep_bindings();

            for instance in
                pool.idle_candidates(spec.idle_seconds, spec.keep_warm_floor() as usize)
            {
                if instance.try_retire() {
                    debug!(spec = %pool.key(), id = %instance.id(), "reaping idle instance");
                    self.remove_instance(&pool, &instance, false, "idle recycle");
                }
            }

            self.top_up(&pool, &spec, &runtime).await;
        }
    }

    fn finalize_draining(&self, pool: &Arc<Pool>) {
        for row in pool.status().instances {
            if let Some(instance) = pool.get(row.instance_id) {
                if instance.busy_count() == 0 {
                    self.remove_instance(pool, &instance, false, "pool draining");
                }
            }
        }
        if pool.total() == 0 {
            let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
            if pools
                .get(pool.key())
                .is_some_and(|p| Arc::ptr_eq(p, pool))
            {
                pools.remove(pool.key());
                info!(spec = %pool.key(), "pool destroyed");
            }
        }
    }

    /// Keep the warm floor populated, with exponential backoff between
    /// failed attempts and a retry cap.
    async fn top_up(
        &self,
        pool: &Arc<Pool>,
        spec: &Arc<ServerSpec>,
        runtime: &Arc<crate::config::RuntimeConfig>,
    ) {
        let floor = spec.keep_warm_floor() as usize;
        let live = pool.live_count() + pool.launching.load(Ordering::Relaxed) as usize;
        if floor == 0 || live >= floor {
            return;
        }
        {
            let init = pool.init.lock().unwrap_or_else(|e| e.into_inner());
            if init.attempts > runtime.server_init_max_retries {
                return;
            }
            if let Some(next) = init.next_retry {
                if next > Instant::now() {
                    return;
                }
            }
        }
        let Ok(_guard) = pool.cold_start.clone().try_lock_owned() else {
            return;
        };

        let cause = match spec.activation() {
            crate::config::ActivationMode::AlwaysOn => StartCause::PolicyAlwaysOn,
            _ => StartCause::PolicyMinReady,
        };
        match self.launch_into(pool, spec, cause).await {
            Ok(_) => {
                let mut init = pool.init.lock().unwrap_or_else(|e| e.into_inner());
                init.attempts = 0;
                init.last_error = None;
                init.next_retry = None;
                init.next_retry_wall = None;
                drop(init);
                self.events.publish(CoreEvent::ServerInit(pool.init_status()));
            }
            Err(err) => {
                let mut init = pool.init.lock().unwrap_or_else(|e| e.into_inner());
                init.attempts += 1;
                init.last_error = Some(sanitize_log_text(&err.to_string()));
                let backoff = runtime
                    .server_init_retry_base_seconds
                    .saturating_mul(1u64 << (init.attempts.saturating_sub(1)).min(16))
                    .min(runtime.server_init_retry_max_seconds);
                if init.attempts > runtime.server_init_max_retries {
                    init.next_retry = None;
                    init.next_retry_wall = None;
                } else {
                    init.next_retry = Some(Instant::now() + Duration::from_secs(backoff));
                    init.next_retry_wall =
                        Some(chrono::Utc::now() + chrono::Duration::seconds(backoff as i64));
                }
                drop(init);
                self.events.publish(CoreEvent::ServerInit(pool.init_status()));
            }
        }
    }
}

#[async_trait]
impl MetadataSource for Scheduler {
    async fn fetch(&self, key: &SpecKey, kind: IndexKind) -> CoreResult<MetadataItems> {
        let lease = self.acquire(key, None, StartCause::Bootstrap).await?;
        let result = match kind {
            IndexKind::Tools => lease.conn().list_tools().await.map(MetadataItems::Tools),
            IndexKind::Resources => lease
                .conn()
                .list_resources()
                .await
                .map(MetadataItems::Resources),
            IndexKind::Prompts => lease
                .conn()
                .list_prompts()
                .await
                .map(MetadataItems::Prompts),
        };
        match result {
            Ok(items) => {
                self.release(lease, None);
                Ok(items)
            }
            Err(err) => {
                let err: CoreError = err.into();
                self.release(lease, Some(&err));
                Err(err)
            }
        }
    }

    fn has_live_instance(&self, key: &SpecKey) -> bool {
        Scheduler::has_live_instance(self, key)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pools", &self.all_pools().len())
            .finish_non_exhaustive()
    }
}
