//! Per-spec instance pool: bookkeeping, affinity, metrics, backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use shoal_types::{InstanceState, PoolStatus, ServerInitState, ServerInitStatus};
use uuid::Uuid;

use super::instance::Instance;
use crate::catalog::SpecKey;
use crate::config::ServerSpec;

/// Affinity binding for the stateful strategy.
#[derive(Debug, Clone)]
struct Binding {
    instance_id: Uuid,
    expires_at: Instant,
}

/// Rolling pool counters. All atomic; no lock spans an I/O call.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub starts: AtomicU64,
    pub stops: AtomicU64,
    pub total_calls: AtomicU64,
    pub total_errors: AtomicU64,
    pub total_duration_ms: AtomicU64,
    last_call_at: Mutex<Option<DateTime<Utc>>>,
}

impl PoolMetrics {
    fn record_call(&self, duration: Duration, is_error: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        *self.last_call_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }
}

/// Spawn backoff state driven by the top-up loop.
#[derive(Debug, Default)]
pub(crate) struct InitBackoff {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry: Option<Instant>,
    pub next_retry_wall: Option<DateTime<Utc>>,
}

/// The scheduler's bookkeeping object for all instances of one spec.
pub struct Pool {
    key: SpecKey,
    spec: RwLock<Arc<ServerSpec>>,
    instances: Mutex<Vec<Arc<Instance>>>,
    /// Held while a cold start for this spec is in flight; at most one.
    pub(crate) cold_start: Arc<tokio::sync::Mutex<()>>,
    /// Launches in flight, surfaced as the `starting` count.
    pub(crate) launching: AtomicU64,
    affinity: Mutex<HashMap<String, Binding>>,
    pub(crate) metrics: PoolMetrics,
    pub(crate) init: Mutex<InitBackoff>,
    draining: AtomicBool,
}

impl Pool {
    /// Create an empty pool for a spec.
    pub fn new(key: SpecKey, spec: Arc<ServerSpec>) -> Self {
        Self {
            key,
            spec: RwLock::new(spec),
            instances: Mutex::new(Vec::new()),
            cold_start: Arc::new(tokio::sync::Mutex::new(())),
            launching: AtomicU64::new(0),
            affinity: Mutex::new(HashMap::new()),
            metrics: PoolMetrics::default(),
            init: Mutex::new(InitBackoff::default()),
            draining: AtomicBool::new(false),
        }
    }

    /// Spec key this pool serves.
    pub fn key(&self) -> &SpecKey {
        &self.key
    }

    /// Current spec (replaced by in-place reload).
    pub fn spec(&self) -> Arc<ServerSpec> {
        Arc::clone(&self.spec.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the spec in place (reload of tunables).
    pub fn set_spec(&self, spec: Arc<ServerSpec>) {
        *self.spec.write().unwrap_or_else(|e| e.into_inner()) = spec;
    }

    /// Mark the pool as draining: no new leases or cold starts.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Whether the pool is draining toward destruction.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of instances in any state.
    pub fn total(&self) -> usize {
        self.lock_instances().len()
    }

    /// Number of instances counted as live capacity (ready or busy).
    pub fn live_count(&self) -> usize {
        self.lock_instances()
            .iter()
            .filter(|i| i.state().is_leasable())
            .count()
    }

    /// Count of ready instances.
    pub fn ready_count(&self) -> usize {
        self.lock_instances()
            .iter()
            .filter(|i| i.state() == InstanceState::Ready)
            .count()
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Instance>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Soft cap on pool size:
    /// `max(min_ready, ceil(max_concurrent * factor))`, never below 1.
    pub fn soft_cap(&self, utilization_factor: f64) -> usize {
        let spec = self.spec();
        let by_util = ((spec.max_concurrent as f64) * utilization_factor).ceil() as usize;
        by_util.max(spec.min_ready as usize).max(1)
    }

    /// Insert a freshly started instance.
    pub fn insert(&self, instance: Arc<Instance>) {
        self.metrics.starts.fetch_add(1, Ordering::Relaxed);
        self.lock_instances().push(instance);
    }

    /// Remove an instance from rotation, returning it if present.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Instance>> {
        let mut instances = self.lock_instances();
        let pos = instances.iter().position(|i| i.id() == id)?;
        self.metrics.stops.fetch_add(1, Ordering::Relaxed);
        Some(instances.swap_remove(pos))
    }

    /// Take the first instance with spare capacity, preferring ones without
    /// a live affinity binding so fresh stateful keys land on their own
    /// instance when capacity allows.
    pub fn try_lease_any(&self, avoid_bound: bool) -> Option<Arc<Instance>> {
        if self.is_draining() {
            return None;
        }
        let bound: Vec<Uuid> = if avoid_bound {
            self.live_bound_instances()
        } else {
            Vec::new()
        };
        let instances = self.lock_instances();
        let mut fallback: Option<&Arc<Instance>> = None;
        for instance in instances.iter() {
            if !instance.has_capacity() {
                continue;
            }
            if bound.contains(&instance.id()) {
                fallback.get_or_insert(instance);
                continue;
            }
            if instance.begin_lease() {
                return Some(Arc::clone(instance));
            }
        }
        if let Some(instance) = fallback {
            if instance.begin_lease() {
                return Some(Arc::clone(instance));
            }
        }
        None
    }

    /// Pick an instance with spare capacity without taking a lease, for the
    /// stateful bind-then-serialize path.
    pub fn pick_for_binding(&self, avoid_bound: bool) -> Option<Arc<Instance>> {
        if self.is_draining() {
            return None;
        }
        let bound = if avoid_bound {
            self.live_bound_instances()
        } else {
            Vec::new()
        };
        let instances = self.lock_instances();
        instances
            .iter()
            .find(|i| i.has_capacity() && !bound.contains(&i.id()))
            .or_else(|| instances.iter().find(|i| i.has_capacity()))
            .cloned()
    }

    /// Find a live instance by id.
    pub fn get(&self, id: Uuid) -> Option<Arc<Instance>> {
        self.lock_instances()
            .iter()
            .find(|i| i.id() == id)
            .cloned()
    }

    /// Any instance regardless of state (singleton pools hold at most one).
    pub fn any_instance(&self) -> Option<Arc<Instance>> {
        self.lock_instances()
            .iter()
            .find(|i| !i.state().is_terminal())
            .cloned()
    }

    /// Instances whose state makes them ready-for-reaping candidates.
    pub fn idle_candidates(&self, idle_seconds: u64, keep_floor: usize) -> Vec<Arc<Instance>> {
        let spec = self.spec();
        if spec.idle_exempt() {
            return Vec::new();
        }
        let ready: Vec<Arc<Instance>> = self
            .lock_instances()
            .iter()
            .filter(|i| i.state() == InstanceState::Ready && i.busy_count() == 0)
            .cloned()
            .collect();
        let mut surplus = ready.len().saturating_sub(keep_floor);
        let mut out = Vec::new();
        for instance in ready {
            if surplus == 0 {
                break;
            }
            if instance.idle_for_secs() >= idle_seconds {
                surplus -= 1;
                out.push(instance);
            }
        }
        out
    }

    /// Record a routed call's outcome into the rolling metrics.
    pub fn record_call(&self, duration: Duration, is_error: bool) {
        self.metrics.record_call(duration, is_error);
    }

    // ----- affinity -----

    /// Resolve a routing key to its bound instance, refreshing the TTL.
    pub fn bound_instance(&self, routing_key: &str, ttl: Duration) -> Option<Arc<Instance>> {
        let mut affinity = self.affinity.lock().unwrap_or_else(|e| e.into_inner());
        let binding = affinity.get_mut(routing_key)?;
        if binding.expires_at <= Instant::now() {
            affinity.remove(routing_key);
            return None;
        }
        let id = binding.instance_id;
        drop(affinity);

        let instance = self.get(id)?;
        if instance.state().is_terminal() {
            self.unbind_instance(id);
            return None;
        }
        self.refresh_binding(routing_key, ttl);
        Some(instance)
    }

    /// Bind a routing key to an instance.
    pub fn bind(&self, routing_key: &str, instance_id: Uuid, ttl: Duration) {
        let mut affinity = self.affinity.lock().unwrap_or_else(|e| e.into_inner());
        affinity.insert(
            routing_key.to_string(),
            Binding {
                instance_id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn refresh_binding(&self, routing_key: &str, ttl: Duration) {
        let mut affinity = self.affinity.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = affinity.get_mut(routing_key) {
            binding.expires_at = Instant::now() + ttl;
        }
    }

    /// Drop all bindings pointing at an instance.
    pub fn unbind_instance(&self, instance_id: Uuid) {
        let mut affinity = self.affinity.lock().unwrap_or_else(|e| e.into_inner());
        affinity.retain(|_, b| b.instance_id != instance_id);
    }

    /// Evict expired bindings. Returns how many were dropped.
    pub fn sweep_bindings(&self) -> usize {
        let now = Instant::now();
        let mut affinity = self.affinity.lock().unwrap_or_else(|e| e.into_inner());
        let before = affinity.len();
        affinity.retain(|_, b| b.expires_at > now);
        before - affinity.len()
    }

    fn live_bound_instances(&self) -> Vec<Uuid> {
        let now = Instant::now();
        self.affinity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.expires_at > now)
            .map(|b| b.instance_id)
            .collect()
    }

    // ----- status export -----

    /// Aggregate status snapshot.
    pub fn status(&self) -> PoolStatus {
        let instances = self.lock_instances();
        let launching = self.launching.load(Ordering::Relaxed) as u32;
        let mut status = PoolStatus {
            spec_key: self.key.to_string(),
            total: instances.len() as u32 + launching,
            starting: launching,
            ..Default::default()
        };
        for instance in instances.iter() {
            match instance.state() {
                InstanceState::Ready => status.ready += 1,
                InstanceState::Busy => status.busy += 1,
                InstanceState::Starting => status.starting += 1,
                InstanceState::Initializing => status.initializing += 1,
                InstanceState::Handshaking => status.handshaking += 1,
                InstanceState::Draining => status.draining += 1,
                InstanceState::Failed | InstanceState::Stopped => status.failed += 1,
            }
            status.instances.push(instance.status());
        }
        status.starts = self.metrics.starts.load(Ordering::Relaxed);
        status.stops = self.metrics.stops.load(Ordering::Relaxed);
        status.total_calls = self.metrics.total_calls.load(Ordering::Relaxed);
        status.total_errors = self.metrics.total_errors.load(Ordering::Relaxed);
        status.total_duration_ms = self.metrics.total_duration_ms.load(Ordering::Relaxed);
        status.last_call_at = *self
            .metrics
            .last_call_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        status
    }

    /// Current init status for `WatchServerInitStatus`.
    pub fn init_status(&self) -> ServerInitStatus {
        let init = self.init.lock().unwrap_or_else(|e| e.into_inner());
        let floor = self.spec().keep_warm_floor() as usize;
        let state = if self.ready_count() >= floor && init.last_error.is_none() {
            ServerInitState::Ready
        } else if init.attempts == 0 {
            ServerInitState::Pending
        } else if init.next_retry.is_some() {
            ServerInitState::Failed
        } else {
            ServerInitState::Starting
        };
        ServerInitStatus {
            spec_key: self.key.to_string(),
            state,
            attempts: init.attempts,
            last_error: init.last_error.clone(),
            next_retry_at: init.next_retry_wall,
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.key)
            .field("total", &self.total())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedConnection;
    use shoal_types::StartCause;

    fn pool_with(max_concurrent: u32, n: usize) -> (Pool, Vec<Uuid>) {
        let spec: Arc<ServerSpec> = Arc::new(
            serde_yaml::from_str(&format!(
                "name: alpha\ntransport: stdio\ncmd: [\"true\"]\nmaxConcurrent: {max_concurrent}\n"
            ))
            .unwrap(),
        );
        let pool = Pool::new(SpecKey::new("alpha"), spec);
        let mut ids = Vec::new();
        for _ in 0..n {
            let instance = Arc::new(Instance::new(
                SpecKey::new("alpha"),
                Arc::new(ScriptedConnection::default()),
                StartCause::Bootstrap,
                max_concurrent,
            ));
            instance.set_state(InstanceState::Ready);
            ids.push(instance.id());
            pool.insert(instance);
        }
        (pool, ids)
    }

    #[test]
    fn counts_sum_to_total() {
        let (pool, _) = pool_with(2, 3);
        let lease = pool.try_lease_any(false).unwrap();
        let status = pool.status();
        assert_eq!(
            status.ready
                + status.busy
                + status.starting
                + status.initializing
                + status.handshaking
                + status.draining
                + status.failed,
            status.total
        );
        assert_eq!(status.busy, 1);
        lease.end_lease();
    }

    #[test]
    fn draining_pool_refuses_leases() {
        let (pool, _) = pool_with(1, 1);
        pool.set_draining();
        assert!(pool.try_lease_any(false).is_none());
    }

    #[test]
    fn affinity_binding_round_trip() {
        let (pool, ids) = pool_with(1, 2);
        let ttl = Duration::from_secs(10);
        pool.bind("k1", ids[0], ttl);
        let bound = pool.bound_instance("k1", ttl).unwrap();
        assert_eq!(bound.id(), ids[0]);

        // Fresh leases avoid the bound instance while capacity allows.
        let fresh = pool.try_lease_any(true).unwrap();
        assert_ne!(fresh.id(), ids[0]);
        fresh.end_lease();
    }

    #[test]
    fn expired_bindings_are_swept() {
        let (pool, ids) = pool_with(1, 1);
        pool.bind("k1", ids[0], Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.bound_instance("k1", Duration::from_secs(1)).is_none());
        pool.bind("k2", ids[0], Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.sweep_bindings(), 1);
    }

    #[test]
    fn idle_candidates_respect_floor_and_exemption() {
        let (pool, _) = pool_with(1, 3);
        // Zero idle threshold: everything beyond the floor is a candidate.
        assert_eq!(pool.idle_candidates(0, 1).len(), 2);
        assert_eq!(pool.idle_candidates(0, 3).len(), 0);

        let mut spec = (*pool.spec()).clone();
        spec.strategy = crate::config::Strategy::Persistent;
        pool.set_spec(Arc::new(spec));
        assert!(pool.idle_candidates(0, 0).is_empty());
    }

    #[test]
    fn soft_cap_formula() {
        let (pool, _) = pool_with(2, 0);
        assert_eq!(pool.soft_cap(1.0), 2);
        assert_eq!(pool.soft_cap(2.0), 4);
        let mut spec = (*pool.spec()).clone();
        spec.min_ready = 5;
        pool.set_spec(Arc::new(spec));
        assert_eq!(pool.soft_cap(1.0), 5);
    }
}
