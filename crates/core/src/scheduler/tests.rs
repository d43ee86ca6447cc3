//! Scheduler behavior tests against a scripted launcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use shoal_types::{InstanceState, StartCause};
use tokio_util::sync::CancellationToken;

use super::{Instance, InstanceLauncher, Scheduler, SharedCatalog};
use crate::catalog::{CatalogState, SpecKey};
use crate::config::{ServerSpec, ShoalConfig};
use crate::error::{CoreError, CoreResult};
use crate::transport::testing::ScriptedConnection;

/// Launcher that fabricates ready instances over scripted connections.
struct FakeLauncher {
    launches: AtomicU64,
    fail_next: std::sync::Mutex<u32>,
}

impl FakeLauncher {
    fn new() -> Self {
        Self {
            launches: AtomicU64::new(0),
            fail_next: std::sync::Mutex::new(0),
        }
    }

    fn fail_times(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }
}

#[async_trait]
impl InstanceLauncher for FakeLauncher {
    async fn launch(
        &self,
        key: &SpecKey,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>> {
        {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(CoreError::unavailable("scripted launch failure"));
            }
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(Instance::new(
            key.clone(),
            Arc::new(ScriptedConnection::with_tools(&["echo"])),
            cause,
            spec.max_concurrent,
        ));
        instance.set_state(InstanceState::Ready);
        Ok(instance)
    }

    async fn stop(&self, instance: &Instance, _drain: Duration, _reason: &str) {
        let _ = instance.conn().close().await;
    }
}

fn catalog_for(yaml: &str) -> SharedCatalog {
    let config: ShoalConfig = serde_yaml::from_str(yaml).unwrap();
    crate::config::validate_config(&config).unwrap();
    Arc::new(RwLock::new(Arc::new(CatalogState::from_config(config))))
}

fn scheduler_with(yaml: &str) -> (Arc<Scheduler>, Arc<FakeLauncher>) {
    let launcher = Arc::new(FakeLauncher::new());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&launcher) as Arc<dyn InstanceLauncher>,
        catalog_for(yaml),
        crate::events::EventBus::new(),
        CancellationToken::new(),
    ));
    (scheduler, launcher)
}

const ALPHA: &str = r#"
servers:
  - name: alpha
    transport: stdio
    cmd: ["node", "echo.js"]
    maxConcurrent: 2
    idleSeconds: 60
"#;

#[tokio::test]
async fn cold_start_then_reuse() {
    let (scheduler, launcher) = scheduler_with(ALPHA);
    let key = SpecKey::new("alpha");

    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    let first_id = lease.instance().id();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    scheduler.release(lease, None);

    let status = scheduler.pool_status(&key).unwrap();
    assert_eq!(status.ready, 1);
    assert_eq!(status.busy, 0);

    // Second acquire reuses the same instance without a new spawn.
    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    assert_eq!(lease.instance().id(), first_id);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    scheduler.release(lease, None);
}

#[tokio::test]
async fn busy_count_never_exceeds_max_concurrent() {
    let (scheduler, _) = scheduler_with(ALPHA);
    let key = SpecKey::new("alpha");

    let l1 = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    let l2 = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    for lease in [&l1, &l2] {
        assert!(lease.instance().busy_count() <= 2);
    }

    let status = scheduler.pool_status(&key).unwrap();
    assert_eq!(
        status.ready + status.busy + status.starting + status.initializing
            + status.handshaking + status.draining + status.failed,
        status.total
    );
    scheduler.release(l1, None);
    scheduler.release(l2, None);
}

#[tokio::test]
async fn saturated_pool_fails_fast_with_busy() {
    let yaml = r#"
servers:
  - name: solo
    transport: stdio
    cmd: ["true"]
    maxConcurrent: 1
"#;
    let (scheduler, _) = scheduler_with(yaml);
    let key = SpecKey::new("solo");

    let l1 = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    // Soft cap is 1 instance; a second acquire cannot launch and must not
    // queue.
    let err = scheduler
        .acquire(&key, None, StartCause::Bootstrap)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ResourceExhausted { .. }));
    scheduler.release(l1, None);
}

#[tokio::test]
async fn disabled_spec_is_not_found() {
    let yaml = r#"
servers:
  - name: ghost
    transport: stdio
    cmd: ["true"]
    activationMode: disabled
"#;
    let (scheduler, _) = scheduler_with(yaml);
    let err = scheduler
        .acquire(&SpecKey::new("ghost"), None, StartCause::Bootstrap)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn stateful_affinity_pins_and_separates_keys() {
    let yaml = r#"
servers:
  - name: gamma
    transport: stdio
    cmd: ["true"]
    maxConcurrent: 1
    strategy: stateful
    sessionTtlSeconds: 10
"#;
    let (scheduler, _) = scheduler_with(yaml);
    let key = SpecKey::new("gamma");

    let l1 = scheduler.acquire(&key, Some("K1"), StartCause::Bootstrap).await.unwrap();
    let id_k1 = l1.instance().id();
    scheduler.release(l1, None);

    let l2 = scheduler.acquire(&key, Some("K1"), StartCause::Bootstrap).await.unwrap();
    assert_eq!(l2.instance().id(), id_k1, "same routing key, same instance");
    scheduler.release(l2, None);

    let l3 = scheduler.acquire(&key, Some("K2"), StartCause::Bootstrap).await.unwrap();
    assert_ne!(l3.instance().id(), id_k1, "fresh key avoids the bound instance");
    scheduler.release(l3, None);
}

#[tokio::test]
async fn stateful_connection_loss_surfaces_unavailable_not_retry() {
    let yaml = r#"
servers:
  - name: gamma
    transport: stdio
    cmd: ["true"]
    strategy: stateful
    sessionTtlSeconds: 10
"#;
    let (scheduler, _) = scheduler_with(yaml);
    let key = SpecKey::new("gamma");

    let lease = scheduler.acquire(&key, Some("K1"), StartCause::Bootstrap).await.unwrap();
    let instance = Arc::clone(lease.instance());
    let err = CoreError::ConnectionClosed {
        message: "pipe".into(),
    };
    scheduler.release(lease, Some(&err));
    tokio::task::yield_now().await;

    assert_eq!(instance.state(), InstanceState::Failed);
    // The binding is gone with the instance; the next acquire gets a fresh
    // one rather than the dead binding.
    let lease = scheduler.acquire(&key, Some("K1"), StartCause::Bootstrap).await.unwrap();
    assert_ne!(lease.instance().id(), instance.id());
    scheduler.release(lease, None);
}

#[tokio::test]
async fn singleton_serializes_fifo() {
    let yaml = r#"
servers:
  - name: one
    transport: stdio
    cmd: ["true"]
    strategy: singleton
"#;
    let (scheduler, launcher) = scheduler_with(yaml);
    let key = SpecKey::new("one");

    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    let id = lease.instance().id();

    let scheduler2 = Arc::clone(&scheduler);
    let key2 = key.clone();
    let waiter = tokio::spawn(async move {
        let lease = scheduler2.acquire(&key2, None, StartCause::Bootstrap).await.unwrap();
        let id = lease.instance().id();
        scheduler2.release(lease, None);
        id
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "second acquire queues behind the first");

    scheduler.release(lease, None);
    let second_id = waiter.await.unwrap();
    assert_eq!(second_id, id, "singleton never grows past one instance");
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_instances_are_reaped_to_zero() {
    let yaml = r#"
servers:
  - name: alpha
    transport: stdio
    cmd: ["true"]
    idleSeconds: 0
"#;
    let (scheduler, _) = scheduler_with(yaml);
    let key = SpecKey::new("alpha");

    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    scheduler.release(lease, None);
    assert_eq!(scheduler.pool_status(&key).unwrap().total, 1);

    scheduler.sweep().await;
    tokio::task::yield_now().await;
    let status = scheduler.pool_status(&key).unwrap();
    assert_eq!(status.ready, 0, "true scale-to-zero");
}

#[tokio::test]
async fn min_ready_is_topped_up_with_backoff() {
    let yaml = r#"
servers:
  - name: beta
    transport: stdio
    cmd: ["true"]
    activationMode: always-on
    minReady: 2
    maxConcurrent: 4
"#;
    let (scheduler, launcher) = scheduler_with(yaml);
    let key = SpecKey::new("beta");
    scheduler.ensure_pool(&key).unwrap();

    // Two sweeps top up to the floor (one cold start per sweep).
    scheduler.sweep().await;
    scheduler.sweep().await;
    assert_eq!(scheduler.pool_status(&key).unwrap().ready, 2);

    // Kill one instance externally; the loop replaces it.
    let status = scheduler.pool_status(&key).unwrap();
    let victim = scheduler
        .probe_targets()
        .into_iter()
        .find(|(k, _)| k == &key)
        .map(|(_, i)| i)
        .unwrap();
    scheduler.mark_failed(&key, &victim, "killed externally");
    tokio::task::yield_now().await;
    assert!(scheduler.pool_status(&key).unwrap().ready < status.ready);

    scheduler.sweep().await;
    assert_eq!(scheduler.pool_status(&key).unwrap().ready, 2);
    assert!(launcher.launches.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn launch_failures_back_off_and_report() {
    let yaml = r#"
servers:
  - name: beta
    transport: stdio
    cmd: ["true"]
    minReady: 1
"#;
    let (scheduler, launcher) = scheduler_with(yaml);
    let key = SpecKey::new("beta");
    scheduler.ensure_pool(&key).unwrap();
    launcher.fail_times(1);

    scheduler.sweep().await;
    let init = scheduler
        .all_init_statuses()
        .into_iter()
        .find(|s| s.spec_key == "beta")
        .unwrap();
    assert_eq!(init.attempts, 1);
    assert!(init.last_error.is_some());
    assert!(init.next_retry_at.is_some());

    // Within the backoff window the loop does not retry.
    scheduler.sweep().await;
    assert_eq!(scheduler.pool_status(&key).unwrap().ready, 0);
}

#[tokio::test]
async fn draining_spec_stops_everything() {
    let (scheduler, _) = scheduler_with(ALPHA);
    let key = SpecKey::new("alpha");

    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    scheduler.release(lease, None);
    scheduler.drain_spec(&key);
    tokio::task::yield_now().await;
    scheduler.sweep().await;
    tokio::task::yield_now().await;

    assert!(scheduler.pool_status(&key).is_none() || scheduler.pool_status(&key).unwrap().total == 0);
}

#[tokio::test]
async fn in_flight_lease_survives_drain() {
    let (scheduler, _) = scheduler_with(ALPHA);
    let key = SpecKey::new("alpha");

    let lease = scheduler.acquire(&key, None, StartCause::Bootstrap).await.unwrap();
    scheduler.drain_spec(&key);

    // The in-flight call still works against its instance.
    let result = lease
        .conn()
        .call_tool(rmcp::model::CallToolRequestParams {
            name: "echo".to_string().into(),
            arguments: None,
            task: None,
            meta: None,
        })
        .await;
    assert!(result.is_ok());
    scheduler.release(lease, None);
}
