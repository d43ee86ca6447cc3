//! Liveness probe: periodic ping of ready instances.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::scheduler::{Scheduler, SharedCatalog};

/// Periodic prober; unresponsive instances are failed out of rotation.
pub struct Probe {
    scheduler: Arc<Scheduler>,
    catalog: SharedCatalog,
    cancel: CancellationToken,
}

impl Probe {
    /// Create a probe over the scheduler.
    pub fn new(
        scheduler: Arc<Scheduler>,
        catalog: SharedCatalog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            catalog,
            cancel,
        }
    }

    /// One probe pass: ping every ready instance.
    pub async fn sweep(&self) {
        for (key, instance) in self.scheduler.probe_targets() {
            match instance.conn().ping().await {
                Ok(()) => self.scheduler.mark_heartbeat(&instance),
                Err(err) => {
                    warn!(spec = %key, id = %instance.id(), error = %err, "probe failed");
                    self.scheduler.mark_failed(&key, &instance, "probe failed");
                }
            }
        }
    }

    /// Spawn the probe loop. A zero interval disables probing.
    pub fn spawn_workers(self: Arc<Self>) {
        let interval = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .runtime()
            .ping_interval_seconds;
        if interval == 0 {
            debug!("liveness probe disabled");
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }
        });
    }
}
