//! Bootstrap: initial warm-up and metadata priming.
//!
//! Runs at startup and after reloads that add warm specs. Warms every spec
//! with a keep-warm floor, primes metadata for every enabled spec (so the
//! first `tools/list` sees on-demand specs too), and reports per-spec
//! readiness. The aggregator's first snapshot blocks on this unless
//! `bootstrap_mode = none`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_types::StartCause;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::catalog::{CatalogState, SpecKey};
use crate::config::BootstrapMode;
use crate::events::IndexKind;
use crate::logbuf::sanitize_log_text;
use crate::scheduler::{Scheduler, SharedCatalog};

/// Outcome of one bootstrap run.
#[derive(Debug, Default)]
pub struct BootstrapReport {
    /// Specs warmed to their floor.
    pub warmed: Vec<SpecKey>,
    /// Specs whose warm-up failed, with the sanitized error.
    pub failed: Vec<(SpecKey, String)>,
    /// Wall time spent.
    pub elapsed: Duration,
}

/// Drive the bootstrap phase.
pub async fn run(
    scheduler: &Arc<Scheduler>,
    aggregator: &Arc<Aggregator>,
    catalog: &SharedCatalog,
) -> BootstrapReport {
    let started = Instant::now();
    let snapshot: Arc<CatalogState> =
        Arc::clone(&catalog.read().unwrap_or_else(|e| e.into_inner()));
    let runtime = snapshot.runtime().clone();

    if runtime.bootstrap_mode == BootstrapMode::None {
        aggregator.mark_bootstrap_ready();
    }

    let budget = Duration::from_secs(runtime.bootstrap_timeout_seconds.max(1));
    let outcome = timeout(budget, async move {
        let mut report = BootstrapReport::default();
        let semaphore = Arc::new(Semaphore::new(runtime.bootstrap_concurrency.max(1)));
        let mut handles = Vec::new();

        for key in snapshot.warm_keys() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let scheduler = Arc::clone(scheduler);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = scheduler.warm_spec(&key, StartCause::Bootstrap).await;
                (key, result)
            }));
        }
        for handle in handles {
            if let Ok((key, result)) = handle.await {
                match result {
                    Ok(()) => report.warmed.push(key),
                    Err(err) => {
                        warn!(spec = %key, error = %err, "bootstrap warm-up failed");
                        report
                            .failed
                            .push((key, sanitize_log_text(&err.to_string())));
                    }
                }
            }
        }

        // Metadata priming covers every enabled spec; on-demand specs cold
        // start once here and idle out afterwards. Kinds are fetched
        // sequentially per spec so priming never needs a second instance.
        let mut handles = Vec::new();
        for key in snapshot.enabled_keys() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let aggregator = Arc::clone(aggregator);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                for kind in IndexKind::ALL {
                    aggregator.refresh_spec(&key, kind, false).await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        report
    })
    .await;

    let mut report = match outcome {
        Ok(report) => report,
        Err(_) => {
            warn!("bootstrap budget elapsed; continuing with partial readiness");
            BootstrapReport::default()
        }
    };
    aggregator.mark_bootstrap_ready();
    report.elapsed = started.elapsed();
    info!(
        warmed = report.warmed.len(),
        failed = report.failed.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "bootstrap complete"
    );
    report
}
