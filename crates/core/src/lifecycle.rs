//! Instance lifecycle: start with handshake retries, supervised stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_types::{InstanceState, StartCause};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::SpecKey;
use crate::config::validation::{HTTP_PROTOCOL_VERSIONS, STDIO_PROTOCOL_VERSIONS};
use crate::config::{ServerSpec, TransportKind};
use crate::error::{CoreError, CoreResult};
use crate::logbuf::{sanitize_log_text, LogBuffer};
use crate::scheduler::Instance;
use crate::transport::{
    handshake_http, handshake_stdio, launch_stdio, Connection, InstanceHandler, ListChangedNotice,
    RmcpConnection,
};

/// Handshake attempts per start.
const HANDSHAKE_ATTEMPTS: u32 = 3;
/// Fixed spacing between handshake attempts.
const HANDSHAKE_SPACING: Duration = Duration::from_millis(500);
/// Total budget for one start.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(30);

/// Steps of one start attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStep {
    LauncherStart,
    TransportConnect,
    InitializeCall,
    InitializeResponse,
    NotifyInitialized,
    InstanceReady,
}

impl AttemptStep {
    /// Label used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptStep::LauncherStart => "launcher_start",
            AttemptStep::TransportConnect => "transport_connect",
            AttemptStep::InitializeCall => "initialize_call",
            AttemptStep::InitializeResponse => "initialize_response",
            AttemptStep::NotifyInitialized => "notify_initialized",
            AttemptStep::InstanceReady => "instance_ready",
        }
    }
}

/// Phase of a step event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Enter,
    Exit,
    Error,
}

/// One diagnostic event within a start attempt.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    /// Identity of the start attempt this event belongs to.
    pub attempt_id: Uuid,
    /// Spec being started.
    pub spec: SpecKey,
    /// Which step.
    pub step: AttemptStep,
    /// Enter, exit, or error.
    pub phase: AttemptPhase,
    /// Error text for `Error` phases.
    pub error: Option<String>,
}

/// Observer for start diagnostics. The default logs through `tracing`.
pub trait StartObserver: Send + Sync {
    fn on_event(&self, event: &AttemptEvent);
}

/// Default observer: structured tracing output.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl StartObserver for TracingObserver {
    fn on_event(&self, event: &AttemptEvent) {
        match event.phase {
            AttemptPhase::Error => warn!(
                attempt = %event.attempt_id,
                spec = %event.spec,
                step = event.step.label(),
                error = event.error.as_deref().unwrap_or(""),
                "start step failed"
            ),
            _ => debug!(
                attempt = %event.attempt_id,
                spec = %event.spec,
                step = event.step.label(),
                phase = ?event.phase,
                "start step"
            ),
        }
    }
}

/// Drives instances from `Starting` to `Ready` and supervises shutdown.
pub struct LifecycleManager {
    notify_tx: mpsc::UnboundedSender<ListChangedNotice>,
    logs: Arc<LogBuffer>,
    observer: Arc<dyn StartObserver>,
}

impl LifecycleManager {
    /// Create a manager. List-changed notifications from every connection it
    /// establishes flow into `notify_tx`.
    pub fn new(
        notify_tx: mpsc::UnboundedSender<ListChangedNotice>,
        logs: Arc<LogBuffer>,
        observer: Arc<dyn StartObserver>,
    ) -> Self {
        Self {
            notify_tx,
            logs,
            observer,
        }
    }

    fn emit(&self, attempt_id: Uuid, spec: &SpecKey, step: AttemptStep, phase: AttemptPhase) {
        self.observer.on_event(&AttemptEvent {
            attempt_id,
            spec: spec.clone(),
            step,
            phase,
            error: None,
        });
    }

    fn emit_error(&self, attempt_id: Uuid, spec: &SpecKey, step: AttemptStep, error: &CoreError) {
        self.observer.on_event(&AttemptEvent {
            attempt_id,
            spec: spec.clone(),
            step,
            phase: AttemptPhase::Error,
            error: Some(sanitize_log_text(&error.to_string())),
        });
    }

    /// Start one instance of `spec` and drive it to `Ready`.
    ///
    /// The `initialize` handshake is retried up to three times with fixed
    /// 500ms spacing inside a 30 second ceiling. A protocol version mismatch
    /// in the `initialize` response is not retried: the negotiated version
    /// must equal the declared one.
    pub async fn start_instance(
        &self,
        key: &SpecKey,
        spec: &Arc<ServerSpec>,
        cause: StartCause,
    ) -> CoreResult<Arc<Instance>> {
        let supported = match spec.transport {
            TransportKind::Stdio => STDIO_PROTOCOL_VERSIONS,
            TransportKind::StreamableHttp => HTTP_PROTOCOL_VERSIONS,
        };
        if !supported.contains(&spec.protocol_version.as_str()) {
            return Err(CoreError::unsupported_protocol(
                &spec.protocol_version,
                spec.transport.to_string(),
            ));
        }

        let attempt_id = Uuid::new_v4();
        let deadline = Instant::now() + HANDSHAKE_DEADLINE;
        let mut last_err: Option<CoreError> = None;

        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            if Instant::now() >= deadline {
                break;
            }
            match self.try_start(attempt_id, key, spec, deadline).await {
                Ok(conn) => {
                    let instance = Arc::new(Instance::new(
                        key.clone(),
                        conn,
                        cause,
                        spec.max_concurrent,
                    ));
                    instance.set_state(InstanceState::Ready);
                    self.emit(attempt_id, key, AttemptStep::InstanceReady, AttemptPhase::Exit);
                    return Ok(instance);
                }
                Err(err @ CoreError::UnsupportedProtocol { .. }) => return Err(err),
                Err(err) => {
                    debug!(
                        spec = %key,
                        attempt,
                        error = %err,
                        "start attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < HANDSHAKE_ATTEMPTS {
                        sleep(HANDSHAKE_SPACING).await;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CoreError::deadline(format!("start of spec '{key}'"))))
    }

    /// One attempt: launch (stdio), connect + handshake, validate.
    async fn try_start(
        &self,
        attempt_id: Uuid,
        key: &SpecKey,
        spec: &Arc<ServerSpec>,
        deadline: Instant,
    ) -> CoreResult<Arc<dyn Connection>> {
        let handler =
            InstanceHandler::new(key.clone(), spec.protocol_version.clone(), self.notify_tx.clone());
        let remaining = deadline.saturating_duration_since(Instant::now());

        let connected: CoreResult<RmcpConnection> = match spec.transport {
            TransportKind::Stdio => {
                self.emit(attempt_id, key, AttemptStep::LauncherStart, AttemptPhase::Enter);
                let launch = match launch_stdio(key, spec, &self.logs) {
                    Ok(launch) => {
                        self.emit(attempt_id, key, AttemptStep::LauncherStart, AttemptPhase::Exit);
                        launch
                    }
                    Err(err) => {
                        let err: CoreError = err.into();
                        self.emit_error(attempt_id, key, AttemptStep::LauncherStart, &err);
                        return Err(err);
                    }
                };
                self.emit(attempt_id, key, AttemptStep::TransportConnect, AttemptPhase::Enter);
                self.emit(attempt_id, key, AttemptStep::InitializeCall, AttemptPhase::Enter);
                match timeout(remaining, handshake_stdio(key, handler, launch)).await {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(err)) => Err(err.into()),
                    Err(_) => Err(CoreError::deadline("initialize handshake")),
                }
            }
            TransportKind::StreamableHttp => {
                self.emit(attempt_id, key, AttemptStep::TransportConnect, AttemptPhase::Enter);
                self.emit(attempt_id, key, AttemptStep::InitializeCall, AttemptPhase::Enter);
                match timeout(remaining, handshake_http(key, spec, handler)).await {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(err)) => Err(err.into()),
                    Err(_) => Err(CoreError::deadline("initialize handshake")),
                }
            }
        };

        let conn = match connected {
            Ok(conn) => {
                self.emit(attempt_id, key, AttemptStep::InitializeCall, AttemptPhase::Exit);
                self.emit(attempt_id, key, AttemptStep::TransportConnect, AttemptPhase::Exit);
                conn
            }
            Err(err) => {
                self.emit_error(attempt_id, key, AttemptStep::InitializeCall, &err);
                return Err(err);
            }
        };

        self.emit(attempt_id, key, AttemptStep::InitializeResponse, AttemptPhase::Enter);
        if let Err(err) = self.validate_handshake(spec, &conn) {
            self.emit_error(attempt_id, key, AttemptStep::InitializeResponse, &err);
            let _ = conn.close().await;
            force_kill_group(conn.child_pid());
            return Err(err);
        }
        self.emit(attempt_id, key, AttemptStep::InitializeResponse, AttemptPhase::Exit);
        // `notifications/initialized` is emitted by the transport as the
        // final leg of the handshake that just completed.
        self.emit(attempt_id, key, AttemptStep::NotifyInitialized, AttemptPhase::Exit);

        Ok(Arc::new(conn))
    }

    fn validate_handshake(&self, spec: &ServerSpec, conn: &RmcpConnection) -> CoreResult<()> {
        let info = conn
            .server_info()
            .ok_or_else(|| CoreError::internal("handshake produced no server info"))?;
        if info.server_info.name.trim().is_empty() {
            return Err(CoreError::internal("serverInfo.name is empty"));
        }
        let negotiated = serde_json::to_value(&info.protocol_version)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        if negotiated != spec.protocol_version {
            return Err(CoreError::unsupported_protocol(
                negotiated,
                spec.transport.to_string(),
            ));
        }
        Ok(())
    }

    /// Stop an instance: close the connection, then force-kill the process
    /// group if the drain window elapses.
    pub async fn stop_instance(&self, instance: &Instance, drain: Duration, reason: &str) {
        debug!(spec = %instance.spec_key(), id = %instance.id(), reason, "stopping instance");
        instance.set_state(InstanceState::Draining);
        let drain = drain.max(Duration::from_secs(1));
        let pid = instance.conn().child_pid();
        let closed = timeout(drain, instance.conn().close()).await;
        match closed {
            Ok(Ok(())) => instance.set_state(InstanceState::Stopped),
            Ok(Err(err)) => {
                warn!(spec = %instance.spec_key(), error = %err, "close failed; killing process group");
                force_kill_group(pid);
                instance.set_state(InstanceState::Failed);
            }
            Err(_) => {
                warn!(spec = %instance.spec_key(), "drain timeout; killing process group");
                force_kill_group(pid);
                instance.set_state(InstanceState::Failed);
            }
        }
    }
}

/// SIGKILL the child's process group, best effort.
pub(crate) fn force_kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we spawned.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_version_rejected_before_launch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = LifecycleManager::new(
            tx,
            Arc::new(LogBuffer::new()),
            Arc::new(TracingObserver),
        );
        let spec: Arc<ServerSpec> = Arc::new(
            serde_yaml::from_str(
                "name: alpha\ntransport: stdio\ncmd: [\"true\"]\nprotocolVersion: \"1999-01-01\"\n",
            )
            .unwrap(),
        );
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(manager.start_instance(&SpecKey::new("alpha"), &spec, StartCause::Bootstrap))
            .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedProtocol { .. }));
    }

    #[test]
    fn attempt_step_labels() {
        assert_eq!(AttemptStep::LauncherStart.label(), "launcher_start");
        assert_eq!(AttemptStep::InstanceReady.label(), "instance_ready");
    }
}
