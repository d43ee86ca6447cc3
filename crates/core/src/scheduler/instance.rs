//! One running incarnation of a spec.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use shoal_types::{InstanceState, InstanceStatus, StartCause};
use uuid::Uuid;

use crate::catalog::SpecKey;
use crate::transport::Connection;

/// Mutable fields, guarded by a short-held lock. State transitions belong to
/// the lifecycle manager and the owning pool; nothing else writes here.
#[derive(Debug)]
struct InstanceMut {
    state: InstanceState,
    busy_count: u32,
    handshaked_at: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
    last_active_instant: Instant,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

/// One running instance of a spec, shared between the pool and in-flight
/// leases.
pub struct Instance {
    id: Uuid,
    spec_key: SpecKey,
    conn: Arc<dyn Connection>,
    start_cause: StartCause,
    spawned_at: DateTime<Utc>,
    max_concurrent: u32,
    inner: Mutex<InstanceMut>,
    /// FIFO gate used by the stateful strategy: all calls bound to this
    /// instance serialize here.
    session_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Instance {
    /// Build a slot in the `Handshaking` state; the lifecycle manager moves
    /// it to `Ready` once validation passes.
    pub fn new(
        spec_key: SpecKey,
        conn: Arc<dyn Connection>,
        start_cause: StartCause,
        max_concurrent: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec_key,
            conn,
            start_cause,
            spawned_at: Utc::now(),
            max_concurrent,
            inner: Mutex::new(InstanceMut {
                state: InstanceState::Handshaking,
                busy_count: 0,
                handshaked_at: None,
                last_active: None,
                last_active_instant: Instant::now(),
                last_heartbeat_at: None,
            }),
            session_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Opaque instance identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Spec this instance belongs to.
    pub fn spec_key(&self) -> &SpecKey {
        &self.spec_key
    }

    /// The live connection.
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Why the instance was started.
    pub fn start_cause(&self) -> &StartCause {
        &self.start_cause
    }

    /// The stateful-session FIFO gate.
    pub(crate) fn session_gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.session_gate)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InstanceMut> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state.
    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    /// Calls currently in flight.
    pub fn busy_count(&self) -> u32 {
        self.lock().busy_count
    }

    /// Whether a new lease fits right now.
    pub fn has_capacity(&self) -> bool {
        let inner = self.lock();
        inner.state.is_leasable() && inner.busy_count < self.max_concurrent
    }

    /// Seconds since the last completed call (or since spawn).
    pub fn idle_for_secs(&self) -> u64 {
        self.lock().last_active_instant.elapsed().as_secs()
    }

    /// Transition into a new state. Terminal states are absorbing; a write
    /// after `Stopped`/`Failed` is ignored.
    pub(crate) fn set_state(&self, state: InstanceState) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        if state == InstanceState::Ready && inner.handshaked_at.is_none() {
            inner.handshaked_at = Some(Utc::now());
        }
        inner.state = state;
    }

    /// Record a successful liveness probe.
    pub(crate) fn mark_heartbeat(&self) {
        self.lock().last_heartbeat_at = Some(Utc::now());
    }

    /// Take one unit of capacity. Returns false without mutating when the
    /// instance cannot be leased.
    pub(crate) fn begin_lease(&self) -> bool {
        let mut inner = self.lock();
        if !inner.state.is_leasable() || inner.busy_count >= self.max_concurrent {
            return false;
        }
        inner.busy_count += 1;
        inner.state = InstanceState::Busy;
        true
    }

    /// Return one unit of capacity. When the lease was the last one the
    /// instance goes back to `Ready` (or stays `Draining`).
    pub(crate) fn end_lease(&self) {
        let mut inner = self.lock();
        inner.busy_count = inner.busy_count.saturating_sub(1);
        inner.last_active = Some(Utc::now());
        inner.last_active_instant = Instant::now();
        if inner.busy_count == 0 && inner.state == InstanceState::Busy {
            inner.state = InstanceState::Ready;
        }
    }

    /// Atomically retire an idle instance: `Ready` with no leases moves to
    /// `Draining` and the call returns true; anything else is left alone.
    pub(crate) fn try_retire(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == InstanceState::Ready && inner.busy_count == 0 {
            inner.state = InstanceState::Draining;
            true
        } else {
            false
        }
    }

    /// Status row for pool export.
    pub fn status(&self) -> InstanceStatus {
        let inner = self.lock();
        InstanceStatus {
            instance_id: self.id,
            state: inner.state,
            busy_count: inner.busy_count,
            spawned_at: self.spawned_at,
            handshaked_at: inner.handshaked_at,
            last_active: inner.last_active,
            last_heartbeat_at: inner.last_heartbeat_at,
            start_cause: self.start_cause.clone(),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec", &self.spec_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedConnection;

    fn instance(max_concurrent: u32) -> Instance {
        Instance::new(
            SpecKey::new("alpha"),
            Arc::new(ScriptedConnection::default()),
            StartCause::Bootstrap,
            max_concurrent,
        )
    }

    #[test]
    fn lease_respects_capacity() {
        let inst = instance(2);
        inst.set_state(InstanceState::Ready);
        assert!(inst.begin_lease());
        assert!(inst.begin_lease());
        assert!(!inst.begin_lease());
        assert_eq!(inst.busy_count(), 2);
        assert_eq!(inst.state(), InstanceState::Busy);

        inst.end_lease();
        assert_eq!(inst.state(), InstanceState::Busy);
        inst.end_lease();
        assert_eq!(inst.state(), InstanceState::Ready);
        assert_eq!(inst.busy_count(), 0);
    }

    #[test]
    fn terminal_states_absorb() {
        let inst = instance(1);
        inst.set_state(InstanceState::Failed);
        inst.set_state(InstanceState::Ready);
        assert_eq!(inst.state(), InstanceState::Failed);
    }

    #[test]
    fn no_lease_before_ready() {
        let inst = instance(1);
        assert!(!inst.begin_lease());
    }
}
