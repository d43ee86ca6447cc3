//! Core event bus.
//!
//! Lifecycle transitions, reload results, and aggregator snapshot changes
//! are published on a `tokio::sync::broadcast` channel. Subscribers with
//! full buffers lose the oldest events (broadcast lag), never block the
//! publisher.

use shoal_types::ServerInitStatus;
use tokio::sync::broadcast;

use crate::catalog::SpecKey;

/// Default buffer depth for event subscribers.
pub const EVENT_BUFFER: usize = 256;

/// Which aggregated index a change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Tools,
    Resources,
    Prompts,
}

impl IndexKind {
    /// All kinds, in the order indexes are refreshed.
    pub const ALL: [IndexKind; 3] = [IndexKind::Tools, IndexKind::Resources, IndexKind::Prompts];

    /// Lowercase label used in logs and cache keys.
    pub fn label(&self) -> &'static str {
        match self {
            IndexKind::Tools => "tools",
            IndexKind::Resources => "resources",
            IndexKind::Prompts => "prompts",
        }
    }
}

/// Events emitted by the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// An instance completed its handshake and entered rotation.
    InstanceStarted { spec: SpecKey, instance_id: uuid::Uuid },
    /// An instance left rotation (stopped or failed).
    InstanceStopped {
        spec: SpecKey,
        instance_id: uuid::Uuid,
        failed: bool,
    },
    /// A spec's init status changed (top-up loop progress).
    ServerInit(ServerInitStatus),
    /// An aggregated index published a new snapshot.
    SnapshotChanged { kind: IndexKind, etag: String },
    /// A reload was applied; carries the new catalog version.
    ReloadApplied { version: u64 },
    /// A client registered or was evicted; visibility may have shifted.
    ClientsChanged,
}

/// Shared handle for publishing and subscribing to core events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer depth.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event. Returns silently when nobody listens.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(CoreEvent::ReloadApplied { version: 2 });
        match rx.recv().await.unwrap() {
            CoreEvent::ReloadApplied { version } => assert_eq!(version, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::ClientsChanged);
    }
}
