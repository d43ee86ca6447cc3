//! Pushes list-changed notifications to gateway sessions.

use std::sync::Arc;

use rmcp::service::{Peer, RoleServer};
use shoal_core::events::{CoreEvent, IndexKind};
use shoal_core::Core;
use tracing::debug;
use uuid::Uuid;

/// Watch the event bus and notify the session whenever the caller's visible
/// projection changes. The subscription lives as long as the peer does; a
/// failed notify ends it.
pub(crate) fn spawn_notifier(core: Arc<Core>, client_id: Uuid, peer: Peer<RoleServer>) {
    tokio::spawn(async move {
        let mut events = core.events().subscribe();
        let mut last = [
            core.visible_etag(Some(client_id), IndexKind::Tools).ok(),
            core.visible_etag(Some(client_id), IndexKind::Resources).ok(),
            core.visible_etag(Some(client_id), IndexKind::Prompts).ok(),
        ];
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            let kinds: Vec<IndexKind> = match event {
                CoreEvent::SnapshotChanged { kind, .. } => vec![kind],
                // Visibility shifts can change the projection without a
                // snapshot change.
                CoreEvent::ClientsChanged | CoreEvent::ReloadApplied { .. } => {
                    IndexKind::ALL.to_vec()
                }
                _ => continue,
            };
            for kind in kinds {
                let slot = match kind {
                    IndexKind::Tools => 0,
                    IndexKind::Resources => 1,
                    IndexKind::Prompts => 2,
                };
                let Ok(etag) = core.visible_etag(Some(client_id), kind) else {
                    // Caller deregistered; stop watching.
                    return;
                };
                if last[slot].as_deref() == Some(etag.as_str()) {
                    continue;
                }
                last[slot] = Some(etag);
                debug!(%client_id, kind = kind.label(), "pushing list_changed");
                let result = match kind {
                    IndexKind::Tools => peer.notify_tool_list_changed().await,
                    IndexKind::Resources => peer.notify_resource_list_changed().await,
                    IndexKind::Prompts => peer.notify_prompt_list_changed().await,
                };
                if result.is_err() {
                    return;
                }
            }
        }
    });
}
