//! Fan-out and controller routing on top of [`ConnectionRegistry`].

use std::sync::Arc;

use relaybridge_core::Event;
use tracing::{debug, error, warn};

use super::connection::{ConnectionId, ConnectionRegistry, Role};

impl ConnectionRegistry {
    /// Serialize `event` once and deliver it to every registered observer.
    ///
    /// Returns the number of observers the event was queued for. Observers
    /// that are closed or lagging are unregistered; nothing is propagated to
    /// the caller.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let text: Arc<str> = match event.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!(error = %e, kind = %event.kind(), "Failed to serialize event");
                return 0;
            }
        };
        self.broadcast_text(text).await
    }

    /// Deliver an already-serialized message to every registered observer.
    pub async fn broadcast_text(&self, text: Arc<str>) -> usize {
        let targets = self.snapshot(Role::Observer).await;
        let mut delivered = 0;
        let mut failed: Vec<ConnectionId> = Vec::new();

        for conn in &targets {
            match conn.try_deliver(&text) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id(), error = %e, "Dropping observer after failed delivery");
                    failed.push(conn.id());
                }
            }
        }

        for id in failed {
            self.unregister(id).await;
        }

        if delivered > 0 {
            debug!(delivered, "Broadcast to observers");
        }
        delivered
    }

    /// Deliver a message to the controller only.
    ///
    /// Returns `false` when there is no controller (a normal state) or the
    /// controller could not take the message, in which case it is dropped.
    pub async fn route_to_controller(&self, text: impl Into<Arc<str>>) -> bool {
        let Some(controller) = self.controller().await else {
            debug!("No controller connected, routed message dropped");
            return false;
        };
        let text = text.into();
        match controller.try_deliver(&text) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %controller.id(), error = %e, "Dropping controller after failed delivery");
                self.unregister(controller.id()).await;
                false
            }
        }
    }
}
