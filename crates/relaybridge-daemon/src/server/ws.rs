//! Per-connection WebSocket task.
//!
//! Each accepted socket gets its own task that drains the connection's
//! bounded queue, so the broadcast hub never waits on a slow peer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use relaybridge_core::Event;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionRegistry, ObserverConnection, Role};
use crate::relay::Bridge;

/// Query parameters read at connect time.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// `controller` (or `cpp`) requests the controller role.
    #[serde(rename = "type")]
    pub client_type: Option<String>,
}

#[allow(clippy::unused_async)]
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(bridge): State<Arc<Bridge>>,
) -> Response {
    let role = Role::from_client_type(params.client_type.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, role, bridge))
}

async fn handle_socket(socket: WebSocket, role: Role, bridge: Arc<Bridge>) {
    let registry = bridge.registry().clone();
    let (conn, mut outbound) = ObserverConnection::new(role, bridge.queue_capacity());
    let id = conn.id();
    let closed = conn.closed_token();

    // The greeting is queued before registration so it precedes any broadcast.
    for event in bridge.greeting() {
        match event.to_json() {
            Ok(json) => {
                if let Err(e) = conn.try_deliver(&Arc::from(json)) {
                    debug!(conn_id = %id, error = %e, "Greeting not queued");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize greeting"),
        }
    }

    registry.register(Arc::clone(&conn)).await;
    if role == Role::Controller {
        registry.broadcast(&Event::system("Controller connected")).await;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            () = closed.cancelled() => {
                debug!(conn_id = %id, "Connection closed by bridge");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text.to_string().into())).await {
                    debug!(conn_id = %id, error = %e, "Send failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => relay_inbound(&registry, role, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = %id, error = %e, "Receive failed");
                    break;
                }
            },
        }
    }

    let removed = registry.unregister(id).await;
    if role == Role::Controller && removed.is_some() {
        registry.broadcast(&Event::system("Controller disconnected")).await;
    }
    info!(conn_id = %id, role = %role, "Connection finished");
}

/// Controller messages fan out to observers; observer messages go to the
/// controller. Only JSON is relayed, anything else is dropped.
async fn relay_inbound(registry: &ConnectionRegistry, role: Role, text: &str) {
    if let Err(e) = serde_json::from_str::<Value>(text) {
        warn!(role = %role, error = %e, "Dropping non-JSON message");
        return;
    }
    match role {
        Role::Controller => {
            registry.broadcast_text(Arc::from(text)).await;
        }
        Role::Observer => {
            registry.route_to_controller(text).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn controller_text_is_rebroadcast() {
        let registry = ConnectionRegistry::new();
        let (observer, mut rx) = ObserverConnection::new(Role::Observer, 8);
        registry.register(observer).await;

        relay_inbound(&registry, Role::Controller, "{\"move\":1}").await;
        assert_eq!(&*rx.recv().await.unwrap(), "{\"move\":1}");
    }

    #[tokio::test]
    async fn observer_text_goes_to_controller_only() {
        let registry = ConnectionRegistry::new();
        let (observer, mut observer_rx) = ObserverConnection::new(Role::Observer, 8);
        let (controller, mut controller_rx) = ObserverConnection::new(Role::Controller, 8);
        registry.register(observer).await;
        registry.register(controller).await;

        relay_inbound(&registry, Role::Observer, r#"{"action":"start"}"#).await;
        assert_eq!(
            &*controller_rx.recv().await.unwrap(),
            r#"{"action":"start"}"#
        );
        assert!(observer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn observer_text_without_controller_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (observer, mut rx) = ObserverConnection::new(Role::Observer, 8);
        registry.register(observer).await;

        relay_inbound(&registry, Role::Observer, r#"{"action":"start"}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_json_controller_text_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (observer, mut rx) = ObserverConnection::new(Role::Observer, 8);
        registry.register(observer).await;

        relay_inbound(&registry, Role::Controller, "garbage not json").await;
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.observer_count(), 1);
    }

    #[tokio::test]
    async fn non_json_observer_text_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (controller, mut rx) = ObserverConnection::new(Role::Controller, 8);
        registry.register(controller).await;

        relay_inbound(&registry, Role::Observer, "start").await;
        assert!(rx.try_recv().is_err());
        assert!(registry.has_controller());
    }
}
