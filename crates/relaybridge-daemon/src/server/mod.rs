//! Observer-facing HTTP server: the WebSocket endpoint, the status API and
//! worker control.

pub mod status;
pub mod worker;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::relay::Bridge;

/// Routes served on the listen address.
///
/// The WebSocket endpoint answers on both `/` and `/ws`.
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(ws::upgrade))
        .route("/ws", get(ws::upgrade))
        .route("/api/status", get(status::status))
        .route("/api/health", get(status::health))
        .route("/api/worker/start", post(worker::start))
        .route("/api/worker/stop", post(worker::stop))
        .with_state(bridge)
}

/// Serve until `shutdown` resolves and every connection has drained.
pub async fn serve<F>(listener: TcpListener, bridge: Arc<Bridge>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Observer endpoint listening");
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await
}
