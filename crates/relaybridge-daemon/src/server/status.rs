//! Read-only status endpoints. Safe to poll at any rate.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::relay::{Bridge, BridgeStatus};
use crate::upstream::LinkState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub connections: HealthConnections,
    pub upstream: Option<LinkState>,
    /// RFC 3339.
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HealthConnections {
    pub controller: bool,
    pub observers: usize,
}

#[allow(clippy::unused_async)]
pub async fn status(State(bridge): State<Arc<Bridge>>) -> Json<BridgeStatus> {
    Json(bridge.status())
}

#[allow(clippy::unused_async)]
pub async fn health(State(bridge): State<Arc<Bridge>>) -> Json<Health> {
    let status = bridge.status();
    Json(Health {
        status: "ok",
        connections: HealthConnections {
            controller: status.controller_connected,
            observers: status.observer_count,
        },
        upstream: status.upstream,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
