//! Worker control endpoints.
//!
//! `POST /api/worker/start` and `POST /api/worker/stop` both answer with the
//! bridge status after the action.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, warn};

use crate::relay::{Bridge, BridgeStatus};
use crate::subprocess::SupervisorError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// A failed start, mapped to an HTTP status.
pub struct WorkerRejection {
    status: StatusCode,
    body: ErrorBody,
}

impl IntoResponse for WorkerRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SupervisorError> for WorkerRejection {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::AlreadyRunning
            | SupervisorError::NotRunning
            | SupervisorError::InputClosed => StatusCode::CONFLICT,
            SupervisorError::NotConfigured | SupervisorError::ExecutableNotFound { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SupervisorError::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
            },
        }
    }
}

pub async fn start(
    State(bridge): State<Arc<Bridge>>,
) -> Result<Json<BridgeStatus>, WorkerRejection> {
    if let Err(e) = bridge.start_worker().await {
        warn!(error = %e, "Worker start request rejected");
        return Err(e.into());
    }
    info!("Worker started on request");
    Ok(Json(bridge.status()))
}

/// Stopping an idle worker is not an error.
pub async fn stop(State(bridge): State<Arc<Bridge>>) -> Json<BridgeStatus> {
    bridge.stop_worker().await;
    info!("Worker stopped on request");
    Json(bridge.status())
}
