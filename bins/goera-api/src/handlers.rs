// HTTP route handlers for the Goera dispatcher

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use goera_common::types::{Submission, SubmitRequest};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatcher::WorkerPool;
use crate::supervisor::SupervisorError;
use crate::{metrics, pool, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct SpawnRequest {
    pub port: Option<u16>,
}

/// POST /submit - Queue a submission for judging
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> impl IntoResponse {
    let submission = match Submission::try_from(request) {
        Ok(submission) => submission,
        Err(e) => {
            warn!(error = %e, "Rejected submission");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let submission_id = submission.id.clone();
    state.dispatcher.submit(submission);

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "queued",
            "submissionId": submission_id,
        })),
    )
        .into_response()
}

/// GET /status - Dispatcher health and load
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "workers": state.supervisor.list().len(),
            "liveWorkers": state.supervisor.live_ports().len(),
            "busyWorkers": state.dispatcher.busy_count(),
            "queued": state.dispatcher.queue_len(),
        })),
    )
}

/// GET /workers - Worker records with busy flags
pub async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.dispatcher.snapshot()))
}

/// POST /workers - Spawn a worker, optionally on a given port
pub async fn spawn_worker(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SpawnRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(request)| request).unwrap_or_default();

    match pool::start_worker(&state, request.port) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e @ (SupervisorError::PortTaken(_) | SupervisorError::PortReserved(_))) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to spawn worker");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// DELETE /workers/:port - Terminate one worker
pub async fn kill_worker(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    match state.supervisor.kill(port).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e @ SupervisorError::UnknownWorker(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// DELETE /workers - Terminate every worker
pub async fn kill_all_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.supervisor.kill_all().await;
    info!(stopped, "All workers stopped on request");
    (StatusCode::OK, Json(serde_json::json!({ "stopped": stopped })))
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
