use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submit", post(handlers::submit))
        .route("/status", get(handlers::status))
        .route(
            "/workers",
            get(handlers::list_workers)
                .post(handlers::spawn_worker)
                .delete(handlers::kill_all_workers),
        )
        .route("/workers/:port", delete(handlers::kill_worker))
        .route("/metrics", get(handlers::export_metrics))
}
