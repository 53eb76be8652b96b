use crate::handlers;
use crate::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submissions", post(handlers::submit_submission))
        .route("/dry-run", post(handlers::submit_dry_run))
        .route("/jobs/:job_id", get(handlers::get_job_report))
        .route("/users/:user_id/points", get(handlers::get_user_points))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
