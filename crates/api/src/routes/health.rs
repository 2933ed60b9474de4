//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Views served by this process.
    pub views: Vec<&'static str>,
}

/// GET /health
pub async fn check(State(views): State<Arc<[&'static str]>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        views: views.to_vec(),
    })
}
