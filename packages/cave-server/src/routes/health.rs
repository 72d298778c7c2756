use axum::{extract::Extension, Json};
use serde::Serialize;

use crate::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    tomes: Vec<String>,
}

/// Health check endpoint
///
/// Always healthy once the app is serving; lists the registered tomes.
pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        tomes: state.manager.list_tomes(),
    })
}
