use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::app::AppState;

/// Cave registry endpoint: `{cave, addresses: [...]}` from the live cave
pub async fn registry_handler(Extension(state): Extension<AppState>) -> Response {
    match &state.cave {
        Some(cave) => Json(cave.registry()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No cave configured" })),
        )
            .into_response(),
    }
}
