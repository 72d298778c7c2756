use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, Json};
use bytes::Bytes;
use serde_json::{json, Value};
use tome::Tome;

/// Route handler for one tome machine
///
/// The body is parsed leniently: an empty, non-JSON or non-object body is
/// treated as `{}` and therefore answered with the 400 "Event is required"
/// shape by the tome.
pub async fn tome_route_handler(tome: Arc<Tome>, machine_key: String, body: Bytes) -> impl IntoResponse {
    let request = parse_body(&body);
    let response = tome.handle_route(&machine_key, request).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body))
}

fn parse_body(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_is_lenient() {
        assert_eq!(parse_body(b""), json!({}));
        assert_eq!(parse_body(b"not json"), json!({}));
        assert_eq!(parse_body(b"[1,2]"), json!({}));
        assert_eq!(
            parse_body(br#"{"event":"GO","data":1}"#),
            json!({"event": "GO", "data": 1})
        );
    }
}
