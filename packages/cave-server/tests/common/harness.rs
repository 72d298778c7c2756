//! Drives the axum router in-process with `tower::ServiceExt::oneshot`.

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Client address every helper request claims; the rate limiter keys on it.
pub const CLIENT_IP: &str = "127.0.0.1";

pub fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", CLIENT_IP)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

pub fn post_raw(path: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", CLIENT_IP)
        .body(Body::from(body))
        .expect("valid request")
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-forwarded-for", CLIENT_IP)
        .body(Body::empty())
        .expect("valid request")
}

/// Send a request and return the raw response.
pub async fn send_raw(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.expect("router is infallible")
}

/// Send a request and decode the JSON body (`Null` if empty or not JSON).
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = send_raw(app, request).await;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}
