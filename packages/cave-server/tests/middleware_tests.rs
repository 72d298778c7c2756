mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use cave_server::build_app;
use serde_json::json;
use tome::tome::{AuthKind, AuthenticationConfig, RateLimitConfig, RoutingConfig};

use common::*;

fn with_header(path: &str, name: &str, value: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if !name.eq_ignore_ascii_case("x-forwarded-for") {
        builder = builder.header("x-forwarded-for", CLIENT_IP);
    }
    builder
        .header(name, value)
        .body(Body::from(json!({ "event": "START" }).to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_rate_limit_answers_429() {
    let routing = RoutingConfig {
        rate_limit: RateLimitConfig { window_ms: 60_000, max: 2 },
        ..RoutingConfig::default()
    };
    let app = build_app(
        started_manager(vec![toggle_tome_with_routing("t", routing)]),
        None,
        false,
    );

    for _ in 0..2 {
        let (status, _) = send(&app, post_json("/api/t/run", &json!({ "event": "STOP" }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&app, post_json("/api/t/run", &json!({ "event": "STOP" }))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        body,
        json!({ "success": false, "error": "Too many requests", "tome": "t" })
    );

    // A different client has its own window
    let (status, _) = send(&app, with_header("/api/t/run", "x-forwarded-for", "10.1.1.1")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_is_per_tome() {
    let tight = RoutingConfig {
        rate_limit: RateLimitConfig { window_ms: 60_000, max: 1 },
        ..RoutingConfig::default()
    };
    let app = build_app(
        started_manager(vec![
            toggle_tome_with_routing("a", tight),
            toggle_tome("b"),
        ]),
        None,
        false,
    );

    send(&app, post_json("/api/a/run", &json!({ "event": "STOP" }))).await;
    let (status, _) = send(&app, post_json("/api/a/run", &json!({ "event": "STOP" }))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _) = send(&app, post_json("/api/b/run", &json!({ "event": "STOP" }))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_api_key_required() {
    let routing = RoutingConfig {
        authentication: AuthenticationConfig {
            required: true,
            kind: Some(AuthKind::ApiKey),
        },
        ..RoutingConfig::default()
    };
    let app = build_app(
        started_manager(vec![toggle_tome_with_routing("t", routing)]),
        None,
        false,
    );

    let (status, body) = send(&app, post_json("/api/t/run", &json!({ "event": "START" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        body,
        json!({ "success": false, "error": "Authentication required", "tome": "t" })
    );

    let (status, _) = send(&app, with_header("/api/t/run", "authorization", "Bearer x")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, with_header("/api/t/run", "x-api-key", "secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn test_jwt_requires_authorization_header() {
    let routing = RoutingConfig {
        authentication: AuthenticationConfig {
            required: true,
            kind: Some(AuthKind::Jwt),
        },
        ..RoutingConfig::default()
    };
    let app = build_app(
        started_manager(vec![toggle_tome_with_routing("t", routing)]),
        None,
        false,
    );

    let (status, _) = send(&app, with_header("/api/t/run", "x-api-key", "secret")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, with_header("/api/t/run", "authorization", "Bearer token")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cors_follows_routing_flag() {
    let open = build_app(started_manager(vec![toggle_tome("t")]), None, false);
    let response = send_raw(&open, with_header("/api/t/run", "origin", "http://example.com")).await;
    assert!(response.headers().contains_key("access-control-allow-origin"));

    let closed_routing = RoutingConfig {
        cors: false,
        ..RoutingConfig::default()
    };
    let closed = build_app(
        started_manager(vec![toggle_tome_with_routing("t", closed_routing)]),
        None,
        false,
    );
    let response = send_raw(&closed, with_header("/api/t/run", "origin", "http://example.com")).await;
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}
