//! Message brokers: the transports a RobotCopy dispatches through.
//!
//! A broker turns a [`BrokerMessage`] into a [`BrokerResponse`]. Transport
//! failures that the remote side reports (non-2xx, GraphQL `errors`) come
//! back as `success: false` responses; only local failures (timeouts, a closed
//! channel) are `Err`. [`RobotCopy`](super::RobotCopy) decides what to reject.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::TomeError;

/// Default reply timeout for [`ChannelBroker`].
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default request timeout for the HTTP-based brokers.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Which transport a message goes through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum BrokerKind {
    /// In-process request/reply (window-messaging equivalent).
    Window,
    /// HTTP POST.
    Http,
    /// GraphQL over HTTP.
    GraphQl,
    /// Anything registered under another name.
    Custom(String),
}

impl BrokerKind {
    pub fn as_str(&self) -> &str {
        match self {
            BrokerKind::Window => "window-intercom",
            BrokerKind::Http => "http-api",
            BrokerKind::GraphQl => "graphql",
            BrokerKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for BrokerKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "window-intercom" => BrokerKind::Window,
            "http-api" => BrokerKind::Http,
            "graphql" => BrokerKind::GraphQl,
            _ => BrokerKind::Custom(name),
        }
    }
}

impl From<BrokerKind> for String {
    fn from(kind: BrokerKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A message on its way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Path or address on the far side (HTTP path, channel name).
    pub target: String,
    pub broker: BrokerKind,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// What came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl BrokerResponse {
    pub fn ok(message_id: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
            message_id: message_id.into(),
        }
    }

    pub fn failed(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            message_id: message_id.into(),
        }
    }
}

/// A transport for [`BrokerMessage`]s.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// The kind this broker registers under.
    fn kind(&self) -> BrokerKind;

    /// Deliver `message` and wait for the reply.
    async fn send(&self, message: BrokerMessage) -> Result<BrokerResponse>;
}

// =============================================================================
// Channel broker
// =============================================================================

/// A message delivered to a [`ChannelEndpoint`], with its reply slot.
#[derive(Debug)]
pub struct ChannelRequest {
    pub message: BrokerMessage,
    reply: oneshot::Sender<Value>,
}

impl ChannelRequest {
    /// Answer the sender. Returns false if the sender already gave up.
    pub fn respond(self, data: Value) -> bool {
        self.reply.send(data).is_ok()
    }
}

/// Receiving side of a [`ChannelBroker`].
#[derive(Debug)]
pub struct ChannelEndpoint {
    rx: mpsc::Receiver<ChannelRequest>,
}

impl ChannelEndpoint {
    /// Next request, or `None` once every broker handle is dropped.
    pub async fn recv(&mut self) -> Option<ChannelRequest> {
        self.rx.recv().await
    }
}

/// In-process request/reply broker over tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelBroker {
    tx: mpsc::Sender<ChannelRequest>,
    timeout: Duration,
}

impl ChannelBroker {
    /// Broker plus the endpoint that must answer its messages.
    pub fn new(timeout: Duration) -> (Self, ChannelEndpoint) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx, timeout }, ChannelEndpoint { rx })
    }

    /// Broker with [`DEFAULT_CHANNEL_TIMEOUT`].
    pub fn with_default_timeout() -> (Self, ChannelEndpoint) {
        Self::new(DEFAULT_CHANNEL_TIMEOUT)
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Window
    }

    async fn send(&self, message: BrokerMessage) -> Result<BrokerResponse> {
        let message_id = message.id.clone();
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(ChannelRequest { message, reply })
            .await
            .map_err(|_| TomeError::BrokerFailure {
                broker: self.kind().to_string(),
                message: "channel endpoint closed".into(),
            })?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(data)) => Ok(BrokerResponse::ok(message_id, data)),
            Ok(Err(_)) => Err(TomeError::BrokerFailure {
                broker: self.kind().to_string(),
                message: "endpoint dropped the request without replying".into(),
            }
            .into()),
            Err(_) => Err(TomeError::BrokerTimeout {
                broker: self.kind().to_string(),
                duration: self.timeout,
            }
            .into()),
        }
    }
}

// =============================================================================
// HTTP broker
// =============================================================================

/// POSTs the payload as JSON to `{base_url}{target}`.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    http_client: Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MessageBroker for HttpBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Http
    }

    async fn send(&self, message: BrokerMessage) -> Result<BrokerResponse> {
        let url = format!("{}{}", self.base_url, message.target);
        debug!(%url, message_id = %message.id, "http broker dispatch");

        let mut request = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(&message.payload);
        for (name, value) in self.headers.iter().chain(message.headers.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(BrokerResponse::failed(message.id, e.to_string())),
        };

        let status = response.status();
        let data: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            Ok(BrokerResponse::ok(message.id, data))
        } else {
            let error = data
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP request failed with status {status}"));
            let mut failed = BrokerResponse::failed(message.id, error);
            failed.data = Some(data);
            Ok(failed)
        }
    }
}

// =============================================================================
// GraphQL broker
// =============================================================================

/// POSTs `{query, variables}` taken from the payload to a GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct GraphQlBroker {
    http_client: Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl GraphQlBroker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MessageBroker for GraphQlBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::GraphQl
    }

    async fn send(&self, message: BrokerMessage) -> Result<BrokerResponse> {
        let body = json!({
            "query": message.payload.get("query").cloned().unwrap_or(Value::Null),
            "variables": message.payload.get("variables").cloned().unwrap_or(Value::Null),
        });

        let mut request = self
            .http_client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        for (name, value) in self.headers.iter().chain(message.headers.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(BrokerResponse::failed(message.id, e.to_string())),
        };
        let data: Value = match response.json().await {
            Ok(data) => data,
            Err(e) => return Ok(BrokerResponse::failed(message.id, e.to_string())),
        };

        let first_error = data
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .map(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("GraphQL request failed")
                    .to_string()
            });

        Ok(match first_error {
            Some(error) => BrokerResponse::failed(message.id, error),
            None => BrokerResponse::ok(
                message.id,
                data.get("data").cloned().unwrap_or(Value::Null),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> BrokerMessage {
        BrokerMessage {
            id: id.into(),
            kind: "PING".into(),
            payload: json!({"n": 1}),
            timestamp: Utc::now(),
            source: "test".into(),
            target: "/ping".into(),
            broker: BrokerKind::Window,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_broker_kind_names_round_trip_through_strings() {
        assert_eq!(BrokerKind::from("graphql".to_string()), BrokerKind::GraphQl);
        assert_eq!(BrokerKind::Http.to_string(), "http-api");
        assert_eq!(
            BrokerKind::from("chrome-message".to_string()),
            BrokerKind::Custom("chrome-message".into())
        );
    }

    #[tokio::test]
    async fn test_channel_broker_request_reply() {
        let (broker, mut endpoint) = ChannelBroker::with_default_timeout();
        let server = tokio::spawn(async move {
            let request = endpoint.recv().await.unwrap();
            let n = request.message.payload["n"].clone();
            request.respond(json!({"echo": n}));
        });

        let response = broker.send(message("m1")).await.unwrap();
        server.await.unwrap();

        assert!(response.success);
        assert_eq!(response.message_id, "m1");
        assert_eq!(response.data, Some(json!({"echo": 1})));
    }

    #[tokio::test]
    async fn test_channel_broker_times_out() {
        let (broker, _endpoint) = ChannelBroker::new(Duration::from_millis(20));
        let err = broker.send(message("m2")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TomeError>(),
            Some(TomeError::BrokerTimeout { .. })
        ));
    }

    // -------------------------------------------------------------------------
    // HTTP and GraphQL brokers against a local axum server
    // -------------------------------------------------------------------------

    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn kitchen() -> Router {
        Router::new()
            .route(
                "/orders",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    Json(json!({
                        "received": body,
                        "traceId": header(&headers, "x-trace-id"),
                        "token": header(&headers, "x-token"),
                    }))
                }),
            )
            .route(
                "/closed",
                post(|| async {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({ "error": "kitchen closed" })),
                    )
                }),
            )
            .route("/teapot", post(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
            .route(
                "/graphql",
                post(|Json(body): Json<Value>| async move {
                    let query = body["query"].as_str().unwrap_or_default().to_string();
                    if query.contains("missing") {
                        Json(json!({
                            "data": null,
                            "errors": [
                                { "message": "Cannot query field \"missing\"" },
                                { "message": "second error" }
                            ]
                        }))
                    } else {
                        Json(json!({ "data": { "order": { "id": body["variables"]["id"] } } }))
                    }
                }),
            )
    }

    fn http_message(id: &str, target: &str, payload: Value) -> BrokerMessage {
        let mut message = message(id);
        message.broker = BrokerKind::Http;
        message.target = target.into();
        message.payload = payload;
        message.headers.insert("x-trace-id".into(), "trace-1".into());
        message
    }

    #[tokio::test]
    async fn test_http_broker_posts_payload_with_headers() {
        let base = serve(kitchen()).await;
        let broker = HttpBroker::new(base).with_header("x-token", "secret");

        let response = broker
            .send(http_message("h1", "/orders", json!({"item": "burger"})))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.message_id, "h1");
        assert_eq!(
            response.data,
            Some(json!({
                "received": { "item": "burger" },
                "traceId": "trace-1",
                "token": "secret"
            }))
        );
    }

    #[tokio::test]
    async fn test_http_broker_non_2xx_is_failed_response() {
        let base = serve(kitchen()).await;
        let broker = HttpBroker::new(base);

        let closed = broker.send(http_message("h2", "/closed", json!({}))).await.unwrap();
        assert!(!closed.success);
        assert_eq!(closed.error.as_deref(), Some("kitchen closed"));
        assert_eq!(closed.data, Some(json!({ "error": "kitchen closed" })));

        let teapot = broker.send(http_message("h3", "/teapot", json!({}))).await.unwrap();
        assert!(!teapot.success);
        assert!(teapot
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("HTTP request failed with status 418"));
    }

    #[tokio::test]
    async fn test_http_broker_unreachable_is_failed_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let broker = HttpBroker::new(format!("http://{addr}")).with_timeout(Duration::from_secs(2));
        let response = broker.send(http_message("h4", "/orders", json!({}))).await.unwrap();
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_graphql_broker_unwraps_data() {
        let base = serve(kitchen()).await;
        let broker = GraphQlBroker::new(format!("{base}/graphql"));

        let mut message = message("g1");
        message.broker = BrokerKind::GraphQl;
        message.payload = json!({
            "query": "query Order($id: ID!) { order(id: $id) { id } }",
            "variables": { "id": "o-7" }
        });

        let response = broker.send(message).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data, Some(json!({ "order": { "id": "o-7" } })));
    }

    #[tokio::test]
    async fn test_graphql_broker_surfaces_first_error() {
        let base = serve(kitchen()).await;
        let broker = GraphQlBroker::new(format!("{base}/graphql"));

        let mut message = message("g2");
        message.broker = BrokerKind::GraphQl;
        message.payload = json!({ "query": "{ missing }", "variables": {} });

        let response = broker.send(message).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Cannot query field \"missing\""));
        assert_eq!(response.data, None);
    }

    #[tokio::test]
    async fn test_channel_broker_closed_endpoint_fails() {
        let (broker, endpoint) = ChannelBroker::with_default_timeout();
        drop(endpoint);
        let err = broker.send(message("m3")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TomeError>(),
            Some(TomeError::BrokerFailure { .. })
        ));
    }
}
