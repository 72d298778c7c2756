//! RobotCopy: traced dispatch through pluggable message brokers.
//!
//! Every dispatch gets fresh message/trace/span ids, is tracked as `{id}`
//! before it leaves, and as `{id}_response` or `{id}_error` after, all under
//! the same trace id.
//!
//! # Two failure modes
//!
//! - [`RobotCopy::dispatch`] and the `post_to_*` helpers resolve to a typed
//!   [`BrokerResponse`]; `success: false` is a value, not an error
//! - [`RobotCopy::send_message`] and [`RobotCopy::graphql`] reject on failure
//!
//! Callers that want to degrade ("backend unavailable, using local state")
//! pick the first; HTTP handlers pick the second.
//!
//! # Example
//!
//! ```ignore
//! let (window, mut endpoint) = ChannelBroker::with_default_timeout();
//! let robot = RobotCopy::new(RobotCopyConfig::default().primary(BrokerKind::Window))
//!     .with_broker(Arc::new(window));
//!
//! let reply = robot.send_message("START_COOKING", json!({"orderId": "o-1"})).await?;
//! let trace = robot.get_full_trace(&robot.get_trace_ids()[0]);
//! ```

pub mod broker;
pub mod trace;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::StateEngine;
use crate::error::TomeError;
use crate::lock;

pub use broker::{
    BrokerKind, BrokerMessage, BrokerResponse, ChannelBroker, ChannelEndpoint, ChannelRequest,
    GraphQlBroker, HttpBroker, MessageBroker,
};
pub use trace::{create_tracing_headers, MessageMetadata, MessageTracer, TraceInfo};

/// Toggle that makes dispatch use the alternate broker.
pub const DEFAULT_BACKEND_SELECTOR_TOGGLE: &str = "alternate-backend";

/// Toggle that adds DataDog headers.
pub const DATADOG_TOGGLE: &str = "enable-datadog";

/// Messages kept by the queue; the oldest are dropped first.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1000;

/// Message types every registered machine understands.
const STANDARD_MESSAGE_TYPES: [&str; 4] = ["state-change", "event-send", "log-entry", "view-update"];

// =============================================================================
// Config
// =============================================================================

/// RobotCopy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RobotCopyConfig {
    /// Used as the `source` of outgoing messages.
    pub source: String,
    /// Broker used when the selector toggle is off.
    pub primary_broker: BrokerKind,
    /// Broker used when the selector toggle is on.
    pub alternate_broker: Option<BrokerKind>,
    /// Name of the toggle that selects the alternate broker.
    pub backend_selector_toggle: String,
    /// Prefix for message targets; the action name is appended.
    pub target_prefix: String,
    /// Track messages in the tracer.
    pub enable_tracing: bool,
    /// Add DataDog headers regardless of the toggle.
    pub enable_datadog: bool,
    /// Initial feature toggle values.
    pub toggles: HashMap<String, bool>,
}

impl Default for RobotCopyConfig {
    fn default() -> Self {
        Self {
            source: "robotcopy".to_string(),
            primary_broker: BrokerKind::Http,
            alternate_broker: None,
            backend_selector_toggle: DEFAULT_BACKEND_SELECTOR_TOGGLE.to_string(),
            target_prefix: String::new(),
            enable_tracing: true,
            enable_datadog: false,
            toggles: HashMap::new(),
        }
    }
}

impl RobotCopyConfig {
    pub fn primary(mut self, kind: BrokerKind) -> Self {
        self.primary_broker = kind;
        self
    }

    pub fn alternate(mut self, kind: BrokerKind) -> Self {
        self.alternate_broker = Some(kind);
        self
    }

    pub fn toggle(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.toggles.insert(name.into(), enabled);
        self
    }
}

/// GraphQL operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphQlOperation {
    Query,
    Mutation,
    Subscription,
}

impl GraphQlOperation {
    fn message_type(self) -> &'static str {
        match self {
            GraphQlOperation::Query => "graphql-query",
            GraphQlOperation::Mutation => "graphql-mutation",
            GraphQlOperation::Subscription => "graphql-subscription",
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// How a registered machine may be reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistration {
    pub supported_brokers: Vec<BrokerKind>,
    pub auto_discovery: bool,
    pub description: Option<String>,
}

/// A GraphQL operation declared in a state's `meta.graphql`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlState {
    pub name: String,
    pub operation: String,
    pub query: String,
    #[serde(default)]
    pub variables: Value,
}

/// Capabilities inferred for one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineCapabilities {
    pub supported_brokers: Vec<BrokerKind>,
    pub auto_discovery: bool,
    pub message_types: Vec<String>,
    pub graphql_states: Vec<GraphQlState>,
    pub states: Vec<String>,
}

/// Output of [`RobotCopy::discover`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub machines: Vec<String>,
    pub message_brokers: Vec<BrokerKind>,
    pub configurations: BTreeMap<String, MachineRegistration>,
    pub capabilities: BTreeMap<String, MachineCapabilities>,
}

struct RegisteredMachine {
    engine: Arc<dyn StateEngine>,
    registration: MachineRegistration,
}

// =============================================================================
// RobotCopy
// =============================================================================

type ResponseHandler = Box<dyn FnOnce(&BrokerResponse) + Send>;

struct Inner {
    config: Mutex<RobotCopyConfig>,
    tracer: MessageTracer,
    brokers: Mutex<BTreeMap<BrokerKind, Arc<dyn MessageBroker>>>,
    toggles: Mutex<HashMap<String, bool>>,
    queue: Mutex<VecDeque<BrokerMessage>>,
    response_handlers: Mutex<HashMap<String, ResponseHandler>>,
    machines: Mutex<BTreeMap<String, RegisteredMachine>>,
}

/// Traced message dispatch. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RobotCopy {
    inner: Arc<Inner>,
}

impl Default for RobotCopy {
    fn default() -> Self {
        Self::new(RobotCopyConfig::default())
    }
}

impl RobotCopy {
    pub fn new(config: RobotCopyConfig) -> Self {
        let toggles = config.toggles.clone();
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                tracer: MessageTracer::new(),
                brokers: Mutex::new(BTreeMap::new()),
                toggles: Mutex::new(toggles),
                queue: Mutex::new(VecDeque::new()),
                response_handlers: Mutex::new(HashMap::new()),
                machines: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a broker under its own kind (replaces an existing one).
    pub fn with_broker(self, broker: Arc<dyn MessageBroker>) -> Self {
        self.register_broker(broker);
        self
    }

    /// Register a broker under its own kind (replaces an existing one).
    pub fn register_broker(&self, broker: Arc<dyn MessageBroker>) {
        lock(&self.inner.brokers).insert(broker.kind(), broker);
    }

    pub fn has_broker(&self, kind: &BrokerKind) -> bool {
        lock(&self.inner.brokers).contains_key(kind)
    }

    /// Kinds of every registered broker, in kind order.
    pub fn broker_kinds(&self) -> Vec<BrokerKind> {
        lock(&self.inner.brokers).keys().cloned().collect()
    }

    pub fn config(&self) -> RobotCopyConfig {
        lock(&self.inner.config).clone()
    }

    /// Replace the config; toggles named in the new config are applied on top.
    pub fn update_config(&self, config: RobotCopyConfig) {
        lock(&self.inner.toggles).extend(config.toggles.clone());
        *lock(&self.inner.config) = config;
    }

    pub fn tracer(&self) -> &MessageTracer {
        &self.inner.tracer
    }

    // -------------------------------------------------------------------------
    // Toggles
    // -------------------------------------------------------------------------

    /// Toggle value; unknown toggles are off.
    pub fn is_enabled(&self, toggle: &str) -> bool {
        lock(&self.inner.toggles).get(toggle).copied().unwrap_or(false)
    }

    pub fn set_toggle(&self, toggle: impl Into<String>, enabled: bool) {
        lock(&self.inner.toggles).insert(toggle.into(), enabled);
    }

    /// Broker `send_message` will use right now.
    pub fn selected_broker(&self) -> BrokerKind {
        let config = self.config();
        match config.alternate_broker {
            Some(alternate) if self.is_enabled(&config.backend_selector_toggle) => alternate,
            _ => config.primary_broker,
        }
    }

    // -------------------------------------------------------------------------
    // Tracing passthroughs
    // -------------------------------------------------------------------------

    pub fn generate_message_id(&self) -> String {
        self.inner.tracer.generate_message_id()
    }

    pub fn generate_trace_id(&self) -> String {
        self.inner.tracer.generate_trace_id()
    }

    pub fn generate_span_id(&self) -> String {
        self.inner.tracer.generate_span_id()
    }

    pub fn track_message(
        &self,
        message_id: &str,
        trace_id: &str,
        span_id: &str,
        backend: &str,
        action: &str,
        data: Value,
    ) -> MessageMetadata {
        self.inner
            .tracer
            .track_message(message_id, trace_id, span_id, backend, action, data)
    }

    pub fn get_message(&self, message_id: &str) -> Option<MessageMetadata> {
        self.inner.tracer.get_message(message_id)
    }

    pub fn get_trace_messages(&self, trace_id: &str) -> Vec<MessageMetadata> {
        self.inner.tracer.get_trace_messages(trace_id)
    }

    pub fn get_full_trace(&self, trace_id: &str) -> TraceInfo {
        self.inner.tracer.get_full_trace(trace_id)
    }

    pub fn get_message_history(&self) -> Vec<MessageMetadata> {
        self.inner.tracer.get_message_history()
    }

    pub fn get_trace_ids(&self) -> Vec<String> {
        self.inner.tracer.get_trace_ids()
    }

    pub fn clear_history(&self) {
        self.inner.tracer.clear_history();
    }

    // -------------------------------------------------------------------------
    // Queue and response handlers
    // -------------------------------------------------------------------------

    /// Messages dispatched since the last clear, oldest first, at most
    /// [`MESSAGE_QUEUE_CAPACITY`].
    pub fn get_message_queue(&self) -> Vec<BrokerMessage> {
        lock(&self.inner.queue).iter().cloned().collect()
    }

    pub fn clear_message_queue(&self) {
        lock(&self.inner.queue).clear();
    }

    /// Call `handler` once with the response to `message_id`.
    pub fn on_response<F>(&self, message_id: impl Into<String>, handler: F)
    where
        F: FnOnce(&BrokerResponse) + Send + 'static,
    {
        lock(&self.inner.response_handlers).insert(message_id.into(), Box::new(handler));
    }

    /// Response handlers still waiting for their message.
    pub fn pending_response_count(&self) -> usize {
        lock(&self.inner.response_handlers).len()
    }

    fn enqueue(&self, message: BrokerMessage) {
        let mut queue = lock(&self.inner.queue);
        if queue.len() >= MESSAGE_QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    fn handle_response(&self, response: &BrokerResponse) {
        let handler = lock(&self.inner.response_handlers).remove(&response.message_id);
        if let Some(handler) = handler {
            handler(response);
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Build a message with fresh ids and trace headers, ready for [`RobotCopy::dispatch`].
    pub fn prepare_message(
        &self,
        broker: BrokerKind,
        kind: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> PreparedMessage {
        let trace_id = self.generate_trace_id();
        let span_id = self.generate_span_id();
        let id = self.generate_message_id();
        let enable_datadog = self.config().enable_datadog || self.is_enabled(DATADOG_TOGGLE);

        PreparedMessage {
            message: BrokerMessage {
                headers: create_tracing_headers(&trace_id, &span_id, &id, enable_datadog),
                id,
                kind: kind.into(),
                payload,
                timestamp: Utc::now(),
                source: self.config().source,
                target: target.into(),
                broker,
            },
            trace_id,
            span_id,
        }
    }

    /// Send a prepared message. Remote failures come back as `success: false`.
    ///
    /// Errors only when no broker is registered for the message's kind.
    pub async fn dispatch(&self, prepared: PreparedMessage) -> Result<BrokerResponse> {
        let PreparedMessage {
            message,
            trace_id,
            span_id,
        } = prepared;
        let tracing_enabled = self.config().enable_tracing;
        let backend = message.broker.to_string();
        let action = message.kind.clone();
        let message_id = message.id.clone();

        if tracing_enabled {
            self.track_message(&message_id, &trace_id, &span_id, &backend, &action, message.payload.clone());
        }
        self.enqueue(message.clone());

        let broker = lock(&self.inner.brokers).get(&message.broker).cloned();
        let Some(broker) = broker else {
            warn!(broker = %backend, "no message broker registered");
            let error = TomeError::NoMessageBroker { kind: backend.clone() };
            if tracing_enabled {
                self.track_message(
                    &format!("{message_id}_error"),
                    &trace_id,
                    &span_id,
                    &backend,
                    &format!("{action}_error"),
                    json!({ "error": error.to_string() }),
                );
            }
            self.handle_response(&BrokerResponse::failed(&message_id, error.to_string()));
            return Err(error.into());
        };

        debug!(broker = %backend, %message_id, %trace_id, action = %action, "dispatching");
        let response = match broker.send(message).await {
            Ok(response) => response,
            Err(e) => BrokerResponse::failed(&message_id, e.to_string()),
        };

        if tracing_enabled {
            if response.success {
                self.track_message(
                    &format!("{message_id}_response"),
                    &trace_id,
                    &span_id,
                    &backend,
                    &format!("{action}_response"),
                    response.data.clone().unwrap_or(Value::Null),
                );
            } else {
                self.track_message(
                    &format!("{message_id}_error"),
                    &trace_id,
                    &span_id,
                    &backend,
                    &format!("{action}_error"),
                    json!({ "error": response.error }),
                );
            }
        }

        self.handle_response(&response);
        Ok(response)
    }

    /// Send `action` with `data` through the selected broker; rejects on failure.
    pub async fn send_message(&self, action: &str, data: Value) -> Result<Value> {
        let broker = self.selected_broker();
        let target = format!("{}/{}", self.config().target_prefix, action);
        let prepared = self.prepare_message(broker.clone(), action, target, data);
        let payload_ids = json!({
            "messageId": prepared.message.id,
            "traceId": prepared.trace_id,
            "spanId": prepared.span_id,
        });
        let prepared = prepared.with_payload_ids(payload_ids);

        let response = self.dispatch(prepared).await?;
        into_result(&broker, response)
    }

    /// Run a GraphQL operation through the GraphQL broker; rejects on failure.
    pub async fn graphql(
        &self,
        operation: GraphQlOperation,
        document: &str,
        variables: Value,
    ) -> Result<Value> {
        let response = self.post_to_graphql_operation(operation, document, variables).await?;
        into_result(&BrokerKind::GraphQl, response)
    }

    /// Request/reply through the in-process channel broker.
    pub async fn post_to_window(&self, payload: Value) -> Result<BrokerResponse> {
        let prepared = self.prepare_message(BrokerKind::Window, "window-post", "window", payload);
        self.dispatch(prepared).await
    }

    /// POST `payload` to `endpoint` (relative to the HTTP broker's base URL).
    pub async fn post_to_http(&self, payload: Value, endpoint: &str) -> Result<BrokerResponse> {
        let prepared = self.prepare_message(BrokerKind::Http, "http-post", endpoint, payload);
        self.dispatch(prepared).await
    }

    /// Send a GraphQL query.
    pub async fn post_to_graphql(&self, query: &str, variables: Value) -> Result<BrokerResponse> {
        self.post_to_graphql_operation(GraphQlOperation::Query, query, variables)
            .await
    }

    async fn post_to_graphql_operation(
        &self,
        operation: GraphQlOperation,
        document: &str,
        variables: Value,
    ) -> Result<BrokerResponse> {
        let prepared = self.prepare_message(
            BrokerKind::GraphQl,
            operation.message_type(),
            "graphql-endpoint",
            json!({ "query": document, "variables": variables }),
        );
        self.dispatch(prepared).await
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    /// Record a machine for [`RobotCopy::discover`].
    pub fn register_machine(
        &self,
        machine_id: impl Into<String>,
        engine: Arc<dyn StateEngine>,
        registration: MachineRegistration,
    ) {
        lock(&self.inner.machines).insert(
            machine_id.into(),
            RegisteredMachine {
                engine,
                registration,
            },
        );
    }

    /// Ids of registered machines.
    pub fn registered_machines(&self) -> Vec<String> {
        lock(&self.inner.machines).keys().cloned().collect()
    }

    /// Static capability report for every registered machine.
    pub fn discover(&self) -> Discovery {
        let machines = lock(&self.inner.machines);
        let mut configurations = BTreeMap::new();
        let mut capabilities = BTreeMap::new();

        for (id, machine) in machines.iter() {
            configurations.insert(id.clone(), machine.registration.clone());
            capabilities.insert(
                id.clone(),
                MachineCapabilities {
                    supported_brokers: machine.registration.supported_brokers.clone(),
                    auto_discovery: machine.registration.auto_discovery,
                    message_types: STANDARD_MESSAGE_TYPES.iter().map(|t| t.to_string()).collect(),
                    graphql_states: graphql_states(machine.engine.as_ref()),
                    states: machine.engine.state_names(),
                },
            );
        }

        Discovery {
            machines: machines.keys().cloned().collect(),
            message_brokers: lock(&self.inner.brokers).keys().cloned().collect(),
            configurations,
            capabilities,
        }
    }
}

impl std::fmt::Debug for RobotCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotCopy")
            .field("brokers", &lock(&self.inner.brokers).keys().collect::<Vec<_>>())
            .field("tracer", &self.inner.tracer)
            .finish()
    }
}

/// A message plus the trace and span it belongs to.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub message: BrokerMessage,
    pub trace_id: String,
    pub span_id: String,
}

impl PreparedMessage {
    /// Merge `ids` into an object payload; other payloads are wrapped as `{data}`.
    fn with_payload_ids(mut self, ids: Value) -> Self {
        let mut payload = match std::mem::take(&mut self.message.payload) {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        if let Value::Object(ids) = ids {
            payload.extend(ids);
        }
        self.message.payload = Value::Object(payload);
        self
    }
}

fn into_result(broker: &BrokerKind, response: BrokerResponse) -> Result<Value> {
    if response.success {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(TomeError::BrokerFailure {
            broker: broker.to_string(),
            message: response
                .error
                .unwrap_or_else(|| "unknown broker error".to_string()),
        }
        .into())
    }
}

fn graphql_states(engine: &dyn StateEngine) -> Vec<GraphQlState> {
    let Some(definition) = engine.definition() else {
        return Vec::new();
    };

    definition
        .states
        .iter()
        .filter_map(|(name, node)| {
            let graphql = node.meta.as_ref()?.get("graphql")?;
            Some(GraphQlState {
                name: name.clone(),
                operation: graphql
                    .get("operation")
                    .and_then(Value::as_str)
                    .unwrap_or("query")
                    .to_string(),
                query: graphql.get("query").and_then(Value::as_str)?.to_string(),
                variables: graphql.get("variables").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}
