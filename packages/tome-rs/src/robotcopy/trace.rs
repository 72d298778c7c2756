//! Message tracing: id generation and the in-memory trace index.
//!
//! Two indices with deliberately different overwrite rules:
//!
//! - **by message id** is a point cache; tracking an existing id replaces it
//! - **by trace id** is an audit log; every tracked record is appended
//!
//! Neither index evicts. Call [`MessageTracer::clear_history`] or wrap the
//! tracer if memory must be bounded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::lock;

/// Header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Header carrying the span id.
pub const SPAN_ID_HEADER: &str = "x-span-id";
/// Header carrying the message id.
pub const MESSAGE_ID_HEADER: &str = "x-message-id";

/// One tracked message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub message_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub timestamp: DateTime<Utc>,
    /// Broker or backend the message went through.
    pub backend: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Everything known about one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    pub trace_id: String,
    pub messages: Vec<MessageMetadata>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub backend: Option<String>,
}

#[derive(Default)]
struct TraceIndex {
    by_id: HashMap<String, MessageMetadata>,
    id_order: Vec<String>,
    by_trace: HashMap<String, Vec<MessageMetadata>>,
    trace_order: Vec<String>,
}

/// Generates ids and records message metadata. Cheap to clone.
#[derive(Clone, Default)]
pub struct MessageTracer {
    index: Arc<Mutex<TraceIndex>>,
}

impl MessageTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `msg_{millis}_{suffix}`
    pub fn generate_message_id(&self) -> String {
        generate_id("msg")
    }

    /// `trace_{millis}_{suffix}`
    pub fn generate_trace_id(&self) -> String {
        generate_id("trace")
    }

    /// `span_{millis}_{suffix}`
    pub fn generate_span_id(&self) -> String {
        generate_id("span")
    }

    /// Record a message under both indices and return the stored record.
    pub fn track_message(
        &self,
        message_id: &str,
        trace_id: &str,
        span_id: &str,
        backend: &str,
        action: &str,
        data: Value,
    ) -> MessageMetadata {
        let record = MessageMetadata {
            message_id: message_id.to_string(),
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            timestamp: Utc::now(),
            backend: backend.to_string(),
            action: action.to_string(),
            data,
        };

        let mut index = lock(&self.index);
        if index
            .by_id
            .insert(message_id.to_string(), record.clone())
            .is_none()
        {
            index.id_order.push(message_id.to_string());
        }
        if !index.by_trace.contains_key(trace_id) {
            index.trace_order.push(trace_id.to_string());
        }
        index
            .by_trace
            .entry(trace_id.to_string())
            .or_default()
            .push(record.clone());

        record
    }

    /// Latest record for `message_id`.
    pub fn get_message(&self, message_id: &str) -> Option<MessageMetadata> {
        lock(&self.index).by_id.get(message_id).cloned()
    }

    /// Every record tracked under `trace_id`, in tracking order.
    pub fn get_trace_messages(&self, trace_id: &str) -> Vec<MessageMetadata> {
        lock(&self.index)
            .by_trace
            .get(trace_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Trace records plus first/last timestamps and the first backend.
    pub fn get_full_trace(&self, trace_id: &str) -> TraceInfo {
        let messages = self.get_trace_messages(trace_id);
        TraceInfo {
            trace_id: trace_id.to_string(),
            start_time: messages.first().map(|m| m.timestamp),
            end_time: messages.last().map(|m| m.timestamp),
            backend: messages.first().map(|m| m.backend.clone()),
            messages,
        }
    }

    /// Latest record per message id, in first-seen order.
    pub fn get_message_history(&self) -> Vec<MessageMetadata> {
        let index = lock(&self.index);
        index
            .id_order
            .iter()
            .filter_map(|id| index.by_id.get(id).cloned())
            .collect()
    }

    /// Trace ids in first-seen order.
    pub fn get_trace_ids(&self) -> Vec<String> {
        lock(&self.index).trace_order.clone()
    }

    pub fn clear_history(&self) {
        *lock(&self.index) = TraceIndex::default();
    }

    /// Headers that carry the trace across an HTTP hop.
    pub fn create_tracing_headers(
        &self,
        trace_id: &str,
        span_id: &str,
        message_id: &str,
        enable_datadog: bool,
    ) -> BTreeMap<String, String> {
        create_tracing_headers(trace_id, span_id, message_id, enable_datadog)
    }
}

impl std::fmt::Debug for MessageTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = lock(&self.index);
        f.debug_struct("MessageTracer")
            .field("messages", &index.by_id.len())
            .field("traces", &index.trace_order.len())
            .finish()
    }
}

/// Headers that carry the trace across an HTTP hop.
pub fn create_tracing_headers(
    trace_id: &str,
    span_id: &str,
    message_id: &str,
    enable_datadog: bool,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(TRACE_ID_HEADER.to_string(), trace_id.to_string());
    headers.insert(SPAN_ID_HEADER.to_string(), span_id.to_string());
    headers.insert(MESSAGE_ID_HEADER.to_string(), message_id.to_string());

    if enable_datadog {
        headers.insert("x-datadog-trace-id".to_string(), trace_id.to_string());
        headers.insert("x-datadog-parent-id".to_string(), span_id.to_string());
        headers.insert("x-datadog-sampling-priority".to_string(), "1".to_string());
    }

    headers
}

fn generate_id(prefix: &str) -> String {
    format!(
        "{prefix}_{}_{}",
        Utc::now().timestamp_millis(),
        random_suffix(9)
    )
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = Uuid::new_v4().as_u128();
    (0..len)
        .map(|_| {
            let c = ALPHABET[(n % 36) as usize] as char;
            n /= 36;
            c
        })
        .collect()
}
