//! View storage: the pluggable document store behind `StateContext::db`.
//!
//! # The Contract
//!
//! 1. **Query on entry.** When a machine arrives in a state whose effective
//!    [`ViewStorageConfig`] names a `find` or `findOne` selector, the query runs
//!    before the state's handler and the rows are handed to it.
//!
//! 2. **Failures are swallowed.** A failing query yields `results = []` and
//!    `result = None`. The failure text is surfaced as `query_error` so a handler
//!    can tell "nothing found" from "store down" if it cares to.
//!
//! 3. **Logs are mirrored best-effort.** Each log entry is inserted into the log
//!    collection independently. An insert failure never undoes the in-memory
//!    append.
//!
//! The framework never mutates query results and never wraps operations in a
//! transaction; concurrency control belongs to the store.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use anyhow::Result;

/// Default collection for view documents.
pub const DEFAULT_COLLECTION: &str = "views";

/// Default collection for mirrored log entries.
pub const DEFAULT_LOG_COLLECTION: &str = "logEntries";

// =============================================================================
// Store trait
// =============================================================================

/// A document store that machines can query on state entry and mirror logs into.
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// All documents in `collection` matching `selector`.
    async fn find(&self, collection: &str, selector: &Value) -> Result<Vec<Value>>;

    /// First document in `collection` matching `selector`.
    async fn find_one(&self, collection: &str, selector: &Value) -> Result<Option<Value>> {
        Ok(self.find(collection, selector).await?.into_iter().next())
    }

    /// Append a document to `collection`.
    async fn insert(&self, collection: &str, document: Value) -> Result<()>;
}

/// In-process [`ViewStore`] backed by a concurrent map of collections.
///
/// Selectors match shallowly: every top-level key in the selector must be
/// present in the document with an equal value. `null` or `{}` matches all.
#[derive(Debug, Default)]
pub struct InMemoryViewStore {
    collections: DashMap<String, Vec<Value>>,
}

impl InMemoryViewStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|docs| docs.len()).unwrap_or(0)
    }

    /// True when `collection` has no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn matches_selector(document: &Value, selector: &Value) -> bool {
    match selector {
        Value::Null => true,
        Value::Object(fields) => fields
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected)),
        other => document == other,
    }
}

#[async_trait]
impl ViewStore for InMemoryViewStore {
    async fn find(&self, collection: &str, selector: &Value) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_selector(doc, selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, document: Value) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }
}

// =============================================================================
// Config
// =============================================================================

/// Storage settings for a machine, or a per-state override of them.
///
/// Every field is optional so an override can name only what it changes;
/// [`ViewStorageConfig::merged`] layers an override on a base.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStorageConfig {
    /// Collection queried on state entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Collection log entries are mirrored into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<String>,
    /// Selector for a multi-row query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<Value>,
    /// Selector for a single-row query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find_one: Option<Value>,
    /// Document schema, passed through to handlers untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Defaults for log metadata keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_metadata_schema: Option<Value>,
}

impl ViewStorageConfig {
    /// Query the given selector with `find`.
    pub fn find(selector: Value) -> Self {
        Self {
            find: Some(selector),
            ..Default::default()
        }
    }

    /// Query the given selector with `findOne`.
    pub fn find_one(selector: Value) -> Self {
        Self {
            find_one: Some(selector),
            ..Default::default()
        }
    }

    /// Set the query collection.
    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Set the log collection.
    pub fn with_log_collection(mut self, collection: impl Into<String>) -> Self {
        self.log_collection = Some(collection.into());
        self
    }

    /// Set the log metadata schema.
    pub fn with_log_metadata_schema(mut self, schema: Value) -> Self {
        self.log_metadata_schema = Some(schema);
        self
    }

    /// Effective query collection.
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or(DEFAULT_COLLECTION)
    }

    /// Effective log collection.
    pub fn log_collection_name(&self) -> &str {
        self.log_collection.as_deref().unwrap_or(DEFAULT_LOG_COLLECTION)
    }

    /// Layer `state` on top of `self`; keys set in `state` win.
    pub fn merged(&self, state: &ViewStorageConfig) -> ViewStorageConfig {
        ViewStorageConfig {
            collection: state.collection.clone().or_else(|| self.collection.clone()),
            log_collection: state
                .log_collection
                .clone()
                .or_else(|| self.log_collection.clone()),
            find: state.find.clone().or_else(|| self.find.clone()),
            find_one: state.find_one.clone().or_else(|| self.find_one.clone()),
            schema: state.schema.clone().or_else(|| self.schema.clone()),
            log_metadata_schema: state
                .log_metadata_schema
                .clone()
                .or_else(|| self.log_metadata_schema.clone()),
        }
    }

    /// Combine an optional base with an optional per-state override.
    pub fn effective(
        base: Option<&ViewStorageConfig>,
        state: Option<&ViewStorageConfig>,
    ) -> Option<ViewStorageConfig> {
        match (base, state) {
            (Some(base), Some(state)) => Some(base.merged(state)),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        }
    }

    /// Fill absent metadata keys from `logMetadataSchema`.
    ///
    /// Accepts either `{"properties": {key: {"default": v}}}` or the flat
    /// `{key: {"default": v}}` form.
    pub fn apply_metadata_defaults(&self, metadata: &mut Map<String, Value>) {
        let Some(schema) = &self.log_metadata_schema else {
            return;
        };
        let fields = schema
            .get("properties")
            .and_then(Value::as_object)
            .or_else(|| schema.as_object());
        let Some(fields) = fields else {
            return;
        };
        for (key, field) in fields {
            if metadata.contains_key(key) {
                continue;
            }
            if let Some(default) = field.get("default") {
                metadata.insert(key.clone(), default.clone());
            }
        }
    }
}

// =============================================================================
// Query execution
// =============================================================================

/// What a state-entry query produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    /// `findOne` row.
    pub result: Option<Value>,
    /// `find` rows.
    pub results: Vec<Value>,
    /// Text of a swallowed failure, if any.
    pub error: Option<String>,
}

/// Run the queries `config` requests against `db`, swallowing failures.
pub(crate) async fn run_queries(
    machine: &str,
    db: &dyn ViewStore,
    config: &ViewStorageConfig,
) -> QueryOutcome {
    let mut outcome = QueryOutcome::default();
    let collection = config.collection_name();

    if let Some(selector) = &config.find {
        match db.find(collection, selector).await {
            Ok(rows) => outcome.results = rows,
            Err(e) => {
                warn!(machine, collection, error = %e, "view storage find failed");
                outcome.error = Some(e.to_string());
            }
        }
    }

    if let Some(selector) = &config.find_one {
        match db.find_one(collection, selector).await {
            Ok(row) => outcome.result = row,
            Err(e) => {
                warn!(machine, collection, error = %e, "view storage findOne failed");
                outcome.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    if outcome.error.is_some() {
        outcome.result = None;
        outcome.results.clear();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl ViewStore for BrokenStore {
        async fn find(&self, _: &str, _: &Value) -> Result<Vec<Value>> {
            anyhow::bail!("connection refused")
        }

        async fn insert(&self, _: &str, _: Value) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_in_memory_find_matches_shallow_selector() {
        let store = InMemoryViewStore::new();
        store.insert("views", json!({"kind": "card", "n": 1})).await.unwrap();
        store.insert("views", json!({"kind": "list", "n": 2})).await.unwrap();
        store.insert("views", json!({"kind": "card", "n": 3})).await.unwrap();

        let cards = store.find("views", &json!({"kind": "card"})).await.unwrap();
        assert_eq!(cards.len(), 2);

        let all = store.find("views", &json!({})).await.unwrap();
        assert_eq!(all.len(), 3);

        let first = store.find_one("views", &json!({"n": 2})).await.unwrap();
        assert_eq!(first, Some(json!({"kind": "list", "n": 2})));

        assert!(store.find("missing", &Value::Null).await.unwrap().is_empty());
    }

    #[test]
    fn test_merge_prefers_state_keys() {
        let base = ViewStorageConfig::find(json!({"a": 1})).in_collection("base");
        let state = ViewStorageConfig::find(json!({"b": 2}));
        let merged = ViewStorageConfig::effective(Some(&base), Some(&state)).unwrap();

        assert_eq!(merged.find, Some(json!({"b": 2})));
        assert_eq!(merged.collection_name(), "base");
        assert_eq!(merged.log_collection_name(), DEFAULT_LOG_COLLECTION);
        assert!(ViewStorageConfig::effective(None, None).is_none());
    }

    #[test]
    fn test_metadata_defaults_fill_only_missing_keys() {
        let config = ViewStorageConfig::default().with_log_metadata_schema(json!({
            "properties": {
                "source": { "type": "string", "default": "ui" },
                "priority": { "type": "number", "default": 0 },
                "free": { "type": "string" }
            }
        }));
        let mut metadata = Map::new();
        metadata.insert("priority".into(), json!(5));
        config.apply_metadata_defaults(&mut metadata);

        assert_eq!(metadata.get("source"), Some(&json!("ui")));
        assert_eq!(metadata.get("priority"), Some(&json!(5)));
        assert!(!metadata.contains_key("free"));
    }

    #[tokio::test]
    async fn test_query_failure_is_swallowed() {
        let config = ViewStorageConfig::find(json!({})).merged(&ViewStorageConfig::find_one(json!({})));
        let outcome = run_queries("m", &BrokenStore, &config).await;
        assert!(outcome.results.is_empty());
        assert!(outcome.result.is_none());
        assert_eq!(outcome.error.as_deref(), Some("connection refused"));
    }
}
