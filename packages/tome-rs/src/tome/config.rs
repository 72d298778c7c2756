//! Tome configuration.
//!
//! The serializable part is plain camelCase JSON with defaults applied during
//! deserialization, so any subset of the recognized options is accepted.
//! Behaviour that cannot be serialized (state handlers, guards and actions,
//! route transformers) is attached with builder methods and skipped by serde.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{MachineDefinition, MachineOptions};
use crate::storage::ViewStorageConfig;
use crate::view_machine::StateHandler;

/// Rewrites a route payload (input) or a handler result (output).
pub type Transformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Build a [`Transformer`] from a closure.
pub fn transformer<F>(f: F) -> Transformer
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Tome
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TomeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Machines keyed by their key within the tome.
    #[serde(default)]
    pub machines: BTreeMap<String, TomeMachineConfig>,
    /// Shared context merged under every machine's own context.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub graphql: GraphQlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(skip)]
    hooks: TomeHooks,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl TomeConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: default_version(),
            machines: BTreeMap::new(),
            context: Map::new(),
            routing: None,
            dependencies: Vec::new(),
            graphql: GraphQlConfig::default(),
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
            monitoring: MonitoringConfig::default(),
            hooks: TomeHooks::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_machine(mut self, key: impl Into<String>, machine: TomeMachineConfig) -> Self {
        self.machines.insert(key.into(), machine);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Attach a handler to `state` of the machine under `machine_key`.
    pub fn with_state_handler(
        mut self,
        machine_key: impl Into<String>,
        state: impl Into<String>,
        handler: StateHandler,
    ) -> Self {
        self.hooks
            .machine(machine_key.into())
            .handlers
            .push((state.into(), handler, None));
        self
    }

    /// Like [`TomeConfig::with_state_handler`] with a per-state storage override.
    pub fn with_state_storage(
        mut self,
        machine_key: impl Into<String>,
        state: impl Into<String>,
        handler: StateHandler,
        storage: ViewStorageConfig,
    ) -> Self {
        self.hooks
            .machine(machine_key.into())
            .handlers
            .push((state.into(), handler, Some(storage)));
        self
    }

    /// Named guards and actions for the machine under `machine_key`.
    pub fn with_machine_options(mut self, machine_key: impl Into<String>, options: MachineOptions) -> Self {
        self.hooks.machine(machine_key.into()).options = options;
        self
    }

    /// Base storage config for the machine under `machine_key`.
    pub fn with_machine_storage(mut self, machine_key: impl Into<String>, storage: ViewStorageConfig) -> Self {
        self.hooks.machine(machine_key.into()).storage = Some(storage);
        self
    }

    /// Rewrite the route payload before it reaches the machine.
    pub fn with_input_transformer(mut self, machine_key: impl Into<String>, f: Transformer) -> Self {
        self.hooks.input.insert(machine_key.into(), f);
        self
    }

    /// Rewrite the handler result before it is returned by the route.
    pub fn with_output_transformer(mut self, machine_key: impl Into<String>, f: Transformer) -> Self {
        self.hooks.output.insert(machine_key.into(), f);
        self
    }

    /// Where this tome's routes are mounted: `routing.basePath` or `/api/{id}`.
    pub fn mount_path(&self) -> String {
        self.routing
            .as_ref()
            .and_then(|routing| routing.base_path.clone())
            .unwrap_or_else(|| format!("/api/{}", self.id))
    }

    pub(crate) fn hooks(&self) -> &TomeHooks {
        &self.hooks
    }
}

impl std::fmt::Debug for TomeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TomeConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .field("routing", &self.routing)
            .field("persistence", &self.persistence)
            .finish()
    }
}

// =============================================================================
// Machines
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TomeMachineConfig {
    /// Machine id; also the id used by routers and discovery.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub definition: MachineDefinition,
    /// Overrides the tome context for this machine.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TomeMachineConfig {
    pub fn new(id: impl Into<String>, definition: MachineDefinition) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            definition,
            context: Map::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

#[derive(Clone, Default)]
pub(crate) struct MachineHooks {
    pub(crate) handlers: Vec<(String, StateHandler, Option<ViewStorageConfig>)>,
    pub(crate) options: MachineOptions,
    pub(crate) storage: Option<ViewStorageConfig>,
}

#[derive(Clone, Default)]
pub(crate) struct TomeHooks {
    pub(crate) machines: BTreeMap<String, MachineHooks>,
    pub(crate) input: HashMap<String, Transformer>,
    pub(crate) output: HashMap<String, Transformer>,
}

impl TomeHooks {
    fn machine(&mut self, key: String) -> &mut MachineHooks {
        self.machines.entry(key).or_default()
    }
}

// =============================================================================
// Routing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Mount point; `/api/{tomeId}` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    /// Route bindings keyed by machine key.
    #[serde(default)]
    pub routes: BTreeMap<String, TomeBinding>,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default = "default_true")]
    pub cors: bool,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            routes: BTreeMap::new(),
            middleware: Vec::new(),
            cors: true,
            rate_limit: RateLimitConfig::default(),
            authentication: AuthenticationConfig::default(),
        }
    }
}

impl RoutingConfig {
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_route(mut self, machine_key: impl Into<String>, binding: TomeBinding) -> Self {
        self.routes.insert(machine_key.into(), binding);
        self
    }
}

/// One machine exposed under `{basePath}{path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TomeBinding {
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub middleware: Vec<String>,
    #[serde(default)]
    pub guards: Vec<String>,
}

impl TomeBinding {
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: HttpMethod::Post,
            middleware: Vec::new(),
            guards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max: u32,
}

fn default_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_requests() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max: default_max_requests(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AuthKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    Jwt,
    ApiKey,
    Session,
}

// =============================================================================
// Ancillary sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default = "default_true")]
    pub subscriptions: bool,
}

impl Default for GraphQlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schema: None,
            subscriptions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_transports")]
    pub transports: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_transports() -> Vec<String> {
    vec!["console".to_string()]
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            transports: default_transports(),
        }
    }
}

/// Which registered store backs the tome's machines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Adapter name (`duckdb`, `dynamodb`, `redis`, `memcache`, `memory`, ...).
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl PersistenceConfig {
    pub fn enabled(adapter: impl Into<String>) -> Self {
        Self {
            enabled: true,
            adapter: Some(adapter.into()),
            config: Map::new(),
        }
    }

    /// Adapter name, `memory` when unset.
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_deref().unwrap_or("memory")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    #[serde(default = "default_true")]
    pub tracing: bool,
    #[serde(default = "default_health_checks")]
    pub health_checks: Vec<String>,
}

fn default_metrics() -> Vec<String> {
    ["requests", "errors", "performance"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_health_checks() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics: default_metrics(),
            tracing: true,
            health_checks: default_health_checks(),
        }
    }
}

fn default_true() -> bool {
    true
}
