//! Tome: a named group of machines behind one router and one context.
//!
//! A tome owns its machines. It builds them from a [`TomeConfig`], registers
//! each under its key in a private [`MachineRouter`] (so machines can address
//! siblings by key), cascades start/stop to every machine tree and exposes the
//! per-machine route handler the HTTP transport mounts.
//!
//! # Lifecycle
//!
//! ```text
//! Registered ──start()──► Started ──stop()──► Stopped ──(manager)──► removed
//! ```
//!
//! [`TomeManager`] owns removal and always stops a tome before dropping it.

mod config;
mod manager;

pub use config::{
    transformer, AuthKind, AuthenticationConfig, GraphQlConfig, HttpMethod, LoggingConfig,
    MonitoringConfig, PersistenceConfig, RateLimitConfig, RoutingConfig, TomeBinding, TomeConfig,
    TomeMachineConfig, Transformer,
};
pub use manager::TomeManager;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::engine::{MachineEvent, Snapshot};
use crate::error::TomeError;
use crate::lock;
use crate::observable::{BehaviorSubject, Subscription};
use crate::robotcopy::RobotCopy;
use crate::router::MachineRouter;
use crate::storage::ViewStore;
use crate::view_machine::{Renderable, ViewStateMachine, ViewStateMachineConfig};

/// Where a tome is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TomeLifecycle {
    Registered,
    Started,
    Stopped,
}

/// A mounted machine route.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TomeRoute {
    pub tome_id: String,
    pub machine_key: String,
    pub method: HttpMethod,
    /// Full path, mount point included.
    pub path: String,
}

/// Transport-neutral route reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Value,
}

/// Serializable state of one machine inside a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatusReport {
    pub state: String,
    pub context: Map<String, Value>,
}

/// Serializable summary of a tome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TomeStatusReport {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub lifecycle: TomeLifecycle,
    pub machines: BTreeMap<String, MachineStatusReport>,
    pub context: Map<String, Value>,
}

pub struct Tome {
    config: TomeConfig,
    machines: BTreeMap<String, ViewStateMachine>,
    router: MachineRouter,
    context: Mutex<Map<String, Value>>,
    lifecycle: Mutex<TomeLifecycle>,
    cave_synchronized: AtomicBool,
    routes: Vec<TomeRoute>,
    render_key: BehaviorSubject<String>,
    _key_subscriptions: Vec<Subscription>,
}

impl Tome {
    /// Build every machine in `config` (none started).
    ///
    /// Each machine's context is the tome context overridden by its own.
    /// Route bindings whose machine is missing, or whose path does not start
    /// with `/`, are skipped with a warning.
    pub fn build(
        config: TomeConfig,
        db: Option<Arc<dyn ViewStore>>,
        robot_copy: Option<RobotCopy>,
    ) -> Result<Self, TomeError> {
        let hooks = config.hooks();
        for key in hooks.machines.keys() {
            if !config.machines.contains_key(key) {
                warn!(tome = %config.id, machine = %key, "Handlers registered for unknown machine");
            }
        }

        let router = MachineRouter::new();
        let mut machines = BTreeMap::new();

        for (key, machine_config) in &config.machines {
            let mut definition = machine_config.definition.clone();
            let mut context = config.context.clone();
            context.extend(definition.context.clone());
            context.extend(machine_config.context.clone());
            definition.context = context;

            let machine_hooks = hooks.machines.get(key).cloned().unwrap_or_default();
            let mut vsm_config =
                ViewStateMachineConfig::from_definition_with(definition, machine_hooks.options)?
                    .with_id(machine_config.id.clone())
                    .with_tome(config.id.clone());

            for (state, handler, storage) in machine_hooks.handlers {
                vsm_config = match storage {
                    Some(storage) => vsm_config.with_state_storage(state, handler, storage),
                    None => vsm_config.with_state(state, handler),
                };
            }
            if let Some(storage) = machine_hooks.storage {
                vsm_config = vsm_config.with_storage(storage);
            }
            if let Some(db) = &db {
                vsm_config = vsm_config.with_db(db.clone());
            }
            if let Some(robot_copy) = &robot_copy {
                vsm_config = vsm_config.with_robot_copy(robot_copy.clone());
            }

            let machine = ViewStateMachine::new(vsm_config)?;
            machine.synchronize_with_tome();
            router.register(key.clone(), machine.clone());
            machines.insert(key.clone(), machine);
        }

        let routes = mount_routes(&config, &machines);

        let render_key = BehaviorSubject::new(compose_render_key(&config.id, &BTreeMap::new()));
        let keys = Arc::new(Mutex::new(BTreeMap::new()));
        let key_subscriptions = machines
            .iter()
            .map(|(key, machine)| {
                let key = key.clone();
                let keys = keys.clone();
                let subject = render_key.clone();
                let tome_id = config.id.clone();
                machine.observe_view_key(move |machine_key: &String| {
                    let composed = {
                        let mut keys = lock(&keys);
                        keys.insert(key.clone(), machine_key.clone());
                        compose_render_key(&tome_id, &keys)
                    };
                    subject.next(composed);
                })
            })
            .collect();

        Ok(Self {
            context: Mutex::new(config.context.clone()),
            config,
            machines,
            router,
            lifecycle: Mutex::new(TomeLifecycle::Registered),
            cave_synchronized: AtomicBool::new(false),
            routes,
            render_key,
            _key_subscriptions: key_subscriptions,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TomeConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> TomeLifecycle {
        *lock(&self.lifecycle)
    }

    /// Router holding every machine under its key.
    pub fn router(&self) -> &MachineRouter {
        &self.router
    }

    pub fn machines(&self) -> &BTreeMap<String, ViewStateMachine> {
        &self.machines
    }

    pub fn get_machine(&self, key: &str) -> Option<&ViewStateMachine> {
        self.machines.get(key)
    }

    /// Routes mounted for this tome.
    pub fn routes(&self) -> &[TomeRoute] {
        &self.routes
    }

    /// Start every machine tree.
    pub fn start(&self) {
        for machine in self.machines.values() {
            machine.start_tree();
        }
        *lock(&self.lifecycle) = TomeLifecycle::Started;
        info!(tome = %self.id(), machines = self.machines.len(), "Tome started");
    }

    /// Stop every machine tree.
    pub fn stop(&self) {
        for machine in self.machines.values() {
            machine.stop_tree();
        }
        *lock(&self.lifecycle) = TomeLifecycle::Stopped;
        info!(tome = %self.id(), "Tome stopped");
    }

    /// Send `event` to the machine under `machine_key`.
    pub async fn send_message(&self, machine_key: &str, event: &str, data: Value) -> Result<Value> {
        let machine = self.machine_or_err(machine_key)?;
        machine.send(MachineEvent::new(event, data)).await
    }

    pub fn get_state(&self, machine_key: &str) -> Result<Snapshot, TomeError> {
        Ok(self.machine_or_err(machine_key)?.get_state())
    }

    pub fn context(&self) -> Map<String, Value> {
        lock(&self.context).clone()
    }

    /// Merge `updates` into the tome context and into every machine's context.
    pub fn update_context(&self, updates: &Map<String, Value>) {
        lock(&self.context).extend(updates.clone());
        for machine in self.machines.values() {
            machine.update_context(updates);
        }
    }

    pub fn synchronize_with_cave(&self) {
        self.cave_synchronized.store(true, Ordering::SeqCst);
    }

    pub fn is_cave_synchronized(&self) -> bool {
        self.cave_synchronized.load(Ordering::SeqCst)
    }

    /// `{tomeId}[{machineKey,...}]` built from the live machine render keys.
    pub fn get_render_key(&self) -> String {
        self.render_key.value()
    }

    /// Observe render-key changes; called immediately with the current key.
    pub fn observe_render_key<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.render_key.subscribe(callback)
    }

    pub fn status_report(&self) -> TomeStatusReport {
        TomeStatusReport {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            version: self.config.version.clone(),
            lifecycle: self.lifecycle(),
            machines: self
                .machines
                .iter()
                .map(|(key, machine)| {
                    let snapshot = machine.get_state();
                    (
                        key.clone(),
                        MachineStatusReport {
                            state: snapshot.value,
                            context: snapshot.context,
                        },
                    )
                })
                .collect(),
            context: self.context(),
        }
    }

    /// Handle a route request for `machine_key` with a JSON body `{event, data}`.
    pub async fn handle_route(&self, machine_key: &str, body: Value) -> RouteResponse {
        let tome = self.id();
        let Some(event) = body
            .get("event")
            .and_then(Value::as_str)
            .filter(|event| !event.is_empty())
        else {
            return RouteResponse {
                status: 400,
                body: json!({ "error": "Event is required", "tome": tome, "machine": machine_key }),
            };
        };

        let hooks = self.config.hooks();
        let mut data = body.get("data").cloned().unwrap_or(Value::Null);
        if let Some(input) = hooks.input.get(machine_key) {
            data = input(data);
        }

        match self.send_message(machine_key, event, data).await {
            Ok(mut result) => {
                if let Some(output) = hooks.output.get(machine_key) {
                    result = output(result);
                }
                RouteResponse {
                    status: 200,
                    body: json!({
                        "success": true,
                        "tome": tome,
                        "machine": machine_key,
                        "event": event,
                        "result": result,
                        "timestamp": now_iso(),
                    }),
                }
            }
            Err(e) => {
                error!(tome = %tome, machine = %machine_key, event = %event, error = %e, "Route handler failed");
                RouteResponse {
                    status: 500,
                    body: json!({
                        "success": false,
                        "error": e.to_string(),
                        "tome": tome,
                        "machine": machine_key,
                        "timestamp": now_iso(),
                    }),
                }
            }
        }
    }

    fn machine_or_err(&self, machine_key: &str) -> Result<&ViewStateMachine, TomeError> {
        self.machines
            .get(machine_key)
            .ok_or_else(|| TomeError::MachineNotInTome {
                machine: machine_key.to_string(),
                tome: self.config.id.clone(),
            })
    }
}

impl std::fmt::Debug for Tome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tome")
            .field("id", &self.config.id)
            .field("lifecycle", &self.lifecycle())
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn mount_routes(config: &TomeConfig, machines: &BTreeMap<String, ViewStateMachine>) -> Vec<TomeRoute> {
    let Some(routing) = &config.routing else {
        return Vec::new();
    };
    let base = config.mount_path();
    let base = base.trim_end_matches('/');

    routing
        .routes
        .iter()
        .filter_map(|(machine_key, binding)| {
            if !machines.contains_key(machine_key) {
                warn!(tome = %config.id, machine = %machine_key, "Route bound to missing machine, skipping");
                return None;
            }
            if !binding.path.starts_with('/') {
                warn!(tome = %config.id, path = %binding.path, "Route path must start with '/', skipping");
                return None;
            }
            Some(TomeRoute {
                tome_id: config.id.clone(),
                machine_key: machine_key.clone(),
                method: binding.method,
                path: format!("{base}{}", binding.path),
            })
        })
        .collect()
}

fn compose_render_key(tome_id: &str, machine_keys: &BTreeMap<String, String>) -> String {
    let keys: Vec<&str> = machine_keys.values().map(String::as_str).collect();
    format!("{tome_id}[{}]", keys.join(","))
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MachineDefinition;
    use crate::view_machine::handler;

    fn toggle_definition() -> MachineDefinition {
        serde_json::from_value(json!({
            "id": "toggle",
            "initial": "idle",
            "context": { "count": 0 },
            "states": {
                "idle": { "on": { "START": "active" } },
                "active": { "on": { "STOP": "idle", "FAIL": "broken" } },
                "broken": {}
            }
        }))
        .unwrap()
    }

    fn tome_config() -> TomeConfig {
        TomeConfig::new("t", "Test tome")
            .with_context(json!({ "tenant": "acme", "count": 5 }).as_object().cloned().unwrap())
            .with_machine("run", TomeMachineConfig::new("runner", toggle_definition()))
            .with_routing(RoutingConfig::default().with_route("run", TomeBinding::post("/run")))
            .with_state_handler(
                "run",
                "active",
                handler(|ctx| async move {
                    ctx.view(json!({ "type": "banner" }));
                    Ok(json!({ "status": "active" }))
                }),
            )
            .with_state_handler(
                "run",
                "broken",
                handler(|_ctx| async move { Err(anyhow::anyhow!("boom")) }),
            )
    }

    #[tokio::test]
    async fn test_route_contract() {
        let tome = Tome::build(tome_config(), None, None).unwrap();
        tome.start();

        assert_eq!(tome.routes().len(), 1);
        assert_eq!(tome.routes()[0].path, "/api/t/run");

        let missing = tome.handle_route("run", json!({ "data": {} })).await;
        assert_eq!(missing.status, 400);
        assert_eq!(
            missing.body,
            json!({ "error": "Event is required", "tome": "t", "machine": "run" })
        );

        let ok = tome.handle_route("run", json!({ "event": "START" })).await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["success"], true);
        assert_eq!(ok.body["event"], "START");
        assert_eq!(ok.body["result"], json!({ "status": "active" }));
        assert!(ok.body["timestamp"].is_string());
        assert_eq!(tome.get_state("run").unwrap().value, "active");

        let failed = tome.handle_route("run", json!({ "event": "FAIL" })).await;
        assert_eq!(failed.status, 500);
        assert_eq!(failed.body["success"], false);
        assert_eq!(failed.body["error"], "boom");
        assert_eq!(failed.body["machine"], "run");
    }

    #[tokio::test]
    async fn test_context_layering_and_update() {
        let machine = TomeMachineConfig::new("runner", toggle_definition())
            .with_context(json!({ "count": 9 }).as_object().cloned().unwrap());
        let config = TomeConfig::new("t", "T")
            .with_context(json!({ "tenant": "acme", "count": 5 }).as_object().cloned().unwrap())
            .with_machine("run", machine);
        let tome = Tome::build(config, None, None).unwrap();

        let context = tome.get_machine("run").unwrap().get_context();
        assert_eq!(context["tenant"], "acme");
        assert_eq!(context["count"], 9);

        tome.update_context(json!({ "tenant": "globex" }).as_object().unwrap());
        assert_eq!(tome.context()["tenant"], "globex");
        assert_eq!(tome.get_machine("run").unwrap().get_context()["tenant"], "globex");
    }

    #[tokio::test]
    async fn test_unknown_machine_is_typed_error() {
        let tome = Tome::build(tome_config(), None, None).unwrap();
        let err = tome.send_message("nope", "START", Value::Null).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TomeError>(),
            Some(TomeError::MachineNotInTome { .. })
        ));
        assert_eq!(err.to_string(), "Machine nope not found in tome t");
    }

    #[tokio::test]
    async fn test_invalid_routes_are_skipped() {
        let routing = RoutingConfig::default()
            .with_base_path("/svc/")
            .with_route("run", TomeBinding::post("/run"))
            .with_route("ghost", TomeBinding::post("/ghost"))
            .with_route("run2", TomeBinding::post("no-slash"));
        let config = TomeConfig::new("t", "T")
            .with_machine("run", TomeMachineConfig::new("runner", toggle_definition()))
            .with_machine("run2", TomeMachineConfig::new("runner2", toggle_definition()))
            .with_routing(routing);

        let tome = Tome::build(config, None, None).unwrap();
        let paths: Vec<&str> = tome.routes().iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/svc/run"]);
    }

    #[tokio::test]
    async fn test_lifecycle_cascades_and_render_key_tracks_clears() {
        let tome = Tome::build(tome_config(), None, None).unwrap();
        assert_eq!(tome.lifecycle(), TomeLifecycle::Registered);
        assert_eq!(tome.get_render_key(), "t[runner]");

        tome.start();
        let machine = tome.get_machine("run").unwrap();
        assert_eq!(machine.status(), crate::engine::MachineStatus::Running);
        assert!(machine.is_tome_synchronized());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = tome.observe_render_key(move |key| sink.lock().unwrap().push(key.clone()));
        machine.clear();
        assert_eq!(tome.get_render_key(), "t[runner-clear1]");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["t[runner]".to_string(), "t[runner-clear1]".to_string()]
        );

        tome.stop();
        assert_eq!(tome.lifecycle(), TomeLifecycle::Stopped);
        assert_eq!(machine.status(), crate::engine::MachineStatus::Stopped);
    }
}
