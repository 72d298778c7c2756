//! Tome fixtures shared by the HTTP tests.

use serde_json::{json, Value};
use tome::tome::{RoutingConfig, TomeBinding};
use tome::{handler, MachineDefinition, TomeConfig, TomeMachineConfig, TomeManager};

/// idle --START--> active --STOP--> idle, active --FAIL--> broken
pub fn toggle_definition() -> MachineDefinition {
    serde_json::from_value(json!({
        "id": "toggle",
        "initial": "idle",
        "states": {
            "idle": { "on": { "START": "active" } },
            "active": { "on": { "STOP": "idle", "FAIL": "broken" } },
            "broken": {}
        }
    }))
    .expect("toggle definition is valid")
}

/// Tome `id` with machine `run` mounted at `POST /api/{id}/run`.
///
/// Arriving in `active` returns `{"status": "active", "input": data}`;
/// arriving in `broken` fails with `boom`.
pub fn toggle_tome(id: &str) -> TomeConfig {
    toggle_tome_with_routing(id, RoutingConfig::default())
}

pub fn toggle_tome_with_routing(id: &str, routing: RoutingConfig) -> TomeConfig {
    TomeConfig::new(id, format!("{id} tome"))
        .with_machine("run", TomeMachineConfig::new(format!("{id}-runner"), toggle_definition()))
        .with_routing(routing.with_route("run", TomeBinding::post("/run")))
        .with_state_handler(
            "run",
            "active",
            handler(|ctx| async move {
                ctx.view(json!({ "type": "banner", "text": "running" }));
                Ok(json!({ "status": "active", "input": ctx.event.data }))
            }),
        )
        .with_state_handler(
            "run",
            "broken",
            handler(|_ctx| async move { Err::<Value, _>(anyhow::anyhow!("boom")) }),
        )
}

/// Manager with the given tomes registered and started.
pub fn started_manager(configs: Vec<TomeConfig>) -> TomeManager {
    let manager = TomeManager::new();
    for config in configs {
        let id = config.id.clone();
        manager.register_tome(config).expect("tome registers");
        manager.start_tome(&id).expect("tome starts");
    }
    manager
}
