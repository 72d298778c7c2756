//! Registry of live tomes.
//!
//! # Guarantees
//!
//! - A tome id is registered at most once; a second registration fails with
//!   [`TomeError::TomeAlreadyRegistered`] and leaves the first untouched
//! - `unregister_tome` stops the tome (and every machine tree in it) before
//!   removing it from the registry
//! - Registration never starts machines

use std::sync::Arc;

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{Tome, TomeConfig, TomeRoute, TomeStatusReport};
use crate::engine::Snapshot;
use crate::error::TomeError;
use crate::robotcopy::{MachineRegistration, RobotCopy};
use crate::storage::ViewStore;

/// Owns every registered [`Tome`]. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct TomeManager {
    tomes: Arc<DashMap<String, Arc<Tome>>>,
    stores: Arc<DashMap<String, Arc<dyn ViewStore>>>,
    robot_copy: Option<RobotCopy>,
}

impl TomeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store used by tomes whose `persistence.adapter` is `adapter`.
    pub fn with_store(self, adapter: impl Into<String>, store: Arc<dyn ViewStore>) -> Self {
        self.stores.insert(adapter.into(), store);
        self
    }

    /// RobotCopy handed to every machine and told about every machine definition.
    pub fn with_robot_copy(mut self, robot_copy: RobotCopy) -> Self {
        self.robot_copy = Some(robot_copy);
        self
    }

    pub fn robot_copy(&self) -> Option<&RobotCopy> {
        self.robot_copy.as_ref()
    }

    /// Build and register a tome. Its machines are constructed but not started.
    pub fn register_tome(&self, config: TomeConfig) -> Result<Arc<Tome>, TomeError> {
        let id = config.id.clone();
        if self.tomes.contains_key(&id) {
            return Err(TomeError::TomeAlreadyRegistered { id });
        }

        let db = if config.persistence.enabled {
            let adapter = config.persistence.adapter_name();
            let store = self.stores.get(adapter).map(|store| store.value().clone());
            if store.is_none() {
                warn!(tome = %id, adapter = %adapter, "No store registered for persistence adapter");
            }
            store
        } else {
            None
        };

        let tome = Arc::new(Tome::build(config, db, self.robot_copy.clone())?);

        match self.tomes.entry(id.clone()) {
            Entry::Occupied(_) => return Err(TomeError::TomeAlreadyRegistered { id }),
            Entry::Vacant(slot) => {
                slot.insert(tome.clone());
            }
        }

        if let Some(robot_copy) = &self.robot_copy {
            let registration = MachineRegistration {
                supported_brokers: robot_copy.broker_kinds(),
                auto_discovery: true,
                description: tome.config().description.clone(),
            };
            for machine in tome.machines().values() {
                robot_copy.register_machine(machine.id(), machine.engine(), registration.clone());
            }
        }

        info!(
            tome = %id,
            machines = tome.machines().len(),
            routes = tome.routes().len(),
            "Tome registered"
        );
        Ok(tome)
    }

    /// Stop the tome, then remove it.
    pub fn unregister_tome(&self, id: &str) -> Result<(), TomeError> {
        let tome = self.tome_or_err(id)?;
        tome.stop();
        self.tomes.remove(id);
        info!(tome = %id, "Tome unregistered");
        Ok(())
    }

    pub fn get_tome(&self, id: &str) -> Option<Arc<Tome>> {
        self.tomes.get(id).map(|entry| entry.value().clone())
    }

    pub fn start_tome(&self, id: &str) -> Result<(), TomeError> {
        self.tome_or_err(id)?.start();
        Ok(())
    }

    pub fn stop_tome(&self, id: &str) -> Result<(), TomeError> {
        self.tome_or_err(id)?.stop();
        Ok(())
    }

    /// Registered tome ids, sorted.
    pub fn list_tomes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tomes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Status of every tome, sorted by id.
    pub fn get_tome_status(&self) -> Vec<TomeStatusReport> {
        self.sorted_tomes()
            .iter()
            .map(|tome| tome.status_report())
            .collect()
    }

    pub async fn send_tome_message(
        &self,
        tome_id: &str,
        machine_key: &str,
        event: &str,
        data: Value,
    ) -> Result<Value> {
        let tome = self.tome_or_err(tome_id)?;
        tome.send_message(machine_key, event, data).await
    }

    pub fn get_tome_machine_state(&self, tome_id: &str, machine_key: &str) -> Result<Snapshot, TomeError> {
        self.tome_or_err(tome_id)?.get_state(machine_key)
    }

    pub fn update_tome_context(&self, tome_id: &str, updates: &Map<String, Value>) -> Result<(), TomeError> {
        self.tome_or_err(tome_id)?.update_context(updates);
        Ok(())
    }

    /// Mounted routes of every tome, tomes in id order.
    pub fn routes(&self) -> Vec<TomeRoute> {
        self.sorted_tomes()
            .iter()
            .flat_map(|tome| tome.routes().to_vec())
            .collect()
    }

    fn sorted_tomes(&self) -> Vec<Arc<Tome>> {
        let mut tomes: Vec<Arc<Tome>> = self.tomes.iter().map(|entry| entry.value().clone()).collect();
        tomes.sort_by(|a, b| a.id().cmp(b.id()));
        tomes
    }

    fn tome_or_err(&self, id: &str) -> Result<Arc<Tome>, TomeError> {
        self.get_tome(id)
            .ok_or_else(|| TomeError::TomeNotFound { id: id.to_string() })
    }
}

impl std::fmt::Debug for TomeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TomeManager")
            .field("tomes", &self.list_tomes())
            .field("stores", &self.stores.iter().map(|e| e.key().clone()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MachineDefinition, MachineStatus};
    use crate::storage::InMemoryViewStore;
    use crate::tome::{PersistenceConfig, TomeMachineConfig};
    use crate::view_machine::handler;
    use serde_json::json;

    fn definition() -> MachineDefinition {
        serde_json::from_value(json!({
            "id": "door",
            "initial": "closed",
            "states": {
                "closed": { "on": { "OPEN": "open" } },
                "open": { "on": { "CLOSE": "closed" } }
            }
        }))
        .unwrap()
    }

    fn config(id: &str) -> TomeConfig {
        TomeConfig::new(id, id).with_machine("door", TomeMachineConfig::new(format!("{id}-door"), definition()))
    }

    #[tokio::test]
    async fn test_register_does_not_start_and_rejects_duplicates() {
        let manager = TomeManager::new();
        let tome = manager.register_tome(config("house")).unwrap();
        assert_eq!(
            tome.get_machine("door").unwrap().status(),
            MachineStatus::NotStarted
        );

        let err = manager.register_tome(config("house")).unwrap_err();
        assert!(matches!(err, TomeError::TomeAlreadyRegistered { .. }));
        assert!(Arc::ptr_eq(&tome, &manager.get_tome("house").unwrap()));
    }

    #[tokio::test]
    async fn test_unregister_stops_before_removal() {
        let manager = TomeManager::new();
        let tome = manager.register_tome(config("house")).unwrap();
        manager.start_tome("house").unwrap();
        let door = tome.get_machine("door").unwrap().clone();
        assert_eq!(door.status(), MachineStatus::Running);

        manager.unregister_tome("house").unwrap();
        assert_eq!(door.status(), MachineStatus::Stopped);
        assert!(manager.get_tome("house").is_none());
        assert!(matches!(
            manager.unregister_tome("house"),
            Err(TomeError::TomeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_messages_state_and_status() {
        let manager = TomeManager::new();
        manager.register_tome(config("b")).unwrap();
        manager.register_tome(config("a")).unwrap();
        manager.start_tome("a").unwrap();

        manager
            .send_tome_message("a", "door", "OPEN", Value::Null)
            .await
            .unwrap();
        assert_eq!(manager.get_tome_machine_state("a", "door").unwrap().value, "open");

        manager
            .update_tome_context("a", json!({ "owner": "sam" }).as_object().unwrap())
            .unwrap();

        assert_eq!(manager.list_tomes(), vec!["a".to_string(), "b".to_string()]);
        let status = manager.get_tome_status();
        assert_eq!(status[0].machines["door"].state, "open");
        assert_eq!(status[0].context["owner"], "sam");
        assert_eq!(status[0].machines["door"].context["owner"], "sam");

        let err = manager
            .send_tome_message("zzz", "door", "OPEN", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Tome zzz not found");
    }

    #[tokio::test]
    async fn test_persistence_store_is_wired() {
        let store = Arc::new(InMemoryViewStore::new());
        let manager = TomeManager::new().with_store("memory", store.clone());

        let config = config("p")
            .with_persistence(PersistenceConfig::enabled("memory"))
            .with_state_handler(
                "door",
                "open",
                handler(|ctx| async move {
                    ctx.log("opened").await;
                    Ok(Value::Null)
                }),
            );
        manager.register_tome(config).unwrap();
        manager.start_tome("p").unwrap();
        manager.send_tome_message("p", "door", "OPEN", Value::Null).await.unwrap();

        assert_eq!(store.len("logEntries"), 1);

        let missing = manager.register_tome(config_with_adapter("q", "redis"));
        assert!(missing.is_ok());
    }

    fn config_with_adapter(id: &str, adapter: &str) -> TomeConfig {
        config(id).with_persistence(PersistenceConfig::enabled(adapter))
    }

    #[tokio::test]
    async fn test_robot_copy_discovers_machines() {
        let robot = RobotCopy::default();
        let manager = TomeManager::new().with_robot_copy(robot.clone());
        manager.register_tome(config("house")).unwrap();

        let discovery = robot.discover();
        assert_eq!(discovery.machines, vec!["house-door".to_string()]);
        assert_eq!(
            discovery.capabilities["house-door"].states,
            vec!["closed".to_string(), "open".to_string()]
        );
    }
}
