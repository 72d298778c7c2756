//! State machine engine adapter.
//!
//! The view layer never invents states: it attaches behavior to whatever the
//! engine's definition declares. This module provides the seam ([`StateEngine`])
//! and a definition-driven implementation ([`DefinitionEngine`]) that reads the
//! familiar statechart JSON shape:
//!
//! ```json
//! {
//!   "id": "burger",
//!   "initial": "idle",
//!   "context": { "orders": 0 },
//!   "on": { "RESET": "idle" },
//!   "states": {
//!     "idle":    { "on": { "START": "cooking" } },
//!     "cooking": { "on": { "DONE": { "target": "served", "actions": ["assign"] } } },
//!     "served":  { "type": "final" }
//!   }
//! }
//! ```
//!
//! # Key Properties
//!
//! - **Engine computes, interpreter owns**: [`StateEngine::transition`] is pure
//!   over `(snapshot, event)`; [`Interpreter`] holds the live snapshot and status
//! - **Root `on`** applies in every state unless the state overrides the event
//! - **Guards and actions are named** and resolved from [`MachineOptions`]
//! - **`assign`** is built in: merges an object payload into the context
//! - **`TRANSITION {to}`** jumps to a named state unless the state handles it explicitly

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::TomeError;
use crate::lock;
use crate::observable::{BehaviorSubject, Subscription};

/// Event type understood by every engine as "jump to `data.to`".
pub const TRANSITION_EVENT: &str = "TRANSITION";

/// Built-in action that merges an object event payload into the context.
pub const ASSIGN_ACTION: &str = "assign";

/// Maximum number of transition records kept on a snapshot.
const HISTORY_LIMIT: usize = 256;

// =============================================================================
// Events
// =============================================================================

/// An event delivered to a machine: a type plus an optional JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Event type, e.g. `"START"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl MachineEvent {
    /// Create an event with a payload.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Create an event without a payload.
    pub fn named(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }

    pub(crate) fn validate(&self) -> Result<(), TomeError> {
        if self.kind.trim().is_empty() {
            return Err(TomeError::InvalidEvent {
                reason: "event type must not be empty".into(),
            });
        }
        Ok(())
    }
}

impl From<&str> for MachineEvent {
    fn from(kind: &str) -> Self {
        Self::named(kind)
    }
}

// =============================================================================
// Definition
// =============================================================================

/// Declarative machine definition (statechart JSON shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDefinition {
    /// Definition id.
    pub id: String,
    /// Initial state name.
    pub initial: String,
    /// Initial extended state.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Transitions available in every state.
    #[serde(default)]
    pub on: BTreeMap<String, TransitionSpec>,
    /// State nodes keyed by name.
    #[serde(default)]
    pub states: BTreeMap<String, StateNode>,
}

/// A single state node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateNode {
    /// Outgoing transitions keyed by event type.
    #[serde(default)]
    pub on: BTreeMap<String, TransitionSpec>,
    /// `"final"` marks a terminal state.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Free-form metadata (e.g. `{"graphql": {...}}` used by discovery).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Child states. Kept so nested charts fail validation instead of being
    /// silently flattened; [`DefinitionEngine`] rejects a non-empty map.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub states: Map<String, Value>,
}

impl StateNode {
    /// True when the node is declared `type: "final"`.
    pub fn is_final(&self) -> bool {
        self.kind.as_deref() == Some("final")
    }
}

/// Transition shorthand forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransitionSpec {
    /// `"EVENT": "target"`
    Target(String),
    /// `"EVENT": { "target": ..., "guard": ..., "actions": [...] }`
    Detailed(TransitionDetail),
    /// `"EVENT": [ {...}, {...} ]` - first candidate whose guard passes wins.
    Choices(Vec<TransitionDetail>),
}

impl TransitionSpec {
    fn candidates(&self) -> Vec<TransitionDetail> {
        match self {
            TransitionSpec::Target(target) => vec![TransitionDetail {
                target: Some(target.clone()),
                ..Default::default()
            }],
            TransitionSpec::Detailed(detail) => vec![detail.clone()],
            TransitionSpec::Choices(choices) => choices.clone(),
        }
    }
}

/// Expanded transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDetail {
    /// Target state; `None` means an internal transition (actions only).
    #[serde(default)]
    pub target: Option<String>,
    /// Named guard from [`MachineOptions`].
    #[serde(default, alias = "cond")]
    pub guard: Option<String>,
    /// Named actions from [`MachineOptions`], run in order.
    #[serde(default)]
    pub actions: Vec<String>,
}

// =============================================================================
// Options (guards / actions)
// =============================================================================

/// Guard predicate over the context and the incoming event.
pub type Guard = Arc<dyn Fn(&Map<String, Value>, &MachineEvent) -> bool + Send + Sync>;

/// Context-mutating action.
pub type Action = Arc<dyn Fn(&mut Map<String, Value>, &MachineEvent) + Send + Sync>;

/// Named guard and action registries.
#[derive(Clone, Default)]
pub struct MachineOptions {
    guards: HashMap<String, Guard>,
    actions: HashMap<String, Action>,
}

impl MachineOptions {
    /// Empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named guard.
    pub fn with_guard<F>(mut self, name: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&Map<String, Value>, &MachineEvent) -> bool + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(guard));
        self
    }

    /// Register a named action.
    pub fn with_action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut Map<String, Value>, &MachineEvent) + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }
}

impl std::fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineOptions")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Lifecycle status of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    /// Constructed, `start()` not yet called.
    NotStarted,
    /// Accepting events.
    Running,
    /// `stop()` called; events are rejected.
    Stopped,
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before the event.
    pub from: String,
    /// State after the event.
    pub to: String,
    /// Event type that caused it.
    pub event: String,
}

/// Engine output: where the machine is and what it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Current state name.
    pub value: String,
    /// Extended state.
    pub context: Map<String, Value>,
    /// Applied transitions, oldest first (bounded).
    pub history: Vec<TransitionRecord>,
    /// Whether the last event was taken by a transition.
    pub changed: bool,
    /// Whether the current state is final.
    pub done: bool,
    /// Interpreter status at the time the snapshot was taken.
    pub status: MachineStatus,
}

impl Snapshot {
    /// True if the snapshot is in state `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.value == name
    }
}

// =============================================================================
// Engine seam
// =============================================================================

/// A state machine engine: computes the next snapshot from the current one.
///
/// Transition computation is modeled as async so an engine backed by a remote
/// or sandboxed interpreter can be swapped in.
#[async_trait]
pub trait StateEngine: Send + Sync {
    /// Definition id.
    fn id(&self) -> &str;

    /// The snapshot before any event.
    fn initial(&self) -> Snapshot;

    /// Compute the snapshot after `event`. Unhandled events return the current
    /// snapshot with `changed = false`.
    async fn transition(&self, current: &Snapshot, event: &MachineEvent) -> Result<Snapshot>;

    /// All declared state names.
    fn state_names(&self) -> Vec<String>;

    /// True if `name` is a declared state.
    fn has_state(&self, name: &str) -> bool {
        self.state_names().iter().any(|s| s == name)
    }

    /// The declarative definition, if this engine has one.
    fn definition(&self) -> Option<&MachineDefinition> {
        None
    }
}

/// [`StateEngine`] driven by a [`MachineDefinition`].
///
/// Flat charts only: every state is a direct child of the root. A state that
/// declares its own `states` is rejected with [`TomeError::InvalidDefinition`].
/// Model nesting with sub-machines instead.
#[derive(Debug, Clone)]
pub struct DefinitionEngine {
    definition: MachineDefinition,
    options: MachineOptions,
}

impl DefinitionEngine {
    /// Validate `definition` and build an engine over it.
    pub fn new(definition: MachineDefinition, options: MachineOptions) -> Result<Self, TomeError> {
        let invalid = |reason: String| TomeError::InvalidDefinition {
            machine: definition.id.clone(),
            reason,
        };

        if !definition.states.contains_key(&definition.initial) {
            return Err(invalid(format!(
                "initial state '{}' is not declared",
                definition.initial
            )));
        }

        if let Some((name, _)) = definition.states.iter().find(|(_, node)| !node.states.is_empty()) {
            return Err(invalid(format!(
                "state '{name}' declares nested states; only flat machines are supported"
            )));
        }

        let root = definition.on.iter().map(|(event, spec)| ("<root>", event, spec));
        let nested = definition.states.iter().flat_map(|(name, node)| {
            node.on
                .iter()
                .map(move |(event, spec)| (name.as_str(), event, spec))
        });
        for (state, event, spec) in root.chain(nested) {
            for candidate in spec.candidates() {
                if let Some(target) = &candidate.target {
                    if !definition.states.contains_key(target) {
                        return Err(invalid(format!(
                            "state '{state}' event '{event}' targets unknown state '{target}'"
                        )));
                    }
                }
            }
        }

        Ok(Self {
            definition,
            options,
        })
    }

    /// Parse and validate a JSON definition.
    pub fn from_json(value: Value, options: MachineOptions) -> Result<Self> {
        let definition: MachineDefinition = serde_json::from_value(value)?;
        Ok(Self::new(definition, options)?)
    }

    fn guard_passes(&self, guard: Option<&str>, context: &Map<String, Value>, event: &MachineEvent) -> bool {
        let Some(name) = guard else {
            return true;
        };
        match self.options.guards.get(name) {
            Some(guard) => guard(context, event),
            None => {
                warn!(machine = %self.definition.id, guard = name, "unknown guard, treating as false");
                false
            }
        }
    }

    fn run_action(&self, name: &str, context: &mut Map<String, Value>, event: &MachineEvent) {
        if name == ASSIGN_ACTION {
            if let Value::Object(data) = &event.data {
                for (k, v) in data {
                    context.insert(k.clone(), v.clone());
                }
            }
            return;
        }
        match self.options.actions.get(name) {
            Some(action) => action(context, event),
            None => warn!(machine = %self.definition.id, action = name, "unknown action, skipped"),
        }
    }

    fn lookup(&self, state: &str, event: &str) -> Option<&TransitionSpec> {
        self.definition
            .states
            .get(state)
            .and_then(|node| node.on.get(event))
            .or_else(|| self.definition.on.get(event))
    }

    fn is_final(&self, state: &str) -> bool {
        self.definition
            .states
            .get(state)
            .map(StateNode::is_final)
            .unwrap_or(false)
    }
}

#[async_trait]
impl StateEngine for DefinitionEngine {
    fn id(&self) -> &str {
        &self.definition.id
    }

    fn initial(&self) -> Snapshot {
        Snapshot {
            value: self.definition.initial.clone(),
            context: self.definition.context.clone(),
            history: Vec::new(),
            changed: false,
            done: self.is_final(&self.definition.initial),
            status: MachineStatus::NotStarted,
        }
    }

    async fn transition(&self, current: &Snapshot, event: &MachineEvent) -> Result<Snapshot> {
        let mut next = current.clone();
        next.changed = false;

        if current.done {
            debug!(machine = %self.definition.id, state = %current.value, event = %event.kind, "final state ignores event");
            return Ok(next);
        }

        let chosen = match self.lookup(&current.value, &event.kind) {
            Some(spec) => spec
                .candidates()
                .into_iter()
                .find(|c| self.guard_passes(c.guard.as_deref(), &current.context, event)),
            None if event.kind == TRANSITION_EVENT => event
                .data
                .get("to")
                .and_then(Value::as_str)
                .filter(|to| self.definition.states.contains_key(*to))
                .map(|to| TransitionDetail {
                    target: Some(to.to_string()),
                    ..Default::default()
                }),
            None => None,
        };

        let Some(chosen) = chosen else {
            return Ok(next);
        };

        for action in &chosen.actions {
            self.run_action(action, &mut next.context, event);
        }

        if let Some(target) = chosen.target {
            next.history.push(TransitionRecord {
                from: current.value.clone(),
                to: target.clone(),
                event: event.kind.clone(),
            });
            if next.history.len() > HISTORY_LIMIT {
                let overflow = next.history.len() - HISTORY_LIMIT;
                next.history.drain(..overflow);
            }
            next.done = self.is_final(&target);
            next.value = target;
        }

        next.changed = true;
        Ok(next)
    }

    fn state_names(&self) -> Vec<String> {
        self.definition.states.keys().cloned().collect()
    }

    fn has_state(&self, name: &str) -> bool {
        self.definition.states.contains_key(name)
    }

    fn definition(&self) -> Option<&MachineDefinition> {
        Some(&self.definition)
    }
}

// =============================================================================
// Interpreter
// =============================================================================

/// Owns the live snapshot of one engine and its start/stop lifecycle.
pub struct Interpreter {
    engine: Arc<dyn StateEngine>,
    snapshot: Mutex<Snapshot>,
    snapshots: BehaviorSubject<Snapshot>,
}

impl Interpreter {
    /// Wrap an engine; the interpreter starts in [`MachineStatus::NotStarted`].
    pub fn new(engine: Arc<dyn StateEngine>) -> Self {
        let initial = engine.initial();
        Self {
            snapshots: BehaviorSubject::new(initial.clone()),
            snapshot: Mutex::new(initial),
            engine,
        }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &Arc<dyn StateEngine> {
        &self.engine
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        lock(&self.snapshot).clone()
    }

    /// Current status.
    pub fn status(&self) -> MachineStatus {
        lock(&self.snapshot).status
    }

    /// Activate; idempotent.
    pub fn start(&self) {
        self.set_status(MachineStatus::Running);
    }

    /// Deactivate; further events are rejected.
    pub fn stop(&self) {
        self.set_status(MachineStatus::Stopped);
    }

    fn set_status(&self, status: MachineStatus) {
        let snapshot = {
            let mut current = lock(&self.snapshot);
            if current.status == status {
                return;
            }
            current.status = status;
            current.clone()
        };
        self.snapshots.next(snapshot);
    }

    /// Apply an event. Returns `None` when the interpreter is not running,
    /// including when it was stopped while the engine was computing.
    ///
    /// Context keys written by [`Interpreter::update_context`] during the
    /// engine await are carried into the new snapshot. Concurrent `send`s are
    /// not serialized here; [`crate::ViewStateMachine`] does that.
    pub async fn send(&self, event: &MachineEvent) -> Result<Option<Snapshot>> {
        let current = self.snapshot();
        if current.status != MachineStatus::Running {
            return Ok(None);
        }

        let mut next = self.engine.transition(&current, event).await?;

        {
            let mut slot = lock(&self.snapshot);
            if slot.status != MachineStatus::Running {
                return Ok(None);
            }
            for (key, value) in &slot.context {
                if current.context.get(key) != Some(value) {
                    next.context.insert(key.clone(), value.clone());
                }
            }
            next.status = MachineStatus::Running;
            *slot = next.clone();
        }
        self.snapshots.next(next.clone());
        Ok(Some(next))
    }

    /// Merge `updates` into the context.
    pub fn update_context(&self, updates: &Map<String, Value>) {
        let snapshot = {
            let mut current = lock(&self.snapshot);
            for (k, v) in updates {
                current.context.insert(k.clone(), v.clone());
            }
            current.clone()
        };
        self.snapshots.next(snapshot);
    }

    /// Observe snapshots; the callback receives the current one immediately.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.snapshots.subscribe(callback)
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("engine", &self.engine.id())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
