//! ViewStateMachine: a state machine whose states drive async view handlers.
//!
//! The engine decides where the machine goes; the machine decides what happens
//! when it gets there. Each state may carry one handler. On arrival the handler
//! receives a fresh [`StateContext`] with the model, the transition history,
//! any storage query results, and closures for logging, pushing views,
//! clearing, transitioning, spawning sub-machines and routed sends.
//!
//! # Per-transition algorithm
//!
//! 1. The engine computes the next snapshot (guards and actions included)
//! 2. The effective storage config is the machine's base merged with the
//!    per-state override registered alongside the handler
//! 3. `find`/`findOne` run against `db` if both are present; failures are
//!    swallowed into `query_error`
//! 4. A [`StateContext`] is built and the state's handler awaited
//! 5. No handler for the state is not an error; the transition is unobserved
//!
//! # Ordering
//!
//! External `send()` calls take a fair async lock, so even un-awaited
//! concurrent sends run in call order. A send issued from inside a handler to
//! a machine that is already processing further up the same call chain is
//! queued and runs once the current handler returns (run-to-completion).
//!
//! # Example
//!
//! ```ignore
//! let machine = ViewStateMachine::new(
//!     ViewStateMachineConfig::from_definition(definition)?
//!         .with_state("active", handler(|ctx| async move {
//!             ctx.log("activated").await;
//!             ctx.view(json!({"type": "banner", "text": "Active"}));
//!             Ok(json!({"status": "active"}))
//!         })),
//! )?;
//! machine.start();
//! let payload = machine.send("START").await?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{
    DefinitionEngine, Interpreter, MachineDefinition, MachineEvent, MachineOptions,
    MachineStatus, Snapshot, StateEngine, TransitionRecord, TRANSITION_EVENT,
};
use crate::error::TomeError;
use crate::lock;
use crate::observable::{BehaviorSubject, Subject, Subscription};
use crate::robotcopy::{BrokerKind, GraphQlOperation, RobotCopy};
use crate::router::{MachineRouter, WeakRouter};
use crate::storage::{run_queries, QueryOutcome, ViewStorageConfig, ViewStore};

tokio::task_local! {
    /// Machine ids currently processing an event in this call chain.
    static SEND_CHAIN: Vec<String>;
}

// =============================================================================
// Handlers
// =============================================================================

/// Async handler run when a machine arrives in a state.
pub type StateHandler =
    Arc<dyn Fn(StateContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Async handler for an incoming RobotCopy message type.
pub type IncomingHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`StateHandler`].
pub fn handler<F, Fut>(f: F) -> StateHandler
where
    F: Fn(StateContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Wrap an async closure as an [`IncomingHandler`].
pub fn incoming_handler<F, Fut>(f: F) -> IncomingHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

#[derive(Clone)]
struct StateRegistration {
    handler: StateHandler,
    storage: Option<ViewStorageConfig>,
}

// =============================================================================
// Logs and notices
// =============================================================================

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One entry in a machine's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Map<String, Value>,
}

/// Internal events a machine emits while handlers run.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineNotice {
    LogAdded(LogEntry),
    ViewAdded(Value),
    ViewCleared,
    SubMachineCreated(String),
}

impl MachineNotice {
    /// Wire name of the notice, e.g. `"LOG_ADDED"`.
    pub fn name(&self) -> &'static str {
        match self {
            MachineNotice::LogAdded(_) => "LOG_ADDED",
            MachineNotice::ViewAdded(_) => "VIEW_ADDED",
            MachineNotice::ViewCleared => "VIEW_CLEARED",
            MachineNotice::SubMachineCreated(_) => "SUB_MACHINE_CREATED",
        }
    }
}

// =============================================================================
// Render capability
// =============================================================================

/// Serializable output of [`Renderable::render`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTree {
    pub key: String,
    pub machine: String,
    pub state: String,
    pub model: Map<String, Value>,
    pub views: Vec<Value>,
    pub children: Vec<RenderTree>,
}

/// Operations only a locally executing machine can offer.
///
/// Proxies represent a remote capability and do not implement this.
pub trait Renderable {
    /// Current views, model and sub-machine renders.
    fn render(&self) -> RenderTree;

    /// Absorb `other`'s handlers, views and sub-machines (`other` wins collisions).
    fn compose(&self, other: &ViewStateMachine);

    /// Mark the machine as owned by a synchronized tome.
    fn synchronize_with_tome(&self);

    /// Current render key.
    fn render_key(&self) -> String;

    /// Observe render-key changes; called immediately with the current key.
    fn observe_render_key(&self, callback: Box<dyn Fn(&String) + Send + Sync>) -> Subscription;
}

// =============================================================================
// Config
// =============================================================================

/// Static construction parameters for a [`ViewStateMachine`].
#[derive(Clone)]
pub struct ViewStateMachineConfig {
    machine_id: String,
    engine: Arc<dyn StateEngine>,
    handlers: HashMap<String, StateRegistration>,
    storage: Option<ViewStorageConfig>,
    db: Option<Arc<dyn ViewStore>>,
    tome_id: Option<String>,
    render_key: Option<String>,
    robot_copy: Option<RobotCopy>,
    sub_machines: Vec<(String, ViewStateMachineConfig)>,
}

impl ViewStateMachineConfig {
    /// Config over an arbitrary engine; the machine id defaults to the engine id.
    pub fn new(engine: Arc<dyn StateEngine>) -> Self {
        Self {
            machine_id: engine.id().to_string(),
            engine,
            handlers: HashMap::new(),
            storage: None,
            db: None,
            tome_id: None,
            render_key: None,
            robot_copy: None,
            sub_machines: Vec::new(),
        }
    }

    /// Config over a declarative definition with no named guards or actions.
    pub fn from_definition(definition: MachineDefinition) -> Result<Self, TomeError> {
        Self::from_definition_with(definition, MachineOptions::new())
    }

    /// Config over a declarative definition with named guards and actions.
    pub fn from_definition_with(
        definition: MachineDefinition,
        options: MachineOptions,
    ) -> Result<Self, TomeError> {
        Ok(Self::new(Arc::new(DefinitionEngine::new(definition, options)?)))
    }

    /// Override the machine id.
    pub fn with_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = machine_id.into();
        self
    }

    /// Attach a handler to a state (last registration wins).
    pub fn with_state(mut self, state: impl Into<String>, handler: StateHandler) -> Self {
        self.handlers.insert(
            state.into(),
            StateRegistration {
                handler,
                storage: None,
            },
        );
        self
    }

    /// Attach a handler plus a storage override used on entry to that state.
    pub fn with_state_storage(
        mut self,
        state: impl Into<String>,
        handler: StateHandler,
        storage: ViewStorageConfig,
    ) -> Self {
        self.handlers.insert(
            state.into(),
            StateRegistration {
                handler,
                storage: Some(storage),
            },
        );
        self
    }

    /// Base storage config.
    pub fn with_storage(mut self, storage: ViewStorageConfig) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Document store behind `StateContext::db` and log mirroring.
    pub fn with_db(mut self, db: Arc<dyn ViewStore>) -> Self {
        self.db = Some(db);
        self
    }

    /// Declare the machine as part of a tome; views warn until synchronized.
    pub fn with_tome(mut self, tome_id: impl Into<String>) -> Self {
        self.tome_id = Some(tome_id.into());
        self
    }

    /// Base render key (defaults to the machine id).
    pub fn with_render_key(mut self, key: impl Into<String>) -> Self {
        self.render_key = Some(key.into());
        self
    }

    /// RobotCopy used for GraphQL operations.
    pub fn with_robot_copy(mut self, robot_copy: RobotCopy) -> Self {
        self.robot_copy = Some(robot_copy);
        self
    }

    /// Sub-machine constructed alongside this machine.
    pub fn with_sub_machine(mut self, id: impl Into<String>, config: ViewStateMachineConfig) -> Self {
        self.sub_machines.push((id.into(), config));
        self
    }

    /// The machine id this config produces.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// The engine behind this config.
    pub fn engine(&self) -> &Arc<dyn StateEngine> {
        &self.engine
    }

    pub(crate) fn has_db(&self) -> bool {
        self.db.is_some()
    }
}

impl std::fmt::Debug for ViewStateMachineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewStateMachineConfig")
            .field("machine_id", &self.machine_id)
            .field("states", &self.handlers.keys().collect::<Vec<_>>())
            .field("sub_machines", &self.sub_machines.len())
            .finish()
    }
}

// =============================================================================
// Machine
// =============================================================================

struct Inner {
    id: String,
    parent_id: Mutex<Option<String>>,
    interpreter: Interpreter,
    handlers: Mutex<HashMap<String, StateRegistration>>,
    incoming: Mutex<HashMap<String, IncomingHandler>>,
    views: Mutex<Vec<Value>>,
    logs: Mutex<Vec<LogEntry>>,
    sub_machines: Mutex<BTreeMap<String, ViewStateMachine>>,
    storage: Option<ViewStorageConfig>,
    db: Option<Arc<dyn ViewStore>>,
    router: Mutex<Option<WeakRouter>>,
    robot_copy: Mutex<Option<RobotCopy>>,
    tome_id: Option<String>,
    tome_synchronized: AtomicBool,
    render_base: String,
    clear_count: AtomicU64,
    render_key: BehaviorSubject<String>,
    notices: Subject<MachineNotice>,
    turn: tokio::sync::Mutex<()>,
    deferred: Mutex<VecDeque<MachineEvent>>,
}

/// A state machine with per-state async handlers, a view stack and a log.
///
/// Cheap to clone; clones share the same machine.
#[derive(Clone)]
pub struct ViewStateMachine {
    inner: Arc<Inner>,
}

impl ViewStateMachine {
    /// Build a machine (not started) and its configured sub-machines.
    pub fn new(config: ViewStateMachineConfig) -> Result<Self, TomeError> {
        for state in config.handlers.keys() {
            if !config.engine.has_state(state) {
                return Err(TomeError::UnknownState {
                    machine: config.machine_id.clone(),
                    state: state.clone(),
                });
            }
        }

        let render_base = config
            .render_key
            .clone()
            .unwrap_or_else(|| config.machine_id.clone());

        let machine = Self {
            inner: Arc::new(Inner {
                id: config.machine_id.clone(),
                parent_id: Mutex::new(None),
                interpreter: Interpreter::new(config.engine.clone()),
                handlers: Mutex::new(config.handlers),
                incoming: Mutex::new(HashMap::new()),
                views: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                sub_machines: Mutex::new(BTreeMap::new()),
                storage: config.storage,
                db: config.db,
                router: Mutex::new(None),
                robot_copy: Mutex::new(config.robot_copy),
                tome_id: config.tome_id,
                tome_synchronized: AtomicBool::new(false),
                render_key: BehaviorSubject::new(render_base.clone()),
                render_base,
                clear_count: AtomicU64::new(0),
                notices: Subject::new(),
                turn: tokio::sync::Mutex::new(()),
                deferred: Mutex::new(VecDeque::new()),
            }),
        };

        for (id, sub_config) in config.sub_machines {
            machine.sub_machine(id, sub_config)?;
        }

        Ok(machine)
    }

    /// Stable machine id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id of the machine that spawned this one, if any.
    pub fn parent_id(&self) -> Option<String> {
        lock(&self.inner.parent_id).clone()
    }

    pub(crate) fn set_parent_id(&self, parent: Option<String>) {
        *lock(&self.inner.parent_id) = parent;
    }

    /// True if both handles point at the same machine.
    pub fn ptr_eq(&self, other: &ViewStateMachine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Activate the interpreter. Sub-machines are not started.
    pub fn start(&self) {
        debug!(machine = %self.id(), "machine started");
        self.inner.interpreter.start();
    }

    /// Deactivate the interpreter; later sends are ignored with a warning.
    pub fn stop(&self) {
        debug!(machine = %self.id(), "machine stopped");
        self.inner.interpreter.stop();
    }

    /// Current interpreter status.
    pub fn status(&self) -> MachineStatus {
        self.inner.interpreter.status()
    }

    /// Current snapshot.
    pub fn get_state(&self) -> Snapshot {
        self.inner.interpreter.snapshot()
    }

    /// Current context (the handler-facing model).
    pub fn get_context(&self) -> Map<String, Value> {
        self.get_state().context
    }

    /// Merge `updates` into the context.
    pub fn update_context(&self, updates: &Map<String, Value>) {
        self.inner.interpreter.update_context(updates);
    }

    /// Observe state snapshots; called immediately with the current one.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.inner.interpreter.subscribe(callback)
    }

    /// Observe internal notices with the given name (e.g. `"LOG_ADDED"`).
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&MachineNotice) + Send + Sync + 'static,
    {
        let name = name.into();
        self.inner.notices.subscribe(move |notice| {
            if notice.name() == name {
                callback(notice);
            }
        })
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    /// Attach a handler to a declared state (last registration wins).
    pub fn with_state(&self, state: impl Into<String>, handler: StateHandler) -> Result<&Self, TomeError> {
        self.register_state(state.into(), StateRegistration { handler, storage: None })
    }

    /// Attach a handler plus a per-state storage override.
    pub fn with_state_storage(
        &self,
        state: impl Into<String>,
        handler: StateHandler,
        storage: ViewStorageConfig,
    ) -> Result<&Self, TomeError> {
        self.register_state(
            state.into(),
            StateRegistration {
                handler,
                storage: Some(storage),
            },
        )
    }

    fn register_state(&self, state: String, registration: StateRegistration) -> Result<&Self, TomeError> {
        if !self.inner.interpreter.engine().has_state(&state) {
            return Err(TomeError::UnknownState {
                machine: self.id().to_string(),
                state,
            });
        }
        lock(&self.inner.handlers).insert(state, registration);
        Ok(self)
    }

    /// States that currently have a handler.
    pub fn handled_states(&self) -> Vec<String> {
        let mut states: Vec<String> = lock(&self.inner.handlers).keys().cloned().collect();
        states.sort();
        states
    }

    /// Register a handler for an incoming RobotCopy message type.
    pub fn register_incoming_handler(&self, message_type: impl Into<String>, handler: IncomingHandler) {
        lock(&self.inner.incoming).insert(message_type.into(), handler);
    }

    /// Dispatch an incoming message; `None` if no handler is registered for its type.
    pub async fn handle_incoming(&self, message_type: &str, payload: Value) -> Result<Option<Value>> {
        let handler = lock(&self.inner.incoming).get(message_type).cloned();
        match handler {
            Some(handler) => Ok(Some(handler(payload).await?)),
            None => {
                debug!(machine = %self.id(), message_type, "no incoming handler");
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Send
    // -------------------------------------------------------------------------

    /// Deliver an event and run the arrived state's handler.
    ///
    /// Returns the handler's value, or a `{state, context}` summary when no
    /// handler ran. Handler errors propagate unchanged; the transition has
    /// already happened by then.
    pub async fn send(&self, event: impl Into<MachineEvent>) -> Result<Value> {
        let event = event.into();
        event.validate()?;

        let id = self.inner.id.clone();
        let in_chain = SEND_CHAIN
            .try_with(|chain| chain.contains(&id))
            .unwrap_or(false);

        if in_chain {
            debug!(machine = %id, event = %event.kind, "deferring re-entrant send");
            lock(&self.inner.deferred).push_back(event);
            return Ok(summary(&self.get_state()));
        }

        let mut chain = SEND_CHAIN.try_with(|chain| chain.clone()).unwrap_or_default();
        chain.push(id);
        let machine = self.clone();
        SEND_CHAIN
            .scope(chain, async move { machine.run_to_completion(event).await })
            .await
    }

    async fn run_to_completion(&self, event: MachineEvent) -> Result<Value> {
        let _turn = self.inner.turn.lock().await;

        let result = self.process(event).await;

        let mut deferred_error = None;
        loop {
            let next = lock(&self.inner.deferred).pop_front();
            let Some(next) = next else {
                break;
            };
            if let Err(e) = self.process(next).await {
                deferred_error.get_or_insert(e);
            }
        }

        match (result, deferred_error) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(e)) => Err(e),
            (Ok(value), None) => Ok(value),
        }
    }

    async fn process(&self, event: MachineEvent) -> Result<Value> {
        let Some(snapshot) = self.inner.interpreter.send(&event).await? else {
            warn!(
                machine = %self.id(),
                event = %event.kind,
                status = ?self.status(),
                "send ignored: machine is not running"
            );
            return Ok(summary(&self.get_state()));
        };

        if !snapshot.changed {
            debug!(machine = %self.id(), state = %snapshot.value, event = %event.kind, "event not handled");
            return Ok(summary(&snapshot));
        }

        self.enter_state(snapshot, event).await
    }

    async fn enter_state(&self, snapshot: Snapshot, event: MachineEvent) -> Result<Value> {
        let registration = lock(&self.inner.handlers).get(&snapshot.value).cloned();
        let Some(registration) = registration else {
            return Ok(summary(&snapshot));
        };

        let storage = ViewStorageConfig::effective(
            self.inner.storage.as_ref(),
            registration.storage.as_ref(),
        );

        let outcome = match (&self.inner.db, &storage) {
            (Some(db), Some(config)) if config.find.is_some() || config.find_one.is_some() => {
                run_queries(self.id(), db.as_ref(), config).await
            }
            _ => QueryOutcome::default(),
        };

        let ctx = StateContext {
            state: snapshot.value,
            model: snapshot.context,
            event,
            transitions: snapshot.history,
            result: outcome.result,
            results: outcome.results,
            query_error: outcome.error,
            db: self.inner.db.clone(),
            storage,
            machine: self.clone(),
        };

        debug!(machine = %self.id(), state = %ctx.state, "running state handler");
        (registration.handler)(ctx).await
    }

    // -------------------------------------------------------------------------
    // Views, logs, render key
    // -------------------------------------------------------------------------

    /// Append a log entry, mirroring it to the store when one is attached.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> LogEntry {
        let storage = self.current_storage();
        self.append_log(storage.as_ref(), level, message.into(), metadata)
            .await
    }

    async fn append_log(
        &self,
        storage: Option<&ViewStorageConfig>,
        level: LogLevel,
        message: String,
        mut metadata: Map<String, Value>,
    ) -> LogEntry {
        if let Some(storage) = storage {
            storage.apply_metadata_defaults(&mut metadata);
        }

        let entry = LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            message,
            metadata,
        };

        lock(&self.inner.logs).push(entry.clone());
        self.inner.notices.next(&MachineNotice::LogAdded(entry.clone()));

        if let Some(db) = &self.inner.db {
            let collection = storage
                .map(ViewStorageConfig::log_collection_name)
                .unwrap_or(crate::storage::DEFAULT_LOG_COLLECTION);
            let document = match serde_json::to_value(&entry) {
                Ok(Value::Object(mut doc)) => {
                    doc.insert("machineId".into(), Value::String(self.id().to_string()));
                    Value::Object(doc)
                }
                Ok(other) => other,
                Err(e) => {
                    warn!(machine = %self.id(), error = %e, "log entry not serializable");
                    return entry;
                }
            };
            if let Err(e) = db.insert(collection, document).await {
                warn!(machine = %self.id(), collection, error = %e, "log persistence failed");
            }
        }

        entry
    }

    fn current_storage(&self) -> Option<ViewStorageConfig> {
        let state = self.get_state().value;
        let per_state = lock(&self.inner.handlers)
            .get(&state)
            .and_then(|r| r.storage.clone());
        ViewStorageConfig::effective(self.inner.storage.as_ref(), per_state.as_ref())
    }

    /// Push a view onto the stack.
    pub fn view(&self, component: Value) {
        if self.inner.tome_id.is_some() && !self.is_tome_synchronized() {
            warn!(
                machine = %self.id(),
                tome = ?self.inner.tome_id,
                "view() on a tome machine that was never synchronized with its tome"
            );
        }
        lock(&self.inner.views).push(component.clone());
        self.inner.notices.next(&MachineNotice::ViewAdded(component));
    }

    /// Empty the view stack and bump the render key.
    pub fn clear(&self) {
        lock(&self.inner.views).clear();
        self.inner.notices.next(&MachineNotice::ViewCleared);
        self.inner.clear_count.fetch_add(1, Ordering::SeqCst);
        self.inner.render_key.next(self.get_render_key());
    }

    /// Current view stack.
    pub fn get_views(&self) -> Vec<Value> {
        lock(&self.inner.views).clone()
    }

    /// All log entries, oldest first.
    pub fn get_logs(&self) -> Vec<LogEntry> {
        lock(&self.inner.logs).clone()
    }

    /// `base` before any clear, `base-clearN` after the Nth.
    pub fn get_render_key(&self) -> String {
        match self.inner.clear_count.load(Ordering::SeqCst) {
            0 => self.inner.render_base.clone(),
            n => format!("{}-clear{}", self.inner.render_base, n),
        }
    }

    /// Observe render-key changes; called immediately with the current key.
    pub fn observe_view_key<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.render_key.subscribe(callback)
    }

    /// Whether `synchronize_with_tome` has been called.
    pub fn is_tome_synchronized(&self) -> bool {
        self.inner.tome_synchronized.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Sub-machines
    // -------------------------------------------------------------------------

    /// Construct a child machine and keep a reference to it.
    ///
    /// The child is independent: it is not started and receives no sends from
    /// the parent unless the caller wires them.
    pub fn sub_machine(
        &self,
        id: impl Into<String>,
        config: ViewStateMachineConfig,
    ) -> Result<ViewStateMachine, TomeError> {
        let id = id.into();
        let mut config = config.with_id(id.clone());
        if config.db.is_none() {
            config.db = self.inner.db.clone();
        }
        if config.robot_copy.is_none() {
            config.robot_copy = self.robot_copy();
        }

        let child = ViewStateMachine::new(config)?;
        child.set_parent_id(Some(self.id().to_string()));
        if let Some(router) = lock(&self.inner.router).clone() {
            child.attach_weak_router(router);
        }

        lock(&self.inner.sub_machines).insert(id.clone(), child.clone());
        self.inner
            .notices
            .next(&MachineNotice::SubMachineCreated(id));
        Ok(child)
    }

    /// A previously created child.
    pub fn get_sub_machine(&self, id: &str) -> Option<ViewStateMachine> {
        lock(&self.inner.sub_machines).get(id).cloned()
    }

    /// All children keyed by id.
    pub fn sub_machines(&self) -> BTreeMap<String, ViewStateMachine> {
        lock(&self.inner.sub_machines).clone()
    }

    /// Depth-first search of this machine and its descendants.
    pub fn find_descendant(&self, id: &str) -> Option<ViewStateMachine> {
        if self.id() == id {
            return Some(self.clone());
        }
        self.sub_machines()
            .values()
            .find_map(|child| child.find_descendant(id))
    }

    /// Start this machine and every descendant.
    pub fn start_tree(&self) {
        self.start();
        for child in self.sub_machines().values() {
            child.start_tree();
        }
    }

    /// Stop this machine and every descendant.
    pub fn stop_tree(&self) {
        self.stop();
        for child in self.sub_machines().values() {
            child.stop_tree();
        }
    }

    // -------------------------------------------------------------------------
    // Router / RobotCopy wiring
    // -------------------------------------------------------------------------

    /// Route `routed_send` through `router` (held weakly). Applies to children too.
    pub fn attach_router(&self, router: &MachineRouter) {
        self.attach_weak_router(router.downgrade());
    }

    fn attach_weak_router(&self, router: WeakRouter) {
        *lock(&self.inner.router) = Some(router.clone());
        for child in self.sub_machines().values() {
            child.attach_weak_router(router.clone());
        }
    }

    /// The attached router, if it is still alive.
    pub fn router(&self) -> Option<MachineRouter> {
        lock(&self.inner.router).as_ref().and_then(WeakRouter::upgrade)
    }

    /// Attach a RobotCopy for GraphQL operations.
    pub fn set_robot_copy(&self, robot_copy: RobotCopy) {
        *lock(&self.inner.robot_copy) = Some(robot_copy);
    }

    /// The attached RobotCopy.
    pub fn robot_copy(&self) -> Option<RobotCopy> {
        lock(&self.inner.robot_copy).clone()
    }

    /// The engine behind this machine.
    pub fn engine(&self) -> Arc<dyn StateEngine> {
        self.inner.interpreter.engine().clone()
    }

    /// Send `event` to the machine at `path`, resolved relative to this one.
    pub async fn routed_send(&self, path: &str, event: &str, data: Value) -> Result<Value> {
        let Some(router) = self.router() else {
            warn!(machine = %self.id(), path, "routed send without a router");
            return Err(TomeError::MachineNotFound {
                path: path.to_string(),
            }
            .into());
        };
        router.send_from(self, path, event, data).await
    }
}

impl Renderable for ViewStateMachine {
    fn render(&self) -> RenderTree {
        let snapshot = self.get_state();
        RenderTree {
            key: self.get_render_key(),
            machine: self.id().to_string(),
            state: snapshot.value,
            model: snapshot.context,
            views: self.get_views(),
            children: self.sub_machines().values().map(Renderable::render).collect(),
        }
    }

    fn compose(&self, other: &ViewStateMachine) {
        if self.ptr_eq(other) {
            return;
        }

        let handlers: Vec<(String, StateRegistration)> = lock(&other.inner.handlers)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let views = other.get_views();
        let children = other.sub_machines();

        let engine = self.inner.interpreter.engine().clone();
        {
            let mut mine = lock(&self.inner.handlers);
            for (state, registration) in handlers {
                if !engine.has_state(&state) {
                    warn!(machine = %self.id(), from = %other.id(), state = %state, "composed handler targets an undeclared state");
                }
                mine.insert(state, registration);
            }
        }
        lock(&self.inner.views).extend(views);
        lock(&self.inner.sub_machines).extend(children);
    }

    fn synchronize_with_tome(&self) {
        self.inner.tome_synchronized.store(true, Ordering::SeqCst);
    }

    fn render_key(&self) -> String {
        self.get_render_key()
    }

    fn observe_render_key(&self, callback: Box<dyn Fn(&String) + Send + Sync>) -> Subscription {
        self.observe_view_key(callback)
    }
}

impl std::fmt::Debug for ViewStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewStateMachine")
            .field("id", &self.id())
            .field("state", &self.get_state().value)
            .field("status", &self.status())
            .finish()
    }
}

fn summary(snapshot: &Snapshot) -> Value {
    json!({
        "state": snapshot.value,
        "context": snapshot.context,
    })
}

// =============================================================================
// StateContext
// =============================================================================

/// Everything a state handler gets to work with.
#[derive(Clone)]
pub struct StateContext {
    /// The state just entered.
    pub state: String,
    /// Engine context at arrival.
    pub model: Map<String, Value>,
    /// The event that caused the transition.
    pub event: MachineEvent,
    /// Transition history, oldest first.
    pub transitions: Vec<TransitionRecord>,
    /// `findOne` row.
    pub result: Option<Value>,
    /// `find` rows.
    pub results: Vec<Value>,
    /// Why the storage query failed, when it did.
    pub query_error: Option<String>,
    /// The machine's document store.
    pub db: Option<Arc<dyn ViewStore>>,
    storage: Option<ViewStorageConfig>,
    machine: ViewStateMachine,
}

impl StateContext {
    /// The machine the handler runs on.
    pub fn machine(&self) -> &ViewStateMachine {
        &self.machine
    }

    /// Effective storage config for this state.
    pub fn storage(&self) -> Option<&ViewStorageConfig> {
        self.storage.as_ref()
    }

    /// Append an info log entry.
    pub async fn log(&self, message: impl Into<String>) -> LogEntry {
        self.log_with(LogLevel::Info, message, Map::new()).await
    }

    /// Append a log entry with level and metadata.
    pub async fn log_with(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> LogEntry {
        self.machine
            .append_log(self.storage.as_ref(), level, message.into(), metadata)
            .await
    }

    /// Push a view.
    pub fn view(&self, component: Value) {
        self.machine.view(component);
    }

    /// Empty the view stack.
    pub fn clear(&self) {
        self.machine.clear();
    }

    /// Jump to `to` after this handler returns.
    pub async fn transition(&self, to: &str) -> Result<()> {
        self.machine
            .send(MachineEvent::new(TRANSITION_EVENT, json!({ "to": to })))
            .await
            .map(|_| ())
    }

    /// Send an event to this machine; runs after this handler returns.
    pub async fn send(&self, event: impl Into<MachineEvent>) -> Result<()> {
        self.machine.send(event).await.map(|_| ())
    }

    /// Observe the machine's internal notices by name.
    ///
    /// The observer lives as long as the returned handle; `detach()` it to keep
    /// it for the life of the machine.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&MachineNotice) + Send + Sync + 'static,
    {
        self.machine.on(name, callback)
    }

    /// Spawn a child machine.
    pub fn sub_machine(
        &self,
        id: impl Into<String>,
        config: ViewStateMachineConfig,
    ) -> Result<ViewStateMachine, TomeError> {
        self.machine.sub_machine(id, config)
    }

    /// A child created earlier.
    pub fn get_sub_machine(&self, id: &str) -> Option<ViewStateMachine> {
        self.machine.get_sub_machine(id)
    }

    /// Send through the router, resolving `path` relative to this machine.
    pub async fn routed_send(&self, path: &str, event: &str, data: Value) -> Result<Value> {
        self.machine.routed_send(path, event, data).await
    }

    /// GraphQL operations through the machine's RobotCopy.
    pub fn graphql(&self) -> GraphQl<'_> {
        GraphQl {
            machine: &self.machine,
        }
    }
}

impl std::fmt::Debug for StateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("machine", &self.machine.id())
            .field("state", &self.state)
            .field("event", &self.event.kind)
            .field("query_error", &self.query_error)
            .finish()
    }
}

/// GraphQL accessor returned by [`StateContext::graphql`].
pub struct GraphQl<'a> {
    machine: &'a ViewStateMachine,
}

impl GraphQl<'_> {
    pub async fn query(&self, document: &str, variables: Value) -> Result<Value> {
        self.dispatch(GraphQlOperation::Query, document, variables).await
    }

    pub async fn mutation(&self, document: &str, variables: Value) -> Result<Value> {
        self.dispatch(GraphQlOperation::Mutation, document, variables)
            .await
    }

    pub async fn subscription(&self, document: &str, variables: Value) -> Result<Value> {
        self.dispatch(GraphQlOperation::Subscription, document, variables)
            .await
    }

    async fn dispatch(&self, operation: GraphQlOperation, document: &str, variables: Value) -> Result<Value> {
        let robot_copy = self
            .machine
            .robot_copy()
            .filter(|rc| rc.has_broker(&BrokerKind::GraphQl))
            .ok_or_else(|| TomeError::GraphQlUnavailable {
                machine: self.machine.id().to_string(),
            })?;
        robot_copy.graphql(operation, document, variables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robotcopy::RobotCopyConfig;
    use crate::storage::InMemoryViewStore;
    use crate::testing::{FailingStore, Latch, RecordingBroker};
    use std::sync::atomic::AtomicUsize;

    fn toggle() -> MachineDefinition {
        serde_json::from_value(json!({
            "id": "toggle",
            "initial": "idle",
            "states": {
                "idle": { "on": { "START": "active" } },
                "active": { "on": { "STOP": "idle", "READY": "ready" } },
                "ready": { "on": { "RESET": "idle" } }
            }
        }))
        .unwrap()
    }

    fn ring() -> MachineDefinition {
        serde_json::from_value(json!({
            "id": "ring",
            "initial": "a",
            "states": {
                "a": { "on": { "NEXT": "b" } },
                "b": { "on": { "NEXT": "c" } },
                "c": { "on": { "NEXT": "a" } }
            }
        }))
        .unwrap()
    }

    fn machine(config: ViewStateMachineConfig) -> ViewStateMachine {
        let m = ViewStateMachine::new(config).unwrap();
        m.start();
        m
    }

    #[tokio::test]
    async fn test_handler_runs_on_arrival_and_returns_payload() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(|ctx| async move {
                        ctx.view(json!({"banner": "on"}));
                        Ok(json!({"state": ctx.state, "event": ctx.event.kind}))
                    }),
                ),
        );

        let result = m.send("START").await.unwrap();
        assert_eq!(result, json!({"state": "active", "event": "START"}));
        assert_eq!(m.get_state().value, "active");
        assert_eq!(m.get_views(), vec![json!({"banner": "on"})]);
    }

    #[tokio::test]
    async fn test_state_without_handler_is_silent() {
        let m = machine(ViewStateMachineConfig::from_definition(toggle()).unwrap());
        let result = m.send("START").await.unwrap();
        assert_eq!(result["state"], json!("active"));
    }

    #[test]
    fn test_unknown_state_rejected_at_registration() {
        let noop = handler(|_| async { Ok(Value::Null) });
        let err = ViewStateMachine::new(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state("actve", noop.clone()),
        )
        .unwrap_err();
        assert!(matches!(err, TomeError::UnknownState { .. }));

        let m = ViewStateMachine::new(ViewStateMachineConfig::from_definition(toggle()).unwrap()).unwrap();
        assert!(m.with_state("nope", noop).is_err());
    }

    #[tokio::test]
    async fn test_handler_error_propagates_after_transition() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state("active", handler(|_| async { anyhow::bail!("render exploded") })),
        );

        let err = m.send("START").await.unwrap_err();
        assert_eq!(err.to_string(), "render exploded");
        assert_eq!(m.get_state().value, "active");
    }

    #[tokio::test]
    async fn test_stopped_machine_ignores_sends() {
        let m = machine(ViewStateMachineConfig::from_definition(toggle()).unwrap());
        m.stop();
        let result = m.send("START").await.unwrap();
        assert_eq!(result["state"], json!("idle"));
        assert_eq!(m.status(), MachineStatus::Stopped);

        let unstarted = ViewStateMachine::new(ViewStateMachineConfig::from_definition(toggle()).unwrap()).unwrap();
        unstarted.send("START").await.unwrap();
        assert_eq!(unstarted.get_state().value, "idle");
    }

    #[tokio::test]
    async fn test_render_key_changes_on_every_clear() {
        let m = machine(ViewStateMachineConfig::from_definition(toggle()).unwrap());
        let k0 = m.get_render_key();
        m.clear();
        let k1 = m.get_render_key();
        m.clear();
        let k2 = m.get_render_key();

        assert_eq!(k0, "toggle");
        assert_eq!(k1, "toggle-clear1");
        assert_eq!(k2, "toggle-clear2");
    }

    #[tokio::test]
    async fn test_view_key_observer_sees_current_then_updates() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_render_key("panel"),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = m.observe_view_key(move |key| s.lock().unwrap().push(key.clone()));
        m.clear();

        assert_eq!(*seen.lock().unwrap(), vec!["panel".to_string(), "panel-clear1".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_observer_released_on_reentry() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(move |ctx| {
                        let s = s.clone();
                        async move {
                            let _sub = ctx.on("VIEW_ADDED", move |_| {
                                s.fetch_add(1, Ordering::SeqCst);
                            });
                            ctx.view(json!({"banner": "on"}));
                            Ok(Value::Null)
                        }
                    }),
                ),
        );

        for _ in 0..4 {
            m.send("START").await.unwrap();
            m.send("STOP").await.unwrap();
        }
        // one notice per entry, not one per live observer
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        m.view(json!({"outside": true}));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_detached_handler_observer_outlives_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(move |ctx| {
                        let s = s.clone();
                        async move {
                            ctx.on("VIEW_CLEARED", move |_| {
                                s.fetch_add(1, Ordering::SeqCst);
                            })
                            .detach();
                            Ok(Value::Null)
                        }
                    }),
                ),
        );

        m.send("START").await.unwrap();
        m.clear();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_log_append_survives_failing_store() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_db(Arc::new(FailingStore)),
        );
        let added = Arc::new(AtomicUsize::new(0));
        let a = added.clone();
        let _sub = m.on("LOG_ADDED", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..5 {
            m.log(LogLevel::Info, format!("entry {i}"), Map::new()).await;
        }

        assert_eq!(m.get_logs().len(), 5);
        assert_eq!(added.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_logs_are_mirrored_with_metadata_defaults() {
        let store = Arc::new(InMemoryViewStore::new());
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_db(store.clone())
                .with_storage(
                    ViewStorageConfig::default()
                        .with_log_collection("audit")
                        .with_log_metadata_schema(json!({"source": {"default": "test"}})),
                ),
        );

        let entry = m.log(LogLevel::Warn, "careful", Map::new()).await;
        assert_eq!(entry.metadata.get("source"), Some(&json!("test")));

        let docs = store.find("audit", &json!({"machineId": "toggle"})).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["level"], json!("warn"));
    }

    #[tokio::test]
    async fn test_query_results_and_swallowed_failures() {
        let store = Arc::new(InMemoryViewStore::new());
        store.insert("cards", json!({"kind": "promo", "title": "A"})).await.unwrap();
        store.insert("cards", json!({"kind": "promo", "title": "B"})).await.unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_db(store)
                .with_storage(ViewStorageConfig::default().in_collection("cards"))
                .with_state_storage(
                    "active",
                    handler(move |ctx| {
                        let s = s.clone();
                        async move {
                            *s.lock().unwrap() = Some((ctx.results.len(), ctx.query_error.clone()));
                            Ok(Value::Null)
                        }
                    }),
                    ViewStorageConfig::find(json!({"kind": "promo"})),
                ),
        );
        m.send("START").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((2, None)));

        let failing = Arc::new(Mutex::new(None));
        let f = failing.clone();
        let broken = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_db(Arc::new(FailingStore))
                .with_state_storage(
                    "active",
                    handler(move |ctx| {
                        let f = f.clone();
                        async move {
                            *f.lock().unwrap() = Some((ctx.results.len(), ctx.result.clone(), ctx.query_error.clone()));
                            Ok(Value::Null)
                        }
                    }),
                    ViewStorageConfig::find(json!({})),
                ),
        );
        broken.send("START").await.unwrap();
        assert_eq!(
            *failing.lock().unwrap(),
            Some((0, None, Some("store offline".to_string())))
        );
    }

    #[tokio::test]
    async fn test_compose_other_handler_wins() {
        let a = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state("ready", handler(|_| async { Ok(json!("from a")) })),
        );
        let b = ViewStateMachine::new(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_id("b")
                .with_state("ready", handler(|_| async { Ok(json!("from b")) })),
        )
        .unwrap();
        b.view(json!("b-view"));
        a.view(json!("a-view"));

        a.compose(&b);

        a.send("START").await.unwrap();
        assert_eq!(a.send("READY").await.unwrap(), json!("from b"));
        assert_eq!(a.get_views(), vec![json!("a-view"), json!("b-view")]);
        // b is left intact
        assert_eq!(b.get_views(), vec![json!("b-view")]);
    }

    #[tokio::test]
    async fn test_sub_machines_are_independent() {
        let parent = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_sub_machine("child", ViewStateMachineConfig::from_definition(ring()).unwrap()),
        );
        let child = parent.get_sub_machine("child").unwrap();
        assert_eq!(child.parent_id().as_deref(), Some("toggle"));
        assert_eq!(child.status(), MachineStatus::NotStarted);

        parent.send("START").await.unwrap();
        assert_eq!(child.get_state().value, "a");

        child.start();
        child.send("NEXT").await.unwrap();
        assert_eq!(child.get_state().value, "b");

        let tree = parent.render();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].state, "b");
    }

    #[tokio::test]
    async fn test_handler_spawns_sub_machine_with_notice() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let c = created.clone();
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(|ctx| async move {
                        let child = ctx.sub_machine(
                            "worker",
                            ViewStateMachineConfig::from_definition(ring())?,
                        )?;
                        Ok(json!(child.id()))
                    }),
                ),
        );
        let _sub = m.on("SUB_MACHINE_CREATED", move |notice| {
            if let MachineNotice::SubMachineCreated(id) = notice {
                c.lock().unwrap().push(id.clone());
            }
        });

        assert_eq!(m.send("START").await.unwrap(), json!("worker"));
        assert!(m.get_sub_machine("worker").is_some());
        assert_eq!(*created.lock().unwrap(), vec!["worker".to_string()]);
    }

    #[tokio::test]
    async fn test_transition_from_handler_is_deferred_not_deadlocked() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(|ctx| async move {
                        ctx.transition("ready").await?;
                        // Still in "active" until this handler returns.
                        Ok(json!(ctx.machine().get_state().value))
                    }),
                )
                .with_state("ready", handler(|_| async { Ok(json!("ready")) })),
        );

        let result = m.send("START").await.unwrap();
        assert_eq!(result, json!("active"));
        assert_eq!(m.get_state().value, "ready");
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_processed_fifo() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let record = |visited: Arc<Mutex<Vec<String>>>| {
            handler(move |ctx| {
                let visited = visited.clone();
                async move {
                    tokio::task::yield_now().await;
                    visited.lock().unwrap().push(ctx.state.clone());
                    Ok(Value::Null)
                }
            })
        };
        let m = machine(
            ViewStateMachineConfig::from_definition(ring())
                .unwrap()
                .with_state("a", record(visited.clone()))
                .with_state("b", record(visited.clone()))
                .with_state("c", record(visited.clone())),
        );

        let sends = (0..6).map(|_| m.send("NEXT"));
        for result in futures::future::join_all(sends).await {
            result.unwrap();
        }

        assert_eq!(
            *visited.lock().unwrap(),
            vec!["b", "c", "a", "b", "c", "a"]
        );
    }

    #[tokio::test]
    async fn test_update_context_feeds_model() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state("active", handler(|ctx| async move { Ok(Value::Object(ctx.model)) })),
        );
        let mut updates = Map::new();
        updates.insert("user".into(), json!("ada"));
        m.update_context(&updates);

        assert_eq!(m.send("START").await.unwrap(), json!({"user": "ada"}));
    }

    #[tokio::test]
    async fn test_graphql_without_broker_is_unavailable() {
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(|ctx| async move { ctx.graphql().query("{ me }", Value::Null).await }),
                ),
        );
        let err = m.send("START").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TomeError>(),
            Some(TomeError::GraphQlUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_graphql_goes_through_graphql_broker() {
        let broker = RecordingBroker::replying(BrokerKind::GraphQl, json!({"me": {"name": "ada"}}));
        let robot = RobotCopy::new(RobotCopyConfig::default()).with_broker(Arc::new(broker.clone()));
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_robot_copy(robot)
                .with_state(
                    "active",
                    handler(|ctx| async move {
                        ctx.graphql()
                            .mutation("mutation { touch }", json!({"id": 1}))
                            .await
                    }),
                ),
        );

        assert_eq!(m.send("START").await.unwrap(), json!({"me": {"name": "ada"}}));
        let sent = broker.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["query"], json!("mutation { touch }"));
        assert_eq!(sent[0].payload["variables"], json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_second_send_waits_for_running_handler() {
        let latch = Latch::new();
        let gate = latch.clone();
        let m = machine(
            ViewStateMachineConfig::from_definition(toggle())
                .unwrap()
                .with_state(
                    "active",
                    handler(move |_| {
                        let gate = gate.clone();
                        async move {
                            gate.wait().await;
                            Ok(json!("active done"))
                        }
                    }),
                ),
        );

        let first = tokio::spawn({
            let m = m.clone();
            async move { m.send("START").await }
        });
        tokio::task::yield_now().await;
        assert_eq!(m.get_state().value, "active");

        let second = tokio::spawn({
            let m = m.clone();
            async move { m.send("STOP").await }
        });
        tokio::task::yield_now().await;
        assert_eq!(m.get_state().value, "active");

        latch.open();
        assert_eq!(first.await.unwrap().unwrap(), json!("active done"));
        second.await.unwrap().unwrap();
        assert_eq!(m.get_state().value, "idle");
    }

    #[tokio::test]
    async fn test_incoming_handlers_are_separate_from_states() {
        let m = machine(ViewStateMachineConfig::from_definition(toggle()).unwrap());
        m.register_incoming_handler(
            "PING",
            incoming_handler(|payload| async move { Ok(json!({"pong": payload})) }),
        );

        assert_eq!(
            m.handle_incoming("PING", json!(1)).await.unwrap(),
            Some(json!({"pong": 1}))
        );
        assert_eq!(m.handle_incoming("OTHER", json!(1)).await.unwrap(), None);
        assert!(m.handled_states().is_empty());
    }
}
