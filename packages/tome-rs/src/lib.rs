//! # Tome
//!
//! State machines that drive views, addressed by path, composed into tomes
//! and placed in caves.
//!
//! ## Core Concepts
//!
//! - [`ViewStateMachine`] = a state machine whose states run async handlers
//!   that push views, write logs and spawn sub-machines
//! - [`MachineRouter`] = path-based addressing between machines (absolute,
//!   dotted, relative with `./` and `../`)
//! - [`ProxyMachine`] = the same addressing surface, but sends go over a
//!   [`RobotCopy`] message broker instead of executing locally
//! - [`Tome`] = a named group of machines sharing a context and a router,
//!   managed by a [`TomeManager`]
//! - [`Cave`] = where tomes are placed (routes, containers, permissions)
//!
//! ## Architecture
//!
//! ```text
//! Cave ──► TomeManager ──► Tome ──► MachineRouter
//!                            │          │
//!                            │          ├─► ViewStateMachine ──► StateEngine
//!                            │          │        │
//!                            │          │        └─► sub-machines
//!                            │          │
//!                            │          └─► ProxyMachine ──► RobotCopy ──► MessageBroker
//!                            │
//!                            └─► routes ──► (HTTP transport)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Handlers run on arrival** - a state's handler runs only when a transition is taken
//! 2. **Sends are FIFO per machine** - concurrent sends are processed in call order
//! 3. **Resolution never panics** - malformed or unknown paths resolve to nothing
//! 4. **Storage failures are swallowed** - queries and log mirroring never fail a send
//! 5. **Tomes stop before they go** - unregistering always stops every machine first
//!
//! ## Example
//!
//! ```ignore
//! use tome::{handler, TomeConfig, TomeMachineConfig, TomeManager};
//!
//! let manager = TomeManager::new();
//! let tome = manager.register_tome(
//!     TomeConfig::new("orders", "Orders")
//!         .with_machine("cart", TomeMachineConfig::new("cart", definition))
//!         .with_state_handler("cart", "checkout", handler(|ctx| async move {
//!             ctx.log("checking out").await;
//!             ctx.view(json!({"type": "summary", "items": ctx.model["items"]}));
//!             Ok(json!({"ok": true}))
//!         })),
//! )?;
//! tome.start();
//! tome.send_message("cart", "CHECKOUT", json!({})).await?;
//! ```

pub mod cave;
pub mod engine;
pub mod error;
pub mod observable;
pub mod proxy;
pub mod robotcopy;
pub mod router;
pub mod storage;
pub mod tome;
pub mod view_machine;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export error types
pub use error::TomeError;

// Re-export engine types
pub use engine::{
    DefinitionEngine, Interpreter, MachineDefinition, MachineEvent, MachineOptions, MachineStatus,
    Snapshot, StateEngine, StateNode, TransitionSpec,
};

// Re-export observable types
pub use observable::{BehaviorSubject, Subject, Subscription};

// Re-export machine types
pub use view_machine::{
    handler, incoming_handler, IncomingHandler, LogEntry, LogLevel, MachineNotice, RenderTree,
    Renderable, StateContext, StateHandler, ViewStateMachine, ViewStateMachineConfig,
};

// Re-export routing types
pub use proxy::ProxyMachine;
pub use router::{MachineHandle, MachineRouter, WeakRouter};

// Re-export storage types
pub use storage::{InMemoryViewStore, ViewStorageConfig, ViewStore};

// Re-export broker types
pub use robotcopy::{
    create_tracing_headers, BrokerKind, BrokerMessage, BrokerResponse, ChannelBroker,
    GraphQlBroker, HttpBroker, MessageBroker, MessageTracer, RobotCopy, RobotCopyConfig,
};

// Re-export tome and cave types
pub use cave::{evaluate_permission, Cave, CaveConfig, CaveRegistry, RenderTarget, Spelunk};
pub use tome::{
    RouteResponse, Tome, TomeConfig, TomeLifecycle, TomeMachineConfig, TomeManager, TomeRoute,
};

// Re-export commonly used external types
pub use async_trait::async_trait;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
