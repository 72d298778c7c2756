//! Structured error types for tome.
//!
//! `TomeError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is the transport for every async operation (ergonomic for handlers)
//! - `TomeError` is what the framework itself produces, carried inside `anyhow`
//! - Handler errors are propagated untouched, so their message is what callers see
//!
//! # Error Example
//!
//! ```ignore
//! use tome::{MachineRouter, TomeError};
//!
//! match router.send("Editor.Preview", "RENDER", json!({})).await {
//!     Ok(result) => println!("rendered: {result}"),
//!     Err(e) => match e.downcast_ref::<TomeError>() {
//!         Some(TomeError::MachineNotFound { path }) => warn!(%path, "nobody home"),
//!         _ => return Err(e),
//!     },
//! }
//! ```
//!
//! # Failure Classes
//!
//! | Class         | Surfaces as                      | Fatal to sender? |
//! |---------------|----------------------------------|------------------|
//! | Resolution    | `None` / `MachineNotFound`       | no               |
//! | Handler       | the handler's own error          | caller decides   |
//! | Storage       | swallowed, `query_error` set     | no               |
//! | Broker        | `BrokerFailure` / `BrokerTimeout`| caller decides   |
//! | Configuration | `warn!` at registration          | no               |

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the tome framework itself.
#[derive(Debug, Error)]
pub enum TomeError {
    /// No machine could be resolved at the given path.
    #[error("machine not found at path: {path}")]
    MachineNotFound {
        /// The path as the caller supplied it.
        path: String,
    },

    /// A tome was asked for a machine key it does not contain.
    #[error("Machine {machine} not found in tome {tome}")]
    MachineNotInTome {
        /// The machine key that was requested.
        machine: String,
        /// The tome that was searched.
        tome: String,
    },

    /// The tome id is not registered with the manager.
    #[error("Tome {id} not found")]
    TomeNotFound {
        /// The requested tome id.
        id: String,
    },

    /// A tome with this id is already registered.
    #[error("Tome {id} is already registered")]
    TomeAlreadyRegistered {
        /// The conflicting tome id.
        id: String,
    },

    /// A handler was registered for a state the machine definition does not declare.
    #[error("machine '{machine}' has no state named '{state}'")]
    UnknownState {
        /// The machine the handler was registered on.
        machine: String,
        /// The state name that was not found.
        state: String,
    },

    /// The state machine definition is inconsistent.
    #[error("invalid machine definition '{machine}': {reason}")]
    InvalidDefinition {
        /// The definition id.
        machine: String,
        /// Why the definition was rejected.
        reason: String,
    },

    /// An event could not be interpreted (e.g. empty event type).
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// Why the event was rejected.
        reason: String,
    },

    /// RobotCopy has no broker registered for the requested kind.
    #[error("No message broker found for type: {kind}")]
    NoMessageBroker {
        /// The broker kind that was requested.
        kind: String,
    },

    /// A broker dispatched the message but reported failure.
    #[error("broker '{broker}' failed: {message}")]
    BrokerFailure {
        /// The broker kind that failed.
        broker: String,
        /// The failure as reported by the broker.
        message: String,
    },

    /// A broker did not receive a reply in time.
    #[error("broker '{broker}' timed out after {duration:?}")]
    BrokerTimeout {
        /// The broker kind that timed out.
        broker: String,
        /// How long we waited.
        duration: Duration,
    },

    /// GraphQL was requested from a machine without a GraphQL-capable RobotCopy.
    #[error("machine '{machine}' has no GraphQL broker attached")]
    GraphQlUnavailable {
        /// The machine that issued the operation.
        machine: String,
    },
}

impl TomeError {
    /// Returns true for errors the caller may treat as "target absent".
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            TomeError::MachineNotFound { .. }
                | TomeError::MachineNotInTome { .. }
                | TomeError::TomeNotFound { .. }
        )
    }

    /// Returns true for broker/network failures.
    pub fn is_broker(&self) -> bool {
        matches!(
            self,
            TomeError::NoMessageBroker { .. }
                | TomeError::BrokerFailure { .. }
                | TomeError::BrokerTimeout { .. }
        )
    }
}
