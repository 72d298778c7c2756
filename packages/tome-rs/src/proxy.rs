//! ProxyMachine: a machine whose sends go over a message broker.
//!
//! A proxy stands in for a machine that lives somewhere else. It has the same
//! addressing surface as a [`ViewStateMachine`](crate::ViewStateMachine) (id,
//! parent id, `send`) so the router can hold either, but it does not implement
//! [`Renderable`](crate::Renderable): no render, no compose, no tome sync.
//!
//! Incoming messages (replies pushed from the remote side) are handled by a
//! separate registry keyed by message type, see [`ProxyMachine::on_incoming`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::MachineEvent;
use crate::lock;
use crate::robotcopy::RobotCopy;
use crate::view_machine::IncomingHandler;

struct Inner {
    id: String,
    parent_id: Mutex<Option<String>>,
    robot_copy: RobotCopy,
    incoming: Mutex<HashMap<String, IncomingHandler>>,
    last_response: Mutex<Option<Value>>,
}

/// Forwards every send through a [`RobotCopy`]. Cheap to clone.
#[derive(Clone)]
pub struct ProxyMachine {
    inner: Arc<Inner>,
}

impl ProxyMachine {
    pub fn new(id: impl Into<String>, robot_copy: RobotCopy) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                parent_id: Mutex::new(None),
                robot_copy,
                incoming: Mutex::new(HashMap::new()),
                last_response: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// True if both handles point at the same proxy.
    pub fn ptr_eq(&self, other: &ProxyMachine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn parent_id(&self) -> Option<String> {
        lock(&self.inner.parent_id).clone()
    }

    /// Place the proxy under a local parent for relative addressing.
    pub fn set_parent_id(&self, parent: Option<String>) {
        *lock(&self.inner.parent_id) = parent;
    }

    pub fn robot_copy(&self) -> &RobotCopy {
        &self.inner.robot_copy
    }

    /// Forward `event` to the remote machine. Broker failures reject.
    pub async fn send(&self, event: impl Into<MachineEvent>) -> Result<Value> {
        let event = event.into();
        event.validate()?;
        debug!(machine = %self.id(), event = %event.kind, "proxy send");

        let response = self
            .inner
            .robot_copy
            .send_message(
                &event.kind,
                json!({ "machineId": self.id(), "event": event.kind, "data": event.data }),
            )
            .await?;

        *lock(&self.inner.last_response) = Some(response.clone());
        Ok(response)
    }

    /// Most recent successful reply, kept for bookkeeping only.
    pub fn last_response(&self) -> Option<Value> {
        lock(&self.inner.last_response).clone()
    }

    /// Register a handler for incoming messages of `message_type`.
    pub fn on_incoming(&self, message_type: impl Into<String>, handler: IncomingHandler) -> &Self {
        lock(&self.inner.incoming).insert(message_type.into(), handler);
        self
    }

    /// Run the incoming handler for `message_type`; `None` if none is registered.
    pub async fn handle_incoming(&self, message_type: &str, payload: Value) -> Result<Option<Value>> {
        let handler = lock(&self.inner.incoming).get(message_type).cloned();
        match handler {
            Some(handler) => Ok(Some(handler(payload).await?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ProxyMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMachine")
            .field("id", &self.id())
            .field("robot_copy", &self.inner.robot_copy)
            .finish()
    }
}
