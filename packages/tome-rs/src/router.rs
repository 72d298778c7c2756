//! MachineRouter: path-addressed delivery between machines.
//!
//! Machines are registered under absolute paths. Lookup comes in three forms:
//!
//! | Form          | Example                 | Method                                   |
//! |---------------|-------------------------|------------------------------------------|
//! | Absolute      | `"Editor"`              | [`MachineRouter::resolve`]               |
//! | Hierarchical  | `"Editor.Preview.Pane"` | [`MachineRouter::resolve_hierarchical`]  |
//! | Relative      | `"."`, `".."`, `"../.."`, `"./child"`, `"../sibling"` | [`MachineRouter::resolve_relative`] |
//!
//! # Parents without back-pointers
//!
//! Machines record their parent's id, not the parent itself. The router finds
//! a parent by searching its registered machines and their sub-machine trees.
//! Machines hold the router weakly, so there are no reference cycles.
//!
//! # Failure policy
//!
//! Resolution never panics or errors: malformed paths (empty, trailing
//! separator, empty segment) resolve to `None`. `send` turns `None` into
//! [`TomeError::MachineNotFound`].

use std::sync::{Arc, Weak};

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::MachineEvent;
use crate::error::TomeError;
use crate::proxy::ProxyMachine;
use crate::view_machine::{Renderable, ViewStateMachine};

// =============================================================================
// Handles
// =============================================================================

/// Anything the router can deliver to.
///
/// Only [`MachineHandle::Local`] carries the [`Renderable`] capability.
#[derive(Debug, Clone)]
pub enum MachineHandle {
    Local(ViewStateMachine),
    Proxy(ProxyMachine),
}

impl MachineHandle {
    pub fn id(&self) -> &str {
        match self {
            MachineHandle::Local(m) => m.id(),
            MachineHandle::Proxy(p) => p.id(),
        }
    }

    pub fn parent_id(&self) -> Option<String> {
        match self {
            MachineHandle::Local(m) => m.parent_id(),
            MachineHandle::Proxy(p) => p.parent_id(),
        }
    }

    /// Deliver an event.
    pub async fn send(&self, event: MachineEvent) -> Result<Value> {
        match self {
            MachineHandle::Local(m) => m.send(event).await,
            MachineHandle::Proxy(p) => p.send(event).await,
        }
    }

    /// Child lookup; proxies have no local children.
    pub fn get_sub_machine(&self, id: &str) -> Option<MachineHandle> {
        match self {
            MachineHandle::Local(m) => m.get_sub_machine(id).map(MachineHandle::Local),
            MachineHandle::Proxy(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&ViewStateMachine> {
        match self {
            MachineHandle::Local(m) => Some(m),
            MachineHandle::Proxy(_) => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyMachine> {
        match self {
            MachineHandle::Proxy(p) => Some(p),
            MachineHandle::Local(_) => None,
        }
    }

    pub fn as_renderable(&self) -> Option<&dyn Renderable> {
        self.as_local().map(|m| m as &dyn Renderable)
    }

    /// True if both handles point at the same machine.
    pub fn same_machine(&self, other: &MachineHandle) -> bool {
        match (self, other) {
            (MachineHandle::Local(a), MachineHandle::Local(b)) => a.ptr_eq(b),
            (MachineHandle::Proxy(a), MachineHandle::Proxy(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<ViewStateMachine> for MachineHandle {
    fn from(machine: ViewStateMachine) -> Self {
        MachineHandle::Local(machine)
    }
}

impl From<ProxyMachine> for MachineHandle {
    fn from(proxy: ProxyMachine) -> Self {
        MachineHandle::Proxy(proxy)
    }
}

// =============================================================================
// Router
// =============================================================================

#[derive(Default)]
struct RouterInner {
    routes: DashMap<String, MachineHandle>,
}

/// Path-indexed registry of machines. Cheap to clone; clones share routes.
///
/// The router never starts or stops what it holds.
#[derive(Clone, Default)]
pub struct MachineRouter {
    inner: Arc<RouterInner>,
}

/// Non-owning router reference held by machines.
#[derive(Clone)]
pub struct WeakRouter(Weak<RouterInner>);

impl WeakRouter {
    pub fn upgrade(&self) -> Option<MachineRouter> {
        self.0.upgrade().map(|inner| MachineRouter { inner })
    }
}

impl std::fmt::Debug for WeakRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakRouter").field(&self.0.strong_count()).finish()
    }
}

impl MachineRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter(Arc::downgrade(&self.inner))
    }

    /// Store `machine` at `path`, replacing whatever was there.
    ///
    /// Local machines get this router attached for their routed sends.
    pub fn register(&self, path: impl Into<String>, machine: impl Into<MachineHandle>) {
        let path = path.into();
        let machine = machine.into();
        if let MachineHandle::Local(local) = &machine {
            local.attach_router(self);
        }
        debug!(%path, machine = %machine.id(), "registered route");
        self.inner.routes.insert(path, machine);
    }

    /// Remove `path`; no-op if absent.
    pub fn unregister(&self, path: &str) {
        self.inner.routes.remove(path);
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.routes.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.inner.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.routes.is_empty()
    }

    /// Exact lookup of an absolute path.
    pub fn resolve(&self, path: &str) -> Option<MachineHandle> {
        if !is_well_formed(path) || path.starts_with('.') {
            return None;
        }
        self.inner.routes.get(path).map(|entry| entry.value().clone())
    }

    /// `A.B.C`: resolve `A`, then descend through sub-machines.
    pub fn resolve_hierarchical(&self, path: &str) -> Option<MachineHandle> {
        if !is_well_formed(path) {
            return None;
        }
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.resolve(first)?;
        for segment in segments {
            if segment.is_empty() {
                return None;
            }
            current = current.get_sub_machine(segment)?;
        }
        Some(current)
    }

    /// `.`, `..`, `../..`, `./child`, `../sibling`, relative to `context`.
    ///
    /// Each leading `../` climbs one parent. When a climb has no parent the
    /// remainder (if any) is resolved hierarchically from the root.
    pub fn resolve_relative(&self, path: &str, context: &ViewStateMachine) -> Option<MachineHandle> {
        if !is_well_formed(path) {
            return None;
        }

        let mut current = MachineHandle::Local(context.clone());
        if path == "." {
            return Some(current);
        }

        let mut rest = path;
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else {
            loop {
                let remainder = if rest == ".." {
                    ""
                } else if let Some(stripped) = rest.strip_prefix("../") {
                    stripped
                } else {
                    break;
                };

                match self.parent_of(&current) {
                    Some(parent) => current = parent,
                    None => {
                        debug!(path, machine = %current.id(), "no parent; falling back to root lookup");
                        return if remainder.is_empty() {
                            None
                        } else {
                            self.resolve_hierarchical(remainder)
                        };
                    }
                }
                rest = remainder;
            }
        }

        if rest.is_empty() {
            return Some(current);
        }
        self.descend(current, rest)
    }

    fn descend(&self, from: MachineHandle, rest: &str) -> Option<MachineHandle> {
        let mut current = from;
        for part in rest.split('/') {
            for segment in part.split('.') {
                if segment.is_empty() {
                    return None;
                }
                current = current.get_sub_machine(segment)?;
            }
        }
        Some(current)
    }

    /// The machine whose id is `handle`'s parent id, searched through every
    /// registered machine and its sub-machine tree.
    pub fn parent_of(&self, handle: &MachineHandle) -> Option<MachineHandle> {
        let parent_id = handle.parent_id()?;
        self.find_by_id(&parent_id)
    }

    /// Any machine reachable from the registry with the given id.
    pub fn find_by_id(&self, id: &str) -> Option<MachineHandle> {
        for entry in self.inner.routes.iter() {
            let handle = entry.value();
            if handle.id() == id {
                return Some(handle.clone());
            }
        }
        self.inner.routes.iter().find_map(|entry| {
            entry
                .value()
                .as_local()
                .and_then(|m| m.find_descendant(id))
                .map(MachineHandle::Local)
        })
    }

    /// Resolve absolutely, then hierarchically, and deliver.
    pub async fn send(&self, path: &str, event: &str, data: Value) -> Result<Value> {
        let target = self
            .resolve(path)
            .or_else(|| self.resolve_hierarchical(path));
        self.deliver(path, target, event, data).await
    }

    /// Like [`MachineRouter::send`], with relative paths resolved from `context`.
    pub async fn send_from(
        &self,
        context: &ViewStateMachine,
        path: &str,
        event: &str,
        data: Value,
    ) -> Result<Value> {
        let target = if path.starts_with('.') {
            self.resolve_relative(path, context)
        } else {
            self.resolve(path)
                .or_else(|| self.resolve_hierarchical(path))
                .or_else(|| self.resolve_relative(path, context))
        };
        self.deliver(path, target, event, data).await
    }

    async fn deliver(
        &self,
        path: &str,
        target: Option<MachineHandle>,
        event: &str,
        data: Value,
    ) -> Result<Value> {
        let Some(target) = target else {
            warn!(path, event, "no machine at path");
            return Err(TomeError::MachineNotFound {
                path: path.to_string(),
            }
            .into());
        };
        debug!(path, event, machine = %target.id(), "routing event");
        target.send(MachineEvent::new(event, data)).await
    }
}

impl std::fmt::Debug for MachineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRouter")
            .field("paths", &self.paths())
            .finish()
    }
}

/// Rejects empty paths, trailing separators and doubled separators.
fn is_well_formed(path: &str) -> bool {
    if path.trim().is_empty() || path.ends_with('/') {
        return false;
    }
    if path.ends_with('.') && !(path == "." || path == ".." || path.ends_with("/..")) {
        return false;
    }
    !path.contains("//")
}
