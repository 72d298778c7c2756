//! Cave: the physical placement of tomes.
//!
//! A cave is described by a [`Spelunk`], a tree of descriptors saying which
//! route and container each child cave occupies and which tome it renders. A
//! cave is config-only until [`Cave::initialize`]; binding it to live tomes
//! happens in [`Cave::initialize_with`].
//!
//! # Render keys
//!
//! A cave's key is its spelunk `renderKey` or its name. Once bound to a tome
//! the key becomes `{base}:{tomeRenderKey}` and follows the tome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::lock;
use crate::observable::{BehaviorSubject, Subscription};
use crate::tome::TomeManager;

/// Permission applied when a spelunk declares none.
pub const DEFAULT_PERMISSION: &str = ">anonymous";

/// Permission levels, lowest first, used when no order is supplied.
pub const DEFAULT_LEVEL_ORDER: [&str; 3] = ["anonymous", "user", "admin"];

// =============================================================================
// Descriptors
// =============================================================================

/// One node of a cave descriptor tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spelunk {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub child_caves: BTreeMap<String, Spelunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tomes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tome_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomains: Option<Map<String, Value>>,
    #[serde(default)]
    pub is_modable_cave: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    /// Keys this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Spelunk {
    pub fn with_child(mut self, name: impl Into<String>, child: Spelunk) -> Self {
        self.child_caves.insert(name.into(), child);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_tome(mut self, tome_id: impl Into<String>) -> Self {
        self.tome_id = Some(tome_id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    /// Declared permission or [`DEFAULT_PERMISSION`].
    pub fn permission(&self) -> &str {
        self.permission.as_deref().unwrap_or(DEFAULT_PERMISSION)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_path: Option<String>,
}

/// Name plus descriptor tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaveConfig {
    pub name: String,
    pub spelunk: Spelunk,
}

/// Where and what to render for a routed path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTarget {
    pub route: Option<String>,
    pub container: Option<String>,
    pub tomes: Option<Map<String, Value>>,
    pub tome_id: Option<String>,
}

/// Body of `GET /registry`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaveRegistry {
    pub cave: String,
    pub addresses: Vec<CaveAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaveAddress {
    pub name: String,
    pub route: Option<String>,
    pub container: Option<String>,
    pub tome_id: Option<String>,
    pub subdomains: Option<Map<String, Value>>,
}

// =============================================================================
// Cave
// =============================================================================

pub struct Cave {
    name: String,
    spelunk: Spelunk,
    children: BTreeMap<String, Cave>,
    initialized: AtomicBool,
    render_key: BehaviorSubject<String>,
    tome_binding: Mutex<Option<Subscription>>,
}

impl Cave {
    /// Config-only cave with one child cave per `childCaves` entry.
    pub fn new(name: impl Into<String>, spelunk: Spelunk) -> Self {
        let name = name.into();
        let children = spelunk
            .child_caves
            .iter()
            .map(|(key, child)| (key.clone(), Cave::new(key.clone(), child.clone())))
            .collect();
        let base = spelunk.render_key.clone().unwrap_or_else(|| name.clone());

        Self {
            name,
            spelunk,
            children,
            initialized: AtomicBool::new(false),
            render_key: BehaviorSubject::new(base),
            tome_binding: Mutex::new(None),
        }
    }

    pub fn from_config(config: CaveConfig) -> Self {
        Self::new(config.name, config.spelunk)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spelunk(&self) -> &Spelunk {
        &self.spelunk
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn child_caves(&self) -> &BTreeMap<String, Cave> {
        &self.children
    }

    pub fn get_config(&self) -> CaveConfig {
        CaveConfig {
            name: self.name.clone(),
            spelunk: self.spelunk.clone(),
        }
    }

    /// Descriptor at `path`.
    ///
    /// `"."`, `""` and `"./"` name the root. Segments are `/`-separated child
    /// cave names; any unknown segment falls back to the root descriptor.
    pub fn get_routed_config(&self, path: &str) -> &Spelunk {
        let trimmed = path.strip_prefix("./").or_else(|| path.strip_prefix('.')).unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        let mut current = &self.spelunk;
        for part in trimmed.split('/').filter(|part| !part.is_empty()) {
            match current.child_caves.get(part) {
                Some(next) => current = next,
                None => return &self.spelunk,
            }
        }
        current
    }

    pub fn get_render_target(&self, path: &str) -> RenderTarget {
        let spelunk = self.get_routed_config(path);
        RenderTarget {
            route: spelunk.route.clone(),
            container: spelunk.container.clone(),
            tomes: spelunk.tomes.clone(),
            tome_id: spelunk.tome_id.clone(),
        }
    }

    /// Whether `level` may enter the cave at `path`.
    pub fn is_permitted(&self, path: &str, level: &str) -> bool {
        evaluate_permission(level, self.get_routed_config(path).permission(), &DEFAULT_LEVEL_ORDER)
    }

    pub fn get_render_key(&self) -> String {
        self.render_key.value()
    }

    /// Observe render-key changes; called immediately with the current key.
    pub fn observe_view_key<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.render_key.subscribe(callback)
    }

    /// Mark this cave and every child cave initialized. Idempotent.
    pub fn initialize(&self) -> &Self {
        if self.initialized.load(Ordering::SeqCst) {
            return self;
        }
        for child in self.children.values() {
            child.initialize();
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!(cave = %self.name, "Cave initialized");
        self
    }

    /// Bind every cave that names a `tomeId` to the live tome, then initialize.
    ///
    /// Bound tomes are marked cave-synchronized. A missing tome is a warning.
    pub fn initialize_with(&self, manager: &TomeManager) -> &Self {
        self.bind_tomes(manager);
        self.initialize();
        info!(cave = %self.name, "Cave initialized with tomes");
        self
    }

    fn bind_tomes(&self, manager: &TomeManager) {
        if let Some(tome_id) = &self.spelunk.tome_id {
            match manager.get_tome(tome_id) {
                Some(tome) => {
                    tome.synchronize_with_cave();
                    let base = self.spelunk.render_key.clone().unwrap_or_else(|| self.name.clone());
                    let subject = self.render_key.clone();
                    let subscription =
                        tome.observe_render_key(move |tome_key| subject.next(format!("{base}:{tome_key}")));
                    *lock(&self.tome_binding) = Some(subscription);
                }
                None => warn!(cave = %self.name, tome = %tome_id, "Cave names a tome that is not registered"),
            }
        }
        for child in self.children.values() {
            child.bind_tomes(manager);
        }
    }

    /// Addresses of the direct child caves.
    pub fn registry(&self) -> CaveRegistry {
        CaveRegistry {
            cave: self.name.clone(),
            addresses: self
                .spelunk
                .child_caves
                .iter()
                .map(|(name, child)| CaveAddress {
                    name: name.clone(),
                    route: child.route.clone(),
                    container: child.container.clone(),
                    tome_id: child.tome_id.clone(),
                    subdomains: child.subdomains.clone(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Cave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cave")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Permissions
// =============================================================================

/// Check a permission level against a spec.
///
/// Specs: `>x`, `>=x`, `<x`, `<=x` compare ranks in `level_order`; `=x` and a
/// bare `x` require equality; `a,b` is a list of allowed levels. An empty spec
/// allows everything; an empty level counts as `anonymous`. Levels missing
/// from `level_order` rank below every listed level.
pub fn evaluate_permission(level: &str, spec: &str, level_order: &[&str]) -> bool {
    let level = match level.trim() {
        "" => "anonymous",
        trimmed => trimmed,
    };
    let spec = spec.trim();
    if spec.is_empty() {
        return true;
    }

    let rank = |name: &str| -> i64 {
        level_order
            .iter()
            .position(|candidate| *candidate == name)
            .map_or(-1, |i| i as i64)
    };
    let user = rank(level);

    if let Some(target) = spec.strip_prefix(">=") {
        return user >= rank(target.trim());
    }
    if let Some(target) = spec.strip_prefix("<=") {
        return user <= rank(target.trim());
    }
    if let Some(target) = spec.strip_prefix('>') {
        return user > rank(target.trim());
    }
    if let Some(target) = spec.strip_prefix('<') {
        return user < rank(target.trim());
    }
    if let Some(target) = spec.strip_prefix('=') {
        return level == target.trim();
    }
    if spec.contains(',') {
        return spec.split(',').any(|allowed| allowed.trim() == level);
    }
    level == spec
}
