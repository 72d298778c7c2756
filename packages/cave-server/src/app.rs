//! Application setup: tome routes, registry, health and middleware.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, patch, post, put, MethodRouter},
    Router,
};
use bytes::Bytes;
use tome::tome::HttpMethod;
use tome::{Cave, Tome, TomeManager};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::CaveFile;
use crate::middleware::{require_credentials, with_rate_limit, AuthPolicy};
use crate::routes::{health_handler, registry_handler, tome_route_handler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: TomeManager,
    pub cave: Option<Arc<Cave>>,
}

/// Register and start every tome in `file`, then bind the cave to them
pub fn load_cave(manager: &TomeManager, file: CaveFile) -> Result<Option<Arc<Cave>>> {
    for config in file.tomes {
        let id = config.id.clone();
        manager
            .register_tome(config)
            .with_context(|| format!("Failed to register tome {id}"))?;
        manager.start_tome(&id)?;
    }

    Ok(file.cave.map(|config| {
        let cave = Arc::new(Cave::from_config(config));
        cave.initialize_with(manager);
        cave
    }))
}

/// Build the Axum application router
///
/// Every route mounted by a registered tome becomes an axum route for its
/// method. Per-tome middleware (CORS, rate limit, credential check) only
/// wraps that tome's routes.
pub fn build_app(manager: TomeManager, cave: Option<Arc<Cave>>, registry_enabled: bool) -> Router {
    let mut router = Router::new().route("/health", get(health_handler));

    if registry_enabled {
        router = router.route("/registry", get(registry_handler));
    }

    let mut mounted = HashMap::new();
    for tome_id in manager.list_tomes() {
        if let Some(tome) = manager.get_tome(&tome_id) {
            if let Some(tome_router) = tome_router(tome, &mut mounted) {
                router = router.merge(tome_router);
            }
        }
    }

    router
        .layer(Extension(AppState { manager, cave }))
        .layer(TraceLayer::new_for_http())
}

fn tome_router(tome: Arc<Tome>, mounted: &mut HashMap<String, String>) -> Option<Router> {
    let mut router = Router::new();
    let mut methods = HashSet::new();

    for route in tome.routes() {
        let owner = mounted
            .entry(route.path.clone())
            .or_insert_with(|| tome.id().to_string());
        if owner.as_str() != tome.id() {
            warn!(
                tome = %tome.id(),
                owner = %owner,
                path = %route.path,
                "Path already mounted by another tome, skipping"
            );
            continue;
        }
        if !methods.insert((route.method, route.path.clone())) {
            warn!(tome = %tome.id(), method = %route.method, path = %route.path, "Duplicate route, skipping");
            continue;
        }

        let handler = {
            let tome = tome.clone();
            let machine_key = route.machine_key.clone();
            move |body: Bytes| tome_route_handler(tome.clone(), machine_key.clone(), body)
        };
        let method_router: MethodRouter = match route.method {
            HttpMethod::Get => get(handler),
            HttpMethod::Post => post(handler),
            HttpMethod::Put => put(handler),
            HttpMethod::Delete => delete(handler),
            HttpMethod::Patch => patch(handler),
        };

        info!(tome = %tome.id(), method = %route.method, path = %route.path, "Mounted tome route");
        router = router.route(&route.path, method_router);
    }

    if methods.is_empty() {
        return None;
    }

    let routing = tome.config().routing.clone().unwrap_or_default();

    // Route layers only, so unmatched paths never hit another tome's middleware.
    // Outermost first: CORS, rate limit, credentials
    if routing.authentication.required {
        let policy = Arc::new(AuthPolicy {
            tome_id: tome.id().to_string(),
            kind: routing.authentication.kind,
        });
        router = router.route_layer(middleware::from_fn_with_state(policy, require_credentials));
    }

    router = with_rate_limit(router, tome.id(), &routing.rate_limit);

    if routing.cors {
        router = router.route_layer(CorsLayer::permissive());
    }

    Some(router)
}
