// Per-tome rate limiting on top of tower_governor
//
// Each tome gets its own GCRA limiter built from `routing.rateLimit`
// ({windowMs, max}): a burst of `max` requests, refilled at `max` per
// window. Clients are keyed by forwarded IP (x-forwarded-for, x-real-ip,
// forwarded) with the peer address as fallback.

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tome::tome::RateLimitConfig;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tracing::{debug, warn};

/// Floor for how often stale client entries are swept.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Wrap `router` in a governor limiter for `tome_id`.
///
/// Rejections keep governor's retry headers but carry the JSON error body
/// the rest of the API uses. A background task evicts idle clients so the
/// key map only holds recently seen addresses.
pub fn with_rate_limit(router: Router, tome_id: &str, config: &RateLimitConfig) -> Router {
    let max = config.max.max(1);
    let period_ms = (config.window_ms / u64::from(max)).max(1);

    let Some(governor) = GovernorConfigBuilder::default()
        .per_millisecond(period_ms)
        .burst_size(max)
        .key_extractor(SmartIpKeyExtractor)
        .use_headers()
        .finish()
    else {
        warn!(tome = %tome_id, ?config, "Invalid rate limit, serving without one");
        return router;
    };
    let governor = Arc::new(governor);

    let sweep_every = Duration::from_millis(config.window_ms).max(MIN_SWEEP_INTERVAL);
    if tokio::runtime::Handle::try_current().is_ok() {
        spawn_sweeper(Arc::downgrade(governor.limiter()), sweep_every, |limiter| {
            limiter.retain_recent();
        });
    }

    router
        .route_layer(GovernorLayer { config: governor })
        .route_layer(middleware::from_fn_with_state(
            Arc::<str>::from(tome_id),
            rate_limited_body,
        ))
}

/// Run `sweep` every `interval` until `target` is dropped.
pub fn spawn_sweeper<T, F>(target: Weak<T>, interval: Duration, sweep: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                debug!("Rate limiter dropped, stopping sweeper");
                break;
            };
            sweep(&target);
        }
    })
}

/// Swap governor's plain-text 429 for the JSON error body.
async fn rate_limited_body(
    State(tome_id): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return response;
    }

    warn!(tome = %tome_id, "Rate limit exceeded");
    let (mut parts, _) = response.into_parts();
    parts.headers.remove(header::CONTENT_TYPE);
    parts.headers.remove(header::CONTENT_LENGTH);
    (
        parts,
        Json(json!({
            "success": false,
            "error": "Too many requests",
            "tome": &*tome_id,
        })),
    )
        .into_response()
}
