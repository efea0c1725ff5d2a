//! Admin-scoped observability endpoint.

use axum::extract::State;
use axum::response::Json;

use crate::state::AppState;

/// `GET /admin/metrics` — cache hit rates, in-flight activity, tool-call
/// outcomes, selector counters, latency percentiles, breaker states.
pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot(
        state.breakers.snapshots(),
        state.caches.sizes(),
        state.inflight.len(),
    ))
}
