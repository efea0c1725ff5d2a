//! Shared application state passed to all API handlers.

use std::sync::Arc;

use sp_domain::config::Config;
use sp_providers::ModelRegistry;
use sp_sessions::{ConversationStore, LogSink};
use sp_upstream::{BreakerMap, LimiterMap};

use crate::runtime::cache::ResponseCaches;
use crate::runtime::inflight::InflightMap;
use crate::runtime::metrics::Metrics;
use crate::runtime::selector::ToolSelector;
use crate::runtime::tools::ToolRegistry;

/// Everything a request handler can reach. Cheap to clone; every field is
/// a process-wide singleton built once in [`crate::bootstrap`].
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────
    pub config: Arc<Config>,
    pub models: Arc<ModelRegistry>,

    // ── Conversation & tools ──────────────────────────────────────
    pub conversations: Arc<ConversationStore>,
    pub tools: Arc<ToolRegistry>,
    pub selector: Arc<ToolSelector>,

    // ── Caching & dedup ───────────────────────────────────────────
    pub caches: Arc<ResponseCaches>,
    pub inflight: Arc<InflightMap>,

    // ── Upstream protection ───────────────────────────────────────
    pub breakers: Arc<BreakerMap>,
    pub limiters: Arc<LimiterMap>,

    // ── Observability ─────────────────────────────────────────────
    pub metrics: Arc<Metrics>,
    pub turn_log: Arc<dyn LogSink>,
}
