//! In-process metrics: counters, per-tool outcomes, latency percentiles.
//!
//! Everything is cheap to record on the hot path and snapshotted as JSON by
//! the admin endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Rolling latency window with percentile estimation over the most recent
/// samples.
pub struct LatencyWindow {
    samples: Mutex<std::collections::VecDeque<u64>>,
}

const WINDOW_CAP: usize = 512;

impl LatencyWindow {
    fn new() -> Self {
        Self { samples: Mutex::new(std::collections::VecDeque::new()) }
    }

    fn record(&self, ms: u64) {
        let mut g = self.samples.lock();
        if g.len() == WINDOW_CAP {
            g.pop_front();
        }
        g.push_back(ms);
    }

    fn percentile(&self, p: f64) -> Option<u64> {
        let g = self.samples.lock();
        if g.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = g.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    fn summary(&self) -> LatencySummary {
        let count = self.samples.lock().len();
        let p50_ms = self.percentile(50.0);
        let p95_ms = self.percentile(95.0);
        let p99_ms = self.percentile(99.0);
        LatencySummary { count, p50_ms, p95_ms, p99_ms }
    }
}

#[derive(Debug, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Default, Serialize, Clone)]
pub struct ToolCounters {
    pub ok: u64,
    pub error: u64,
}

/// Latency stages tracked per turn.
pub const STAGE_SEARCH: &str = "search";
pub const STAGE_RANK: &str = "rank";
pub const STAGE_SYNTHESIS: &str = "synthesis";
pub const STAGE_TURN: &str = "turn";

pub struct Metrics {
    // ── Cache layer ───────────────────────────────────────────────
    pub response_cache_hits: AtomicU64,
    pub response_cache_misses: AtomicU64,
    pub inflight_subscribed: AtomicU64,

    // ── Selector ──────────────────────────────────────────────────
    pub selector_ml: AtomicU64,
    pub selector_heuristic: AtomicU64,
    pub selector_fallbacks: AtomicU64,

    // ── Turns ─────────────────────────────────────────────────────
    pub turns_started: AtomicU64,
    pub turns_completed: AtomicU64,
    pub turns_failed: AtomicU64,
    pub turns_cancelled: AtomicU64,

    tool_calls: Mutex<HashMap<String, ToolCounters>>,
    latencies: Mutex<HashMap<&'static str, LatencyWindow>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            response_cache_hits: AtomicU64::new(0),
            response_cache_misses: AtomicU64::new(0),
            inflight_subscribed: AtomicU64::new(0),
            selector_ml: AtomicU64::new(0),
            selector_heuristic: AtomicU64::new(0),
            selector_fallbacks: AtomicU64::new(0),
            turns_started: AtomicU64::new(0),
            turns_completed: AtomicU64::new(0),
            turns_failed: AtomicU64::new(0),
            turns_cancelled: AtomicU64::new(0),
            tool_calls: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_tool(&self, name: &str, ok: bool) {
        let mut g = self.tool_calls.lock();
        let counters = g.entry(name.to_string()).or_default();
        if ok {
            counters.ok += 1;
        } else {
            counters.error += 1;
        }
    }

    pub fn record_latency(&self, stage: &'static str, ms: u64) {
        self.latencies
            .lock()
            .entry(stage)
            .or_insert_with(LatencyWindow::new)
            .record(ms);
    }

    /// Full snapshot for the admin endpoint. Breaker state arrives from the
    /// caller so this module stays free of upstream wiring.
    pub fn snapshot(
        &self,
        breakers: Vec<sp_upstream::BreakerSnapshot>,
        cache_sizes: (usize, usize),
        inflight_len: usize,
    ) -> serde_json::Value {
        let tools: HashMap<String, ToolCounters> = self.tool_calls.lock().clone();
        let latencies: HashMap<&'static str, LatencySummary> = self
            .latencies
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.summary()))
            .collect();

        serde_json::json!({
            "cache": {
                "hits": self.response_cache_hits.load(Ordering::Relaxed),
                "misses": self.response_cache_misses.load(Ordering::Relaxed),
                "response_entries": cache_sizes.0,
                "simple_entries": cache_sizes.1,
            },
            "inflight": {
                "subscribed_total": self.inflight_subscribed.load(Ordering::Relaxed),
                "active": inflight_len,
            },
            "selector": {
                "ml": self.selector_ml.load(Ordering::Relaxed),
                "heuristic": self.selector_heuristic.load(Ordering::Relaxed),
                "fallbacks": self.selector_fallbacks.load(Ordering::Relaxed),
            },
            "turns": {
                "started": self.turns_started.load(Ordering::Relaxed),
                "completed": self.turns_completed.load(Ordering::Relaxed),
                "failed": self.turns_failed.load(Ordering::Relaxed),
                "cancelled": self.turns_cancelled.load(Ordering::Relaxed),
            },
            "tools": tools,
            "latency": latencies,
            "breakers": breakers,
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
