//! Per-upstream circuit breaker.
//!
//! Closed: calls pass through. After `failure_threshold` consecutive
//! failures inside the rolling window the breaker opens and every call
//! fails fast with `upstream_unavailable`. After `recovery_s` one probe is
//! admitted (half-open); its outcome decides closed vs open again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use sp_domain::config::BreakerConfig;
use sp_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    /// A half-open probe has been admitted and is still running.
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    transitions: u64,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Point-in-time counters for the metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub transitions: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: Instant::now(),
                opened_at: None,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                transitions: 0,
            }),
        }
    }

    /// Admission check, called before the external call.
    ///
    /// Open → fail fast, unless the recovery interval has passed, in which
    /// case this caller becomes the single half-open probe. Half-open with
    /// a probe already running → fail fast.
    pub fn admit(&self) -> Result<()> {
        let mut g = self.inner.lock();
        match g.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let recovered = g
                    .opened_at
                    .is_some_and(|t| t.elapsed().as_secs() >= self.cfg.recovery_s);
                if recovered {
                    g.state = BreakerState::HalfOpen;
                    g.probe_in_flight = true;
                    g.transitions += 1;
                    tracing::info!(upstream = %self.name, "breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(Error::UpstreamUnavailable { upstream: self.name.clone() })
                }
            }
            BreakerState::HalfOpen => {
                if g.probe_in_flight {
                    Err(Error::UpstreamUnavailable { upstream: self.name.clone() })
                } else {
                    g.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Account a successful call.
    pub fn record_success(&self) {
        let mut g = self.inner.lock();
        g.total_calls += 1;
        g.consecutive_failures = 0;
        if g.state != BreakerState::Closed {
            tracing::info!(upstream = %self.name, "breaker closed");
            g.state = BreakerState::Closed;
            g.transitions += 1;
        }
        g.probe_in_flight = false;
        g.opened_at = None;
    }

    /// Account a failed call.
    pub fn record_failure(&self) {
        let mut g = self.inner.lock();
        g.total_calls += 1;
        g.total_failures += 1;
        match g.state {
            BreakerState::HalfOpen => {
                g.state = BreakerState::Open;
                g.opened_at = Some(Instant::now());
                g.probe_in_flight = false;
                g.transitions += 1;
                tracing::warn!(upstream = %self.name, "probe failed, breaker open again");
            }
            BreakerState::Closed => {
                // Consecutive-failure count resets when the rolling window
                // rolls over.
                if g.window_start.elapsed().as_secs() > self.cfg.window_s {
                    g.window_start = Instant::now();
                    g.consecutive_failures = 0;
                }
                g.consecutive_failures += 1;
                if g.consecutive_failures >= self.cfg.failure_threshold {
                    g.state = BreakerState::Open;
                    g.opened_at = Some(Instant::now());
                    g.transitions += 1;
                    tracing::warn!(
                        upstream = %self.name,
                        failures = g.consecutive_failures,
                        recovery_s = self.cfg.recovery_s,
                        "breaker open"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Run `op` under this breaker: admit, then account the outcome.
    ///
    /// Domain errors that do not indicate upstream ill-health (`not_found`,
    /// `invalid_request`, `tool_arg_invalid`) pass through without tripping
    /// the failure counter.
    pub async fn guard<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.admit()?;
        match op.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let g = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: g.state,
            consecutive_failures: g.consecutive_failures,
            total_calls: g.total_calls,
            total_failures: g.total_failures,
            transitions: g.transitions,
        }
    }
}

fn counts_as_failure(e: &Error) -> bool {
    !matches!(
        e.kind(),
        "not_found" | "invalid_request" | "tool_arg_invalid"
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Breaker map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide registry: one breaker per named upstream, created lazily
/// with that upstream's configured tuning.
pub struct BreakerMap {
    configs: HashMap<String, BreakerConfig>,
    default_cfg: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerMap {
    pub fn new(configs: HashMap<String, BreakerConfig>) -> Self {
        Self {
            configs,
            default_cfg: BreakerConfig::default(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, upstream: &str) -> Arc<CircuitBreaker> {
        let mut g = self.breakers.lock();
        g.entry(upstream.to_string())
            .or_insert_with(|| {
                let cfg = self
                    .configs
                    .get(upstream)
                    .cloned()
                    .unwrap_or_else(|| self.default_cfg.clone());
                Arc::new(CircuitBreaker::new(upstream, cfg))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .lock()
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
