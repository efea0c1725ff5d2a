//! Configuration tree.
//!
//! Loaded from `config.toml` (all sections optional), then overridden by the
//! environment keys documented on each field. Construction happens once at
//! startup; the tree is immutable afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Per-upstream breaker tuning, keyed by upstream name.
    #[serde(default = "default_breakers")]
    pub breakers: HashMap<String, BreakerConfig>,
    /// Per-upstream rate limits, keyed by upstream name.
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, RateLimitConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            conversation: ConversationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            selector: SelectorConfig::default(),
            search: SearchConfig::default(),
            knowledge: KnowledgeConfig::default(),
            prediction: PredictionConfig::default(),
            breakers: default_breakers(),
            limits: default_limits(),
        }
    }
}

impl Config {
    /// Load from a TOML file (defaults when absent), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Internal(format!("config parse: {e}")))?
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the documented environment overrides.
    pub fn apply_env(&mut self) {
        env_set(&mut self.conversation.max_tokens_per_turn, "MAX_TOKENS_PER_TURN");
        env_set(&mut self.orchestrator.max_tool_rounds, "MAX_TOOL_ROUNDS");
        env_set(&mut self.cache.response_ttl_s, "RESPONSE_CACHE_TTL_S");
        env_set(&mut self.cache.simple_ttl_s, "SIMPLE_QUERY_CACHE_TTL_S");
        env_set(&mut self.cache.dedup_ttl_s, "REQUEST_DEDUP_TTL_S");
        env_set(&mut self.selector.ml_enabled, "ML_TOOL_SELECTION_ENABLED");
        env_set(&mut self.selector.confidence_threshold, "ML_CONFIDENCE_THRESHOLD");
        env_set(&mut self.selector.max_tools, "ML_MAX_TOOLS");
        env_set(&mut self.search.mode, "WEB_SEARCH_MODE");
        env_set(&mut self.search.primary_timeout_ms, "SEARCH_PRIMARY_TIMEOUT_MS");
        env_set(&mut self.search.fallback_timeout_ms, "SEARCH_FALLBACK_TIMEOUT_MS");
        if let Ok(key) = std::env::var("BRAVE_API_KEY") {
            if !key.is_empty() {
                self.search.brave_api_key = Some(key);
            }
        }
        if let Ok(alias) = std::env::var("MODEL_DEFAULT_ALIAS") {
            if !alias.is_empty() {
                self.llm.default_alias = alias;
            }
        }
    }

    /// Breaker tuning for a named upstream (defaults when unlisted).
    pub fn breaker_for(&self, upstream: &str) -> BreakerConfig {
        self.breakers.get(upstream).cloned().unwrap_or_default()
    }

    /// Rate limit for a named upstream, if one is configured.
    pub fn limit_for(&self, upstream: &str) -> Option<RateLimitConfig> {
        self.limits.get(upstream).cloned()
    }
}

/// Parse an env var into `target`, warning (and leaving the default) on a
/// malformed value.
fn env_set<T: std::str::FromStr>(target: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: d_port(), host: d_host() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint base URL.
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    /// Env var holding the API key (read once at startup).
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    /// Friendly alias → concrete deployment name.
    #[serde(default = "d_aliases")]
    pub aliases: HashMap<String, String>,
    /// Alias used when the client picks no model. Env: `MODEL_DEFAULT_ALIAS`.
    #[serde(default = "d_default_alias")]
    pub default_alias: String,
    /// Cheaper alias substituted on the simple-query fast path.
    #[serde(default = "d_simple_alias")]
    pub simple_alias: String,
    #[serde(default = "d_embedding_model")]
    pub embedding_model: String,
    /// Hard cap on any single completion request, seconds.
    #[serde(default = "d_120")]
    pub request_timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_llm_key_env(),
            aliases: d_aliases(),
            default_alias: d_default_alias(),
            simple_alias: d_simple_alias(),
            embedding_model: d_embedding_model(),
            request_timeout_s: 120,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Env: `RESPONSE_CACHE_TTL_S`.
    #[serde(default = "d_300")]
    pub response_ttl_s: u64,
    #[serde(default = "d_1000")]
    pub response_capacity: usize,
    /// Env: `SIMPLE_QUERY_CACHE_TTL_S`.
    #[serde(default = "d_60")]
    pub simple_ttl_s: u64,
    #[serde(default = "d_500")]
    pub simple_capacity: usize,
    /// Env: `REQUEST_DEDUP_TTL_S`.
    #[serde(default = "d_30")]
    pub dedup_ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_s: 300,
            response_capacity: 1000,
            simple_ttl_s: 60,
            simple_capacity: 500,
            dedup_ttl_s: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Token budget for the stored window. Env: `MAX_TOKENS_PER_TURN`.
    #[serde(default = "d_6000")]
    pub max_tokens_per_turn: usize,
    /// Idle conversations are evicted after this long.
    #[serde(default = "d_3600")]
    pub ttl_s: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self { max_tokens_per_turn: 6000, ttl_s: 3600 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Env: `MAX_TOOL_ROUNDS`.
    #[serde(default = "d_3")]
    pub max_tool_rounds: usize,
    /// End-to-end deadline per turn, seconds.
    #[serde(default = "d_60")]
    pub turn_deadline_s: u64,
    /// Cap on a serialized tool payload fed back to the model.
    #[serde(default = "d_16384")]
    pub tool_result_max_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 3,
            turn_deadline_s: 60,
            tool_result_max_bytes: 16_384,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool selector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Env: `ML_TOOL_SELECTION_ENABLED`.
    #[serde(default)]
    pub ml_enabled: bool,
    /// Keep labels at or above this confidence. Env: `ML_CONFIDENCE_THRESHOLD`.
    #[serde(default = "d_threshold")]
    pub confidence_threshold: f64,
    /// Cap on selected tools. Env: `ML_MAX_TOOLS`.
    #[serde(default = "d_5")]
    pub max_tools: usize,
    /// Pre-trained classifier weights (JSON). `None` forces heuristic mode.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
    #[serde(default = "d_3600")]
    pub embedding_cache_ttl_s: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ml_enabled: false,
            confidence_threshold: 0.3,
            max_tools: 5,
            weights_path: None,
            embedding_cache_ttl_s: 3600,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Web search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Fast,
    Balanced,
    Comprehensive,
}

impl std::str::FromStr for SearchMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(SearchMode::Fast),
            "balanced" => Ok(SearchMode::Balanced),
            "comprehensive" => Ok(SearchMode::Comprehensive),
            other => Err(format!("unknown search mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Env: `WEB_SEARCH_MODE`.
    #[serde(default = "d_search_mode")]
    pub mode: SearchMode,
    /// Env: `BRAVE_API_KEY`.
    #[serde(default)]
    pub brave_api_key: Option<String>,
    /// Env: `SEARCH_PRIMARY_TIMEOUT_MS`.
    #[serde(default = "d_1500")]
    pub primary_timeout_ms: u64,
    /// Env: `SEARCH_FALLBACK_TIMEOUT_MS`.
    #[serde(default = "d_2000")]
    pub fallback_timeout_ms: u64,
    #[serde(default = "d_8")]
    pub max_results: usize,
    /// Domains boosted by the trust factor.
    #[serde(default = "d_trusted")]
    pub trusted_domains: Vec<String>,
    /// Domains demoted by the trust factor.
    #[serde(default)]
    pub denied_domains: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: d_search_mode(),
            brave_api_key: None,
            primary_timeout_ms: 1500,
            fallback_timeout_ms: 2000,
            max_results: 8,
            trusted_domains: d_trusted(),
            denied_domains: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge base & prediction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// JSON file of knowledge-base documents. `None` leaves the index empty.
    #[serde(default)]
    pub kb_path: Option<PathBuf>,
    #[serde(default = "d_5")]
    pub top_k: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self { kb_path: None, top_k: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "d_model_dir")]
    pub model_dir: PathBuf,
    /// Train a model on first request when none is stored.
    #[serde(default = "d_true")]
    pub auto_train: bool,
    /// Minimum candles required to fit a model.
    #[serde(default = "d_30_usize")]
    pub min_history: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            model_dir: d_model_dir(),
            auto_train: true,
            min_history: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Breakers & rate limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures within the window before opening.
    #[serde(default = "d_5_u32")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a half-open probe.
    #[serde(default = "d_60")]
    pub recovery_s: u64,
    /// Rolling window for the consecutive-failure count.
    #[serde(default = "d_60")]
    pub window_s: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_s: 60, window_s: 60 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained tokens per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: f64,
}

fn default_breakers() -> HashMap<String, BreakerConfig> {
    let mut m = HashMap::new();
    m.insert("brave".into(), BreakerConfig { failure_threshold: 3, recovery_s: 30, window_s: 60 });
    m.insert("ddgs".into(), BreakerConfig { failure_threshold: 3, recovery_s: 30, window_s: 60 });
    m.insert("web-fetch".into(), BreakerConfig { failure_threshold: 5, recovery_s: 60, window_s: 60 });
    m.insert("market-data".into(), BreakerConfig { failure_threshold: 5, recovery_s: 60, window_s: 60 });
    m.insert("llm".into(), BreakerConfig { failure_threshold: 5, recovery_s: 60, window_s: 60 });
    m
}

fn default_limits() -> HashMap<String, RateLimitConfig> {
    let mut m = HashMap::new();
    // Free-tier quotes: one per second, 55/min sustained, small burst.
    m.insert("market-data".into(), RateLimitConfig { rps: 55.0 / 60.0, burst: 3.0 });
    // Search providers: 0.3 s minimum inter-call spacing.
    m.insert("brave".into(), RateLimitConfig { rps: 1.0 / 0.3, burst: 1.0 });
    m.insert("ddgs".into(), RateLimitConfig { rps: 1.0 / 0.3, burst: 1.0 });
    m
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 { 8090 }
fn d_host() -> String { "127.0.0.1".into() }
fn d_llm_url() -> String { "https://api.openai.com/v1".into() }
fn d_llm_key_env() -> String { "OPENAI_API_KEY".into() }
fn d_default_alias() -> String { "analyst".into() }
fn d_simple_alias() -> String { "lite".into() }
fn d_embedding_model() -> String { "text-embedding-3-small".into() }
fn d_search_mode() -> SearchMode { SearchMode::Balanced }
fn d_model_dir() -> PathBuf { PathBuf::from("./data/models") }

fn d_aliases() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("analyst".into(), "gpt-4.1".into());
    m.insert("lite".into(), "gpt-4.1-mini".into());
    m
}

fn d_trusted() -> Vec<String> {
    [
        "reuters.com",
        "bloomberg.com",
        "ft.com",
        "wsj.com",
        "sec.gov",
        "investor.gov",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn d_true() -> bool { true }
fn d_3() -> usize { 3 }
fn d_5() -> usize { 5 }
fn d_8() -> usize { 8 }
fn d_30() -> u64 { 30 }
fn d_30_usize() -> usize { 30 }
fn d_60() -> u64 { 60 }
fn d_120() -> u64 { 120 }
fn d_300() -> u64 { 300 }
fn d_500() -> usize { 500 }
fn d_1000() -> usize { 1000 }
fn d_1500() -> u64 { 1500 }
fn d_2000() -> u64 { 2000 }
fn d_3600() -> u64 { 3600 }
fn d_6000() -> usize { 6000 }
fn d_16384() -> usize { 16_384 }
fn d_5_u32() -> u32 { 5 }
fn d_threshold() -> f64 { 0.3 }
