//! The tool registry and the dispatch pipeline.
//!
//! Every callable tool is a [`ToolHandler`] registered in an immutable map
//! built at startup: hand-written argument schema, capability tags, heavy
//! flag, per-tool timeout and retry policy, and the named upstream used for
//! breaker/limiter routing.
//!
//! Dispatch never returns `Err`: every failure becomes an error payload the
//! model can read and recover from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use sp_domain::error::{Error, Result};
use sp_domain::message::{ToolCallRequest, ToolDefinition, ToolOutput, ToolPayload};
use sp_domain::schema;
use sp_search::{SearchEngine, SearchOptions};
use sp_tools::{Forecaster, MarketData, RagSearcher};
use sp_upstream::{BreakerMap, LimiterMap};

use crate::runtime::metrics::{Metrics, STAGE_RANK, STAGE_SEARCH, STAGE_SYNTHESIS};

pub const QUOTE_TOOL: &str = "get_stock_quote";
pub const HISTORY_TOOL: &str = "get_stock_history";
pub const NEWS_TOOL: &str = "get_stock_news";
pub const RAG_TOOL: &str = "rag_search";
pub const WEB_SEARCH_TOOL: &str = "perplexity_search";
pub const PREDICT_TOOL: &str = "predict_price";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Hand-written JSON-Schema for the arguments, colocated with the
    /// handler so the advertised contract and the decoder cannot drift.
    pub parameters: Value,
    pub tags: &'static [&'static str],
    /// Heavy tools are withheld from the simple-query fast path.
    pub heavy: bool,
    pub timeout: Duration,
    pub retry_on_rate_limit: bool,
    /// Breaker/limiter key; `None` for purely local tools.
    pub upstream: Option<&'static str>,
}

/// Per-dispatch context handed to every handler.
pub struct ToolContext {
    pub deadline: Instant,
    pub turn_id: Uuid,
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    async fn run(&self, args: &Value, ctx: &ToolContext) -> Result<ToolPayload>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn ToolHandler>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new(
        market: Arc<dyn MarketData>,
        engine: Arc<SearchEngine>,
        rag: Option<Arc<RagSearcher>>,
        forecaster: Arc<Forecaster>,
        rag_top_k: usize,
    ) -> Self {
        let mut registry = Self { tools: HashMap::new(), order: Vec::new() };
        registry.register(Arc::new(QuoteTool { market: market.clone(), spec: QuoteTool::spec_def() }));
        registry.register(Arc::new(HistoryTool { market: market.clone(), spec: HistoryTool::spec_def() }));
        registry.register(Arc::new(NewsTool { market: market.clone(), spec: NewsTool::spec_def() }));
        registry.register(Arc::new(RagTool { rag, top_k: rag_top_k, spec: RagTool::spec_def() }));
        registry.register(Arc::new(WebSearchTool { engine, spec: WebSearchTool::spec_def() }));
        registry.register(Arc::new(PredictTool { forecaster, market, spec: PredictTool::spec_def() }));
        registry
    }

    fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.spec().name;
        self.order.push(name);
        self.tools.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.tools.get(name)
    }

    pub fn is_heavy(&self, name: &str) -> bool {
        self.get(name).map(|h| h.spec().heavy).unwrap_or(false)
    }

    pub fn names(&self) -> &[&'static str] {
        &self.order
    }

    /// The schema triples the model sees for a chosen subset, in the
    /// caller's order.
    pub fn describe(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.get(n))
            .map(|h| {
                let spec = h.spec();
                ToolDefinition {
                    name: spec.name.to_string(),
                    description: spec.description.to_string(),
                    parameters: spec.parameters.clone(),
                }
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one tool call end to end: validate → deadline → limiter → breaker →
/// handler → classify. Infallible by construction; errors become payloads.
pub async fn dispatch(
    registry: &ToolRegistry,
    limiters: &LimiterMap,
    breakers: &BreakerMap,
    metrics: &Metrics,
    call: &ToolCallRequest,
    turn_deadline: Instant,
    turn_id: Uuid,
) -> ToolOutput {
    let payload = dispatch_inner(registry, limiters, breakers, call, turn_deadline, turn_id).await;
    metrics.record_tool(&call.name, !payload.is_error());
    if let ToolPayload::WebSearch(resp) = &payload {
        metrics.record_latency(STAGE_SEARCH, resp.search_time_ms);
        metrics.record_latency(STAGE_RANK, resp.rank_time_ms);
        if resp.synthesis_time_ms > 0 {
            metrics.record_latency(STAGE_SYNTHESIS, resp.synthesis_time_ms);
        }
    }
    ToolOutput {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        payload,
    }
}

async fn dispatch_inner(
    registry: &ToolRegistry,
    limiters: &LimiterMap,
    breakers: &BreakerMap,
    call: &ToolCallRequest,
    turn_deadline: Instant,
    turn_id: Uuid,
) -> ToolPayload {
    let Some(handler) = registry.get(&call.name) else {
        return ToolPayload::error("invalid_request", format!("unknown tool '{}'", call.name));
    };
    let spec = handler.spec();

    if let Err(e) = schema::validate(&spec.parameters, &call.arguments) {
        return ToolPayload::error(e.kind(), e.safe_message());
    }

    let deadline = turn_deadline.min(Instant::now() + spec.timeout);

    match run_guarded(handler, spec, limiters, breakers, call, deadline, turn_id).await {
        Ok(payload) => payload,
        Err(e) if e.is_retryable() && spec.retry_on_rate_limit => {
            // One jittered retry; rate-limit trips are usually momentary.
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(100..300));
            if Instant::now() + jitter >= deadline {
                return ToolPayload::error(e.kind(), e.safe_message());
            }
            tokio::time::sleep(jitter).await;
            tracing::debug!(tool = spec.name, "retrying after rate limit");
            match run_guarded(handler, spec, limiters, breakers, call, deadline, turn_id).await {
                Ok(payload) => payload,
                Err(e) => ToolPayload::error(e.kind(), e.safe_message()),
            }
        }
        Err(e) => ToolPayload::error(e.kind(), e.safe_message()),
    }
}

async fn run_guarded(
    handler: &Arc<dyn ToolHandler>,
    spec: &ToolSpec,
    limiters: &LimiterMap,
    breakers: &BreakerMap,
    call: &ToolCallRequest,
    deadline: Instant,
    turn_id: Uuid,
) -> Result<ToolPayload> {
    if let Some(upstream) = spec.upstream {
        limiters
            .acquire(upstream, tokio::time::Instant::from_std(deadline))
            .await?;
    }

    let ctx = ToolContext { deadline, turn_id };
    let timed = async {
        tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), handler.run(&call.arguments, &ctx))
            .await
            .map_err(|_| Error::Timeout(format!("tool '{}' hit its deadline", spec.name)))?
    };

    match spec.upstream {
        Some(upstream) => breakers.get(upstream).guard(timed).await,
        None => timed.await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

struct QuoteTool {
    market: Arc<dyn MarketData>,
    spec: ToolSpec,
}

impl QuoteTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: QUOTE_TOOL,
            description: "Current price, change, and timestamp for a stock symbol.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol, e.g. AAPL" }
                },
                "required": ["symbol"]
            }),
            tags: &["market-data"],
            heavy: false,
            timeout: Duration::from_secs(5),
            retry_on_rate_limit: true,
            upstream: Some("market-data"),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for QuoteTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolPayload> {
        let quote = self.market.quote(arg_str(args, "symbol")).await?;
        Ok(ToolPayload::Quote(quote))
    }
}

struct HistoryTool {
    market: Arc<dyn MarketData>,
    spec: ToolSpec,
}

impl HistoryTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: HISTORY_TOOL,
            description: "Historical OHLCV candles for a stock symbol.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol" },
                    "period": {
                        "type": "string",
                        "enum": ["1d", "5d", "1mo", "3mo", "6mo", "1y"],
                        "description": "Lookback range"
                    },
                    "interval": {
                        "type": "string",
                        "enum": ["1d", "1wk"],
                        "description": "Candle granularity"
                    }
                },
                "required": ["symbol"]
            }),
            tags: &["market-data"],
            heavy: false,
            timeout: Duration::from_secs(8),
            retry_on_rate_limit: true,
            upstream: Some("market-data"),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for HistoryTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolPayload> {
        let symbol = arg_str(args, "symbol");
        let period = args.get("period").and_then(|v| v.as_str()).unwrap_or("1mo");
        let interval = args.get("interval").and_then(|v| v.as_str()).unwrap_or("1d");
        let candles = self.market.history(symbol, period, interval).await?;
        Ok(ToolPayload::History { symbol: symbol.to_uppercase(), candles })
    }
}

struct NewsTool {
    market: Arc<dyn MarketData>,
    spec: ToolSpec,
}

impl NewsTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: NEWS_TOOL,
            description: "Recent news headlines for a stock symbol.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol" },
                    "limit": { "type": "integer", "description": "Max headlines (default 5)" }
                },
                "required": ["symbol"]
            }),
            tags: &["market-data", "news"],
            heavy: false,
            timeout: Duration::from_secs(6),
            retry_on_rate_limit: true,
            upstream: Some("market-data"),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for NewsTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolPayload> {
        let symbol = arg_str(args, "symbol");
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let items = self.market.news(symbol, limit.clamp(1, 20)).await?;
        Ok(ToolPayload::News { symbol: symbol.to_uppercase(), items })
    }
}

struct RagTool {
    rag: Option<Arc<RagSearcher>>,
    top_k: usize,
    spec: ToolSpec,
}

impl RagTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: RAG_TOOL,
            description: "Search the local knowledge base of research notes and documents.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to look up" },
                    "limit": { "type": "integer", "description": "Max documents" }
                },
                "required": ["query"]
            }),
            tags: &["rag"],
            heavy: false,
            timeout: Duration::from_secs(5),
            retry_on_rate_limit: false,
            upstream: None,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for RagTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolPayload> {
        let Some(rag) = &self.rag else {
            return Err(Error::NotFound("no knowledge base is configured".into()));
        };
        let query = arg_str(args, "query");
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(self.top_k);
        let hits = rag.search(query, limit.clamp(1, 20)).await?;
        Ok(ToolPayload::RagSearch { query: query.to_string(), hits })
    }
}

struct WebSearchTool {
    engine: Arc<SearchEngine>,
    spec: ToolSpec,
}

impl WebSearchTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: WEB_SEARCH_TOOL,
            description: "Search the web across providers and return ranked, citable sources.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "max_results": { "type": "integer", "description": "Result cap (default 8)" }
                },
                "required": ["query"]
            }),
            tags: &["web"],
            heavy: true,
            timeout: Duration::from_secs(10),
            retry_on_rate_limit: false,
            // Fan-out manages per-provider breakers itself.
            upstream: None,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for WebSearchTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, ctx: &ToolContext) -> Result<ToolPayload> {
        let query = arg_str(args, "query");
        // Synthesis stays off inside the tool loop: the main model performs
        // the single authoritative synthesis on the next round.
        let mut opts = SearchOptions::for_tool_loop(self.engine.config(), ctx.deadline);
        if let Some(n) = args.get("max_results").and_then(|v| v.as_u64()) {
            opts.max_results = (n as usize).clamp(1, 20);
        }
        let resp = self.engine.run(query, &opts).await;
        Ok(ToolPayload::WebSearch(resp))
    }
}

struct PredictTool {
    forecaster: Arc<Forecaster>,
    market: Arc<dyn MarketData>,
    spec: ToolSpec,
}

impl PredictTool {
    fn spec_def() -> ToolSpec {
        ToolSpec {
            name: PREDICT_TOOL,
            description: "Forecast a stock's closing price over the next 1-30 trading days.",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "symbol": { "type": "string", "description": "Ticker symbol" },
                    "horizon": { "type": "integer", "description": "Trading days ahead (1-30)" }
                },
                "required": ["symbol", "horizon"]
            }),
            tags: &["prediction"],
            heavy: true,
            timeout: Duration::from_secs(15),
            retry_on_rate_limit: false,
            upstream: Some("market-data"),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for PredictTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn run(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolPayload> {
        let symbol = arg_str(args, "symbol");
        let horizon = args.get("horizon").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        match self.forecaster.forecast(self.market.as_ref(), symbol, horizon).await {
            Ok(forecast) => Ok(ToolPayload::Forecast(forecast)),
            // The forecast taxonomy is already user-safe; surface it as a
            // tool error payload rather than a transport error.
            Err(e) => Ok(ToolPayload::error(e.kind(), e.message())),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test support
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use sp_domain::config::{PredictionConfig, SearchConfig, SearchMode};
    use sp_domain::market::{Candle, NewsItem, Quote};
    use sp_domain::search::SearchResult;
    use sp_search::SearchBackend;

    /// Deterministic market stub: AAPL trades at 172.34, everything else
    /// is unknown.
    pub struct StubMarket;

    #[async_trait::async_trait]
    impl MarketData for StubMarket {
        async fn quote(&self, symbol: &str) -> Result<Quote> {
            if !symbol.eq_ignore_ascii_case("aapl") {
                return Err(Error::NotFound(format!("unknown symbol '{symbol}'")));
            }
            Ok(Quote {
                symbol: "AAPL".into(),
                price: 172.34,
                change: 1.27,
                change_percent: 0.74,
                ts: Utc::now(),
            })
        }

        async fn history(&self, symbol: &str, _p: &str, _i: &str) -> Result<Vec<Candle>> {
            if !symbol.eq_ignore_ascii_case("aapl") {
                return Err(Error::NotFound(format!("unknown symbol '{symbol}'")));
            }
            Ok((0..60)
                .map(|i| Candle {
                    ts: Utc::now() - chrono::Duration::days(60 - i),
                    open: 150.0 + i as f64 * 0.3,
                    high: 151.0 + i as f64 * 0.3,
                    low: 149.0 + i as f64 * 0.3,
                    close: 150.5 + i as f64 * 0.3,
                    volume: 1_000_000,
                })
                .collect())
        }

        async fn news(&self, symbol: &str, limit: usize) -> Result<Vec<NewsItem>> {
            Ok((0..limit.min(3))
                .map(|i| NewsItem {
                    title: format!("{} headline {}", symbol.to_uppercase(), i + 1),
                    url: format!("https://news.example/{symbol}/{i}"),
                    source: "example-wire".into(),
                    published_at: Some(Utc::now()),
                    summary: None,
                })
                .collect())
        }
    }

    pub struct StubSearchBackend;

    #[async_trait::async_trait]
    impl SearchBackend for StubSearchBackend {
        fn name(&self) -> &'static str {
            "ddgs"
        }
        async fn search(
            &self,
            query: &str,
            _count: usize,
            _timeout: Duration,
        ) -> Result<Vec<SearchResult>> {
            Ok(vec![
                SearchResult::new(
                    format!("Result about {query}"),
                    "https://reuters.com/markets/article-1",
                    format!("Coverage of {query} from the wire"),
                    "ddgs",
                    1.0,
                ),
                SearchResult::new(
                    "Background explainer",
                    "https://example.com/background",
                    "General background",
                    "ddgs",
                    0.5,
                ),
            ])
        }
    }

    /// A full registry wired to stubs. The TempDir keeps the prediction
    /// model store alive for the test's duration.
    pub async fn test_registry() -> (ToolRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let breakers = Arc::new(BreakerMap::new(Default::default()));
        let limiters = Arc::new(LimiterMap::new(&Default::default()));
        let engine = SearchEngine::new(
            SearchConfig { mode: SearchMode::Fast, ..SearchConfig::default() },
            None,
            Some(Arc::new(StubSearchBackend)),
            None,
            None,
            breakers,
            limiters,
        )
        .unwrap();
        let forecaster = Arc::new(Forecaster::new(PredictionConfig {
            model_dir: dir.path().to_path_buf(),
            auto_train: true,
            min_history: 30,
        }));
        let registry = ToolRegistry::new(
            Arc::new(StubMarket),
            Arc::new(engine),
            None,
            forecaster,
            5,
        );
        (registry, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_registry;

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest { id: format!("call_{name}"), name: name.into(), arguments: args }
    }

    fn deps() -> (LimiterMap, BreakerMap, Metrics) {
        (
            LimiterMap::new(&Default::default()),
            BreakerMap::new(Default::default()),
            Metrics::new(),
        )
    }

    async fn run_one(
        registry: &ToolRegistry,
        c: ToolCallRequest,
    ) -> ToolOutput {
        let (limiters, breakers, metrics) = deps();
        dispatch(
            registry,
            &limiters,
            &breakers,
            &metrics,
            &c,
            Instant::now() + Duration::from_secs(30),
            Uuid::new_v4(),
        )
        .await
    }

    #[tokio::test]
    async fn quote_dispatch_returns_typed_payload() {
        let (registry, _dir) = test_registry().await;
        let out = run_one(&registry, call(QUOTE_TOOL, serde_json::json!({"symbol": "AAPL"}))).await;
        match out.payload {
            ToolPayload::Quote(q) => {
                assert_eq!(q.symbol, "AAPL");
                assert!((q.price - 172.34).abs() < 1e-9);
            }
            other => panic!("expected quote payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_recoverable_error_payload() {
        let (registry, _dir) = test_registry().await;
        let out = run_one(&registry, call("launch_rocket", serde_json::json!({}))).await;
        match out.payload {
            ToolPayload::Error { kind, .. } => assert_eq!(kind, "invalid_request"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_violations_are_reported_to_the_model() {
        let (registry, _dir) = test_registry().await;

        // Missing required field.
        let out = run_one(&registry, call(QUOTE_TOOL, serde_json::json!({}))).await;
        match &out.payload {
            ToolPayload::Error { kind, message } => {
                assert_eq!(kind, "tool_arg_invalid");
                assert!(message.contains("symbol"));
            }
            other => panic!("expected error payload, got {other:?}"),
        }

        // Unknown field is rejected (strict validation).
        let out = run_one(
            &registry,
            call(QUOTE_TOOL, serde_json::json!({"symbol": "AAPL", "fast": true})),
        )
        .await;
        assert!(out.is_error());

        // Enum violation.
        let out = run_one(
            &registry,
            call(HISTORY_TOOL, serde_json::json!({"symbol": "AAPL", "period": "7y"})),
        )
        .await;
        assert!(out.is_error());
    }

    #[tokio::test]
    async fn upstream_not_found_is_classified() {
        let (registry, _dir) = test_registry().await;
        let out = run_one(&registry, call(QUOTE_TOOL, serde_json::json!({"symbol": "ZZZZ"}))).await;
        match out.payload {
            ToolPayload::Error { kind, .. } => assert_eq!(kind, "not_found"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn web_search_elides_synthesis() {
        let (registry, _dir) = test_registry().await;
        let out = run_one(
            &registry,
            call(WEB_SEARCH_TOOL, serde_json::json!({"query": "Latest Tesla news"})),
        )
        .await;
        match out.payload {
            ToolPayload::WebSearch(resp) => {
                assert!(!resp.results.is_empty());
                assert!(!resp.citations.is_empty());
                assert_eq!(resp.synthesis_time_ms, 0);
                assert!(resp.answer.is_none());
            }
            other => panic!("expected web-search payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forecast_taxonomy_errors_stay_in_payloads() {
        let (registry, _dir) = test_registry().await;
        let out = run_one(
            &registry,
            call(PREDICT_TOOL, serde_json::json!({"symbol": "AAPL", "horizon": 40})),
        )
        .await;
        match out.payload {
            ToolPayload::Error { kind, .. } => assert_eq!(kind, "tool_arg_invalid"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn breaker_open_fails_fast_with_classified_error() {
        let (registry, _dir) = test_registry().await;
        let (limiters, breakers, metrics) = deps();

        // Force the market-data breaker open.
        let breaker = breakers.get("market-data");
        for _ in 0..5 {
            breaker.record_failure();
        }

        let out = dispatch(
            &registry,
            &limiters,
            &breakers,
            &metrics,
            &call(QUOTE_TOOL, serde_json::json!({"symbol": "AAPL"})),
            Instant::now() + Duration::from_secs(30),
            Uuid::new_v4(),
        )
        .await;
        match out.payload {
            ToolPayload::Error { kind, .. } => assert_eq!(kind, "upstream_unavailable"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_schema_accepts_its_canonical_arguments() {
        // Round-trip property: the advertised schema accepts exactly the
        // arguments each handler decodes.
        let (registry, _dir) = test_registry().await;
        let samples = [
            (QUOTE_TOOL, serde_json::json!({"symbol": "AAPL"})),
            (HISTORY_TOOL, serde_json::json!({"symbol": "AAPL", "period": "1mo", "interval": "1d"})),
            (NEWS_TOOL, serde_json::json!({"symbol": "AAPL", "limit": 5})),
            (RAG_TOOL, serde_json::json!({"query": "dividend policy", "limit": 3})),
            (WEB_SEARCH_TOOL, serde_json::json!({"query": "tesla", "max_results": 5})),
            (PREDICT_TOOL, serde_json::json!({"symbol": "AAPL", "horizon": 10})),
        ];
        for (name, args) in samples {
            let spec = registry.get(name).unwrap().spec();
            schema::validate(&spec.parameters, &args)
                .unwrap_or_else(|e| panic!("{name} rejected canonical args: {e}"));
        }
    }
}
