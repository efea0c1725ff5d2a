//! Startup wiring: construct every process-wide singleton from the config
//! and assemble the [`AppState`]. Construction is single-threaded; all the
//! shared state is concurrent-safe afterwards.

use std::sync::Arc;
use std::time::Duration;

use sp_domain::config::Config;
use sp_providers::{Embedder, LlmClient, ModelRegistry, OpenAiCompatClient};
use sp_search::SearchEngine;
use sp_sessions::{ConversationStore, TracingLogSink};
use sp_tools::{Forecaster, HttpMarketData, InMemoryIndex, RagSearcher};
use sp_upstream::{BreakerMap, LimiterMap};

use crate::runtime::cache::ResponseCaches;
use crate::runtime::inflight::InflightMap;
use crate::runtime::metrics::Metrics;
use crate::runtime::selector::ToolSelector;
use crate::runtime::tools::ToolRegistry;
use crate::state::AppState;

pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());

    // ── Upstream protection ───────────────────────────────────────────
    let breakers = Arc::new(BreakerMap::new(config.breakers.clone()));
    let limiters = Arc::new(LimiterMap::new(&config.limits));

    // ── LLM client & alias table ──────────────────────────────────────
    let llm_client = Arc::new(OpenAiCompatClient::from_config(&config.llm)?);
    let llm: Arc<dyn LlmClient> = llm_client.clone();
    let embedder: Arc<dyn Embedder> = llm_client;
    let models = Arc::new(ModelRegistry::new(&config.llm, llm)?);

    // ── Web search ────────────────────────────────────────────────────
    // Standalone synthesis and query rewrite ride the cheap alias; the
    // orchestrator elides synthesis anyway.
    let synthesizer = (models.client(), models.resolve_simple().deployment);
    let search_engine = Arc::new(SearchEngine::from_config(
        config.search.clone(),
        Some(embedder.clone()),
        Some(synthesizer),
        breakers.clone(),
        limiters.clone(),
    )?);

    // ── Market data, knowledge base, prediction ───────────────────────
    let market = Arc::new(HttpMarketData::new()?);
    let rag = build_rag(&config, embedder.clone()).await;
    let forecaster = Arc::new(Forecaster::new(config.prediction.clone()));

    let tools = Arc::new(ToolRegistry::new(
        market,
        search_engine,
        rag,
        forecaster,
        config.knowledge.top_k,
    ));

    let selector = Arc::new(ToolSelector::new(
        config.selector.clone(),
        Some(embedder),
        metrics.clone(),
    ));

    // ── Conversations & caches ────────────────────────────────────────
    let conversations = Arc::new(ConversationStore::new(
        config.conversation.max_tokens_per_turn,
        Duration::from_secs(config.conversation.ttl_s),
    ));
    spawn_sweeper(conversations.clone());

    let caches = Arc::new(ResponseCaches::new(&config.cache));
    let inflight = Arc::new(InflightMap::new(Duration::from_secs(config.cache.dedup_ttl_s)));

    Ok(AppState {
        config,
        models,
        conversations,
        tools,
        selector,
        caches,
        inflight,
        breakers,
        limiters,
        metrics,
        turn_log: Arc::new(TracingLogSink),
    })
}

/// Load and embed the knowledge base, if one is configured. Failures are
/// downgraded: the gateway boots without RAG rather than not at all.
async fn build_rag(
    config: &Config,
    embedder: Arc<dyn Embedder>,
) -> Option<Arc<RagSearcher>> {
    let path = config.knowledge.kb_path.as_ref()?;

    let docs = match sp_tools::rag::load_kb(path) {
        Ok(docs) => docs,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "knowledge base load failed; rag_search disabled");
            return None;
        }
    };

    let index = Arc::new(InMemoryIndex::new());
    match index.ingest(embedder.as_ref(), docs).await {
        Ok(count) => {
            tracing::info!(documents = count, "knowledge base indexed");
            Some(Arc::new(RagSearcher::new(embedder, index)))
        }
        Err(e) => {
            tracing::warn!(error = %e, "knowledge base embedding failed; rag_search disabled");
            None
        }
    }
}

/// Periodic TTL sweep so idle conversations do not pile up between turns.
fn spawn_sweeper(conversations: Arc<ConversationStore>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            conversations.sweep();
        }
    });
}
