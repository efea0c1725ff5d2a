//! The search pipeline: fan-out → extract → rank → synthesize (or elide).

use std::sync::Arc;
use std::time::{Duration, Instant};

use sp_domain::config::{SearchConfig, SearchMode};
use sp_domain::search::{SearchResponse, SearchResult};
use sp_providers::{ChatRequest, Embedder, LlmClient};
use sp_upstream::{BreakerMap, LimiterMap};

use crate::backend::{BraveBackend, DuckBackend, SearchBackend};
use crate::{bm25, extract, rank, synthesize};

/// Semantic rerank width per mode.
const RERANK_FAST: usize = 5;
const RERANK_FULL: usize = 15;
/// Wall-clock budget for the embedding batch.
const EMBED_BUDGET_FAST: Duration = Duration::from_secs(2);
const EMBED_BUDGET_FULL: Duration = Duration::from_secs(4);
/// Pages fetched for content extraction in comprehensive mode.
const EXTRACT_TOP: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub mode: SearchMode,
    /// When false (the orchestrator's tool loop), the second-pass LLM
    /// synthesis is skipped and `synthesis_time_ms` stays zero.
    pub synthesize: bool,
    /// Absolute end-to-end deadline for the whole pipeline.
    pub deadline: Instant,
}

impl SearchOptions {
    pub fn for_tool_loop(cfg: &SearchConfig, deadline: Instant) -> Self {
        Self {
            max_results: cfg.max_results,
            mode: cfg.mode,
            synthesize: false,
            deadline,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SearchEngine {
    cfg: SearchConfig,
    primary: Option<Arc<dyn SearchBackend>>,
    fallback: Option<Arc<dyn SearchBackend>>,
    embedder: Option<Arc<dyn Embedder>>,
    /// LLM + deployment used for query rewrite and standalone synthesis.
    synthesizer: Option<(Arc<dyn LlmClient>, String)>,
    breakers: Arc<BreakerMap>,
    limiters: Arc<LimiterMap>,
    fetcher: reqwest::Client,
}

impl SearchEngine {
    pub fn new(
        cfg: SearchConfig,
        primary: Option<Arc<dyn SearchBackend>>,
        fallback: Option<Arc<dyn SearchBackend>>,
        embedder: Option<Arc<dyn Embedder>>,
        synthesizer: Option<(Arc<dyn LlmClient>, String)>,
        breakers: Arc<BreakerMap>,
        limiters: Arc<LimiterMap>,
    ) -> sp_domain::Result<Self> {
        Ok(Self {
            cfg,
            primary,
            fallback,
            embedder,
            synthesizer,
            breakers,
            limiters,
            fetcher: extract::fetch_client()?,
        })
    }

    /// Wire the production backends: Brave when a key is configured, the
    /// keyless fallback always.
    pub fn from_config(
        cfg: SearchConfig,
        embedder: Option<Arc<dyn Embedder>>,
        synthesizer: Option<(Arc<dyn LlmClient>, String)>,
        breakers: Arc<BreakerMap>,
        limiters: Arc<LimiterMap>,
    ) -> sp_domain::Result<Self> {
        let primary: Option<Arc<dyn SearchBackend>> = match cfg.brave_api_key.clone() {
            Some(key) if !key.is_empty() => Some(Arc::new(BraveBackend::new(key)?)),
            _ => {
                tracing::warn!("no Brave API key; web search runs on the fallback provider only");
                None
            }
        };
        let fallback: Option<Arc<dyn SearchBackend>> = Some(Arc::new(DuckBackend::new()?));
        Self::new(cfg, primary, fallback, embedder, synthesizer, breakers, limiters)
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    /// Run the full pipeline. Never errors: upstream failures degrade to
    /// fewer (possibly zero) results.
    pub async fn run(&self, query: &str, opts: &SearchOptions) -> SearchResponse {
        let started = Instant::now();

        // Fast mode keeps the user's words; otherwise let the model tighten
        // the query first.
        let effective_query = if opts.mode == SearchMode::Fast {
            query.to_string()
        } else {
            self.rewrite_query(query).await
        };

        let mut results = self.fan_out(&effective_query, opts).await;
        let search_time_ms = started.elapsed().as_millis() as u64;

        if results.is_empty() {
            let mut resp = SearchResponse::empty(query);
            resp.search_time_ms = search_time_ms;
            if opts.synthesize {
                // The notice does not need a model call.
                resp.answer = Some(synthesize::NO_SOURCES_ANSWER.to_string());
            }
            return resp;
        }

        if opts.mode == SearchMode::Comprehensive {
            self.extract_content(&mut results, opts).await;
        }

        // ── Rank: BM25 + semantic + raw + quality ────────────────────
        let rank_started = Instant::now();
        let docs: Vec<String> = results
            .iter()
            .map(|r| {
                let mut doc = format!("{} {}", r.title, r.snippet);
                if let Some(c) = &r.content {
                    doc.push(' ');
                    doc.push_str(c);
                }
                doc
            })
            .collect();
        let bm25_scores = bm25::Bm25::new(&docs).score(&effective_query);
        let semantic = self
            .semantic_scores(&effective_query, &docs, &bm25_scores, opts.mode)
            .await;

        let mut ranked = rank::rank(results, &bm25_scores, &semantic, &self.cfg);
        ranked.truncate(opts.max_results);

        let citations = rank::citations(&ranked);
        let confidence = rank::confidence(&ranked);

        let mut resp = SearchResponse {
            query: query.to_string(),
            results: ranked,
            citations,
            confidence,
            search_time_ms,
            rank_time_ms: rank_started.elapsed().as_millis() as u64,
            synthesis_time_ms: 0,
            answer: None,
        };

        // ── Synthesis (standalone callers only) ──────────────────────
        if opts.synthesize {
            if let Some((llm, deployment)) = &self.synthesizer {
                let syn_start = Instant::now();
                match synthesize::synthesize(
                    llm.as_ref(),
                    deployment,
                    query,
                    &resp.results,
                    Some(opts.deadline),
                )
                .await
                {
                    Ok(answer) => {
                        resp.synthesis_time_ms = syn_start.elapsed().as_millis() as u64;
                        resp.answer = Some(answer);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "synthesis failed; returning ranked results only");
                    }
                }
            }
        }

        resp
    }

    // ── Fan-out ──────────────────────────────────────────────────────

    /// Query both providers in parallel under their breakers and limiters,
    /// then merge by URL with the primary preferred.
    async fn fan_out(&self, query: &str, opts: &SearchOptions) -> Vec<SearchResult> {
        let primary_timeout = Duration::from_millis(self.cfg.primary_timeout_ms);
        let fallback_timeout = Duration::from_millis(self.cfg.fallback_timeout_ms);

        let primary_fut = self.provider_call(self.primary.as_ref(), query, opts, primary_timeout);
        let fallback_fut =
            self.provider_call(self.fallback.as_ref(), query, opts, fallback_timeout);

        let (primary_results, fallback_results) = tokio::join!(primary_fut, fallback_fut);
        merge_by_url(primary_results, fallback_results)
    }

    /// One provider call: limiter → breaker → search. Failure of any stage
    /// yields an empty slice from that provider.
    async fn provider_call(
        &self,
        backend: Option<&Arc<dyn SearchBackend>>,
        query: &str,
        opts: &SearchOptions,
        timeout: Duration,
    ) -> Vec<SearchResult> {
        let Some(backend) = backend else {
            return Vec::new();
        };
        let name = backend.name();

        let limiter_deadline = tokio::time::Instant::from_std(opts.deadline);
        if let Err(e) = self.limiters.acquire(name, limiter_deadline).await {
            tracing::debug!(provider = name, error = %e, "search provider throttled out");
            return Vec::new();
        }

        let breaker = self.breakers.get(name);
        match breaker
            .guard(backend.search(query, opts.max_results, timeout))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::debug!(provider = name, error = %e, "search provider unavailable");
                Vec::new()
            }
        }
    }

    // ── Query rewrite ────────────────────────────────────────────────

    /// LLM-tightened query for non-fast modes; any failure keeps the
    /// original wording.
    async fn rewrite_query(&self, query: &str) -> String {
        let Some((llm, deployment)) = &self.synthesizer else {
            return query.to_string();
        };
        let mut req = ChatRequest::new(
            deployment.clone(),
            vec![
                sp_domain::message::Message::system(
                    "Rewrite the user's question as a concise web search query. \
                     Reply with the query only.",
                ),
                sp_domain::message::Message::user(query),
            ],
        );
        req.temperature = Some(0.0);
        req.max_tokens = Some(40);
        req.deadline = Some(Instant::now() + Duration::from_millis(1500));

        match llm.complete(&req).await {
            Ok(resp) if !resp.content.trim().is_empty() => {
                resp.content.trim().trim_matches('"').to_string()
            }
            Ok(_) => query.to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "query rewrite failed, keeping original");
                query.to_string()
            }
        }
    }

    // ── Content extraction ───────────────────────────────────────────

    async fn extract_content(&self, results: &mut [SearchResult], opts: &SearchOptions) {
        let remaining = opts.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        let per_fetch = remaining.min(Duration::from_secs(3));
        let breaker = self.breakers.get("web-fetch");

        let futures: Vec<_> = results
            .iter()
            .take(EXTRACT_TOP)
            .map(|r| {
                let url = r.url.clone();
                let client = &self.fetcher;
                let breaker = breaker.clone();
                async move { breaker.guard(extract::page_text(client, &url, per_fetch)).await }
            })
            .collect();

        let texts = futures_util::future::join_all(futures).await;
        for (r, text) in results.iter_mut().zip(texts) {
            match text {
                Ok(t) if !t.is_empty() => r.content = Some(t),
                Ok(_) => {}
                Err(e) => tracing::debug!(url = %r.url, error = %e, "page extraction failed"),
            }
        }
    }

    // ── Semantic rerank ──────────────────────────────────────────────

    /// Cosine similarity between the query and the lexically strongest W
    /// candidates, batched, under a fixed wall-clock budget. Anything that
    /// fails or misses the budget scores zero.
    async fn semantic_scores(
        &self,
        query: &str,
        docs: &[String],
        bm25_scores: &[f64],
        mode: SearchMode,
    ) -> Vec<f64> {
        let mut scores = vec![0.0; docs.len()];
        let Some(embedder) = &self.embedder else {
            return scores;
        };

        let width = if mode == SearchMode::Fast { RERANK_FAST } else { RERANK_FULL };
        let budget = if mode == SearchMode::Fast { EMBED_BUDGET_FAST } else { EMBED_BUDGET_FULL };

        // Pick the top-W candidates by BM25.
        let mut order: Vec<usize> = (0..docs.len()).collect();
        order.sort_by(|&a, &b| {
            bm25_scores[b]
                .partial_cmp(&bm25_scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let picked: Vec<usize> = order.into_iter().take(width).collect();

        let mut batch = Vec::with_capacity(picked.len() + 1);
        batch.push(query.to_string());
        batch.extend(picked.iter().map(|&i| docs[i].clone()));

        let embedded = match tokio::time::timeout(budget, embedder.embed(&batch)).await {
            Ok(Ok(vectors)) if vectors.len() == batch.len() => vectors,
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                tracing::debug!("semantic rerank skipped (embedding failure or budget)");
                return scores;
            }
        };

        let query_vec = &embedded[0];
        for (slot, &doc_idx) in picked.iter().enumerate() {
            scores[doc_idx] = cosine(query_vec, &embedded[slot + 1]);
        }
        scores
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

/// Merge provider result lists by URL: primary results keep their position
/// and win collisions; unseen fallback results append in order.
fn merge_by_url(primary: Vec<SearchResult>, fallback: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut merged = Vec::with_capacity(primary.len() + fallback.len());
    for r in primary.into_iter().chain(fallback) {
        let key = r.url.trim_end_matches('/').to_string();
        if seen.insert(key) {
            merged.push(r);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_domain::config::RateLimitConfig;
    use sp_domain::error::{Error, Result};
    use std::collections::HashMap;

    struct StubBackend {
        name: &'static str,
        results: Vec<(&'static str, &'static str)>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SearchBackend for StubBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn search(
            &self,
            _query: &str,
            _count: usize,
            _timeout: Duration,
        ) -> Result<Vec<SearchResult>> {
            if self.fail {
                return Err(Error::Timeout(format!("{} stub down", self.name)));
            }
            let total = self.results.len();
            Ok(self
                .results
                .iter()
                .enumerate()
                .map(|(i, (title, url))| {
                    SearchResult::new(*title, *url, "snippet text here", self.name, 1.0 - i as f64 / total as f64)
                })
                .collect())
        }
    }

    fn engine(primary: Option<StubBackend>, fallback: Option<StubBackend>) -> SearchEngine {
        let breakers = Arc::new(BreakerMap::new(HashMap::new()));
        let limits: HashMap<String, RateLimitConfig> = HashMap::new();
        let limiters = Arc::new(LimiterMap::new(&limits));
        SearchEngine::new(
            SearchConfig { mode: SearchMode::Fast, ..SearchConfig::default() },
            primary.map(|b| Arc::new(b) as Arc<dyn SearchBackend>),
            fallback.map(|b| Arc::new(b) as Arc<dyn SearchBackend>),
            None,
            None,
            breakers,
            limiters,
        )
        .unwrap()
    }

    fn opts() -> SearchOptions {
        SearchOptions {
            max_results: 8,
            mode: SearchMode::Fast,
            synthesize: false,
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn merge_prefers_primary_on_url_collision() {
        let primary = StubBackend {
            name: "brave",
            results: vec![("P one", "https://a.com/1"), ("P two", "https://b.com/2")],
            fail: false,
        };
        let fallback = StubBackend {
            name: "ddgs",
            results: vec![("F dup", "https://a.com/1"), ("F three", "https://c.com/3")],
            fail: false,
        };
        let e = engine(Some(primary), Some(fallback));
        let resp = e.run("tesla news", &opts()).await;

        let urls: Vec<&str> = resp.results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls.len(), 3, "collision removed one duplicate");
        let dup = resp.results.iter().find(|r| r.url == "https://a.com/1").unwrap();
        assert_eq!(dup.provider, "brave");
    }

    #[tokio::test]
    async fn one_dead_provider_still_yields_results() {
        let primary = StubBackend { name: "brave", results: vec![], fail: true };
        let fallback = StubBackend {
            name: "ddgs",
            results: vec![("only", "https://x.com/only")],
            fail: false,
        };
        let e = engine(Some(primary), Some(fallback));
        let resp = e.run("tesla news", &opts()).await;
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].provider, "ddgs");
    }

    #[tokio::test]
    async fn both_dead_providers_yield_empty_not_error() {
        let e = engine(
            Some(StubBackend { name: "brave", results: vec![], fail: true }),
            Some(StubBackend { name: "ddgs", results: vec![], fail: true }),
        );
        let resp = e.run("anything", &opts()).await;
        assert!(resp.results.is_empty());
        assert_eq!(resp.confidence, 0.0);
    }

    #[tokio::test]
    async fn ranked_output_is_ordered_with_sequential_citations() {
        let fallback = StubBackend {
            name: "ddgs",
            results: vec![
                ("Tesla earnings beat", "https://a.com/tesla-earnings"),
                ("Unrelated gardening", "https://b.com/gardening"),
                ("Tesla deliveries", "https://c.com/tesla-deliveries"),
            ],
            fail: false,
        };
        let e = engine(None, Some(fallback));
        let resp = e.run("tesla earnings", &opts()).await;

        for pair in resp.results.windows(2) {
            assert!(pair[0].combined_score >= pair[1].combined_score);
        }
        let ids: Vec<u32> = resp.results.iter().filter_map(|r| r.citation_id).collect();
        assert_eq!(ids, (1..=resp.results.len() as u32).collect::<Vec<_>>());
        assert_eq!(resp.citations.len(), resp.results.len());
        assert_eq!(resp.synthesis_time_ms, 0, "synthesis elided");
        assert!(resp.answer.is_none());
    }

    #[tokio::test]
    async fn no_sources_with_synthesis_requested_notes_the_gap() {
        let e = engine(
            Some(StubBackend { name: "brave", results: vec![], fail: true }),
            None,
        );
        let mut o = opts();
        o.synthesize = true;
        let resp = e.run("anything", &o).await;
        let answer = resp.answer.expect("notice answer");
        assert!(answer.contains("could not find"));
        assert_eq!(resp.synthesis_time_ms, 0);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
