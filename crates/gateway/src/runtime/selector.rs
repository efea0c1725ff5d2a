//! Tool selection: which tools does this query get?
//!
//! Two modes. The ML path embeds the query (embeddings cached for an hour),
//! runs a pre-trained multi-label linear classifier, keeps labels above the
//! confidence threshold, and caps the set. Any failure along that path
//! falls back to the heuristic cue scan and records the fallback. The
//! selector never errors: worst case it returns an empty set.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use sp_domain::config::SelectorConfig;
use sp_providers::Embedder;

use crate::runtime::cache::TtlLruCache;
use crate::runtime::metrics::{bump, Metrics};
use crate::runtime::tools::{self, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    Ml,
    Heuristic,
}

/// An ordered tool subset with per-tool confidence.
#[derive(Debug, Clone)]
pub struct Selection {
    pub tools: Vec<(String, f64)>,
    pub method: SelectionMethod,
    /// Simple queries take the fast path: cheaper model, no heavy tools,
    /// short cache TTL.
    pub simple: bool,
}

impl Selection {
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|(n, _)| n == name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Linear multi-label classifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pre-trained one-vs-rest logistic weights, loaded from JSON at startup.
#[derive(Debug, Deserialize)]
pub struct LinearClassifier {
    pub labels: Vec<String>,
    pub dim: usize,
    /// One weight row per label, each `dim` long.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearClassifier {
    pub fn load(path: &Path) -> sp_domain::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let c: LinearClassifier = serde_json::from_str(&raw)?;
        if c.weights.len() != c.labels.len()
            || c.bias.len() != c.labels.len()
            || c.weights.iter().any(|w| w.len() != c.dim)
        {
            return Err(sp_domain::Error::Internal(
                "classifier weight shapes do not match labels/dim".into(),
            ));
        }
        Ok(c)
    }

    /// Per-label confidence via sigmoid, in label order.
    pub fn scores(&self, embedding: &[f32]) -> Vec<(String, f64)> {
        self.labels
            .iter()
            .zip(self.weights.iter().zip(&self.bias))
            .map(|(label, (w, b))| {
                let dot: f32 = w
                    .iter()
                    .zip(embedding.iter())
                    .map(|(wi, xi)| wi * xi)
                    .sum();
                let z = (dot + b) as f64;
                (label.clone(), 1.0 / (1.0 + (-z).exp()))
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolSelector {
    cfg: SelectorConfig,
    classifier: Option<LinearClassifier>,
    embedder: Option<Arc<dyn Embedder>>,
    embedding_cache: TtlLruCache<Vec<f32>>,
    metrics: Arc<Metrics>,
}

impl ToolSelector {
    pub fn new(
        cfg: SelectorConfig,
        embedder: Option<Arc<dyn Embedder>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let classifier = if cfg.ml_enabled {
            match &cfg.weights_path {
                Some(path) => match LinearClassifier::load(path) {
                    Ok(c) => {
                        tracing::info!(labels = c.labels.len(), "tool classifier loaded");
                        Some(c)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "classifier load failed; heuristic selection only");
                        None
                    }
                },
                None => {
                    tracing::warn!("ML selection enabled but no weights_path configured");
                    None
                }
            }
        } else {
            None
        };

        let embedding_cache =
            TtlLruCache::new(2048, Duration::from_secs(cfg.embedding_cache_ttl_s));

        Self { cfg, classifier, embedder, embedding_cache, metrics }
    }

    /// Select tools for a query. Never errors.
    pub async fn select(&self, query: &str, registry: &ToolRegistry) -> Selection {
        let simple = is_simple_query(query);

        if let (Some(classifier), Some(embedder)) = (&self.classifier, &self.embedder) {
            match self.select_ml(query, classifier, embedder.as_ref(), registry, simple).await {
                Ok(selection) => {
                    bump(&self.metrics.selector_ml);
                    return selection;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ML selection failed, falling back to heuristic");
                    bump(&self.metrics.selector_fallbacks);
                }
            }
        }

        bump(&self.metrics.selector_heuristic);
        let mut selection = heuristic_selection(query, simple);
        selection.tools.retain(|(name, _)| registry.get(name).is_some());
        selection
    }

    async fn select_ml(
        &self,
        query: &str,
        classifier: &LinearClassifier,
        embedder: &dyn Embedder,
        registry: &ToolRegistry,
        simple: bool,
    ) -> sp_domain::Result<Selection> {
        let embedding = match self.embedding_cache.get(query) {
            Some(v) => v,
            None => {
                let batch = [query.to_string()];
                let mut vectors =
                    tokio::time::timeout(Duration::from_secs(2), embedder.embed(&batch))
                        .await
                        .map_err(|_| sp_domain::Error::Timeout("query embedding".into()))??;
                let v = vectors
                    .pop()
                    .ok_or_else(|| sp_domain::Error::Internal("empty embedding batch".into()))?;
                if v.len() != classifier.dim {
                    return Err(sp_domain::Error::Internal(format!(
                        "embedding dim {} != classifier dim {}",
                        v.len(),
                        classifier.dim
                    )));
                }
                self.embedding_cache.put(query, v.clone());
                v
            }
        };

        let mut scored: Vec<(String, f64)> = classifier
            .scores(&embedding)
            .into_iter()
            .filter(|(label, conf)| {
                *conf >= self.cfg.confidence_threshold && registry.get(label).is_some()
            })
            .collect();
        // Stable: confidence descending, label as the deterministic tiebreak.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(self.cfg.max_tools);

        if simple {
            scored.retain(|(name, _)| !registry.is_heavy(name));
        }

        Ok(Selection { tools: scored, method: SelectionMethod::Ml, simple })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heuristics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Greetings, pleasantries, and other queries that deserve the fast path.
pub fn is_simple_query(query: &str) -> bool {
    let q = query.trim().to_lowercase();
    const GREETINGS: &[&str] = &[
        "hi", "hello", "hey", "yo", "thanks", "thank you", "good morning",
        "good afternoon", "good evening", "how are you", "what's up",
    ];
    if GREETINGS.iter().any(|g| q == *g || q.trim_end_matches(['!', '.', '?']) == *g) {
        return true;
    }
    // Very short queries without any market cue.
    q.split_whitespace().count() <= 3 && !has_ticker(query) && !has_market_cue(&q)
}

fn has_ticker(query: &str) -> bool {
    // $TSLA form, or a standalone 1–5 letter uppercase token.
    query.split_whitespace().any(|w| {
        let w = w.trim_matches(|c: char| !c.is_alphanumeric() && c != '$');
        if let Some(sym) = w.strip_prefix('$') {
            return (1..=5).contains(&sym.len()) && sym.chars().all(|c| c.is_ascii_uppercase());
        }
        (2..=5).contains(&w.len()) && w.chars().all(|c| c.is_ascii_uppercase())
    })
}

fn has_market_cue(q: &str) -> bool {
    const CUES: &[&str] = &[
        "price", "stock", "share", "quote", "market", "ticker", "earnings",
        "dividend", "forecast", "predict", "news", "chart", "history",
    ];
    CUES.iter().any(|c| q.contains(c))
}

fn heuristic_selection(query: &str, simple: bool) -> Selection {
    let q = query.to_lowercase();
    let mut tools: Vec<(String, f64)> = Vec::new();
    fn add(tools: &mut Vec<(String, f64)>, name: &str, conf: f64) {
        if !tools.iter().any(|(n, _)| n == name) {
            tools.push((name.to_string(), conf));
        }
    }

    if simple {
        return Selection { tools, method: SelectionMethod::Heuristic, simple };
    }

    let ticker = has_ticker(query);

    if q.contains("price") || q.contains("quote") || q.contains("trading at") || q.contains("worth")
    {
        add(&mut tools, tools::QUOTE_TOOL, if ticker { 0.9 } else { 0.6 });
    }
    if q.contains("history") || q.contains("chart") || q.contains("past ") || q.contains("trend")
        || q.contains("performance")
    {
        add(&mut tools, tools::HISTORY_TOOL, 0.7);
    }
    if q.contains("news") || q.contains("headline") || q.contains("announcement") {
        add(&mut tools, tools::NEWS_TOOL, 0.8);
    }
    if q.contains("latest") || q.contains("today") || q.contains("search") || q.contains("web")
        || q.contains("recent") || q.contains("current events")
    {
        add(&mut tools, tools::WEB_SEARCH_TOOL, 0.6);
    }
    if q.contains("knowledge base") || q.contains("internal doc") || q.contains("our research")
        || q.contains("according to the kb")
    {
        add(&mut tools, tools::RAG_TOOL, 0.8);
    }
    if q.contains("predict") || q.contains("forecast") || q.contains("price target")
        || q.contains("will it go")
    {
        add(&mut tools, tools::PREDICT_TOOL, 0.7);
    }

    // A bare ticker question defaults to the quote tool.
    if tools.is_empty() && ticker {
        add(&mut tools, tools::QUOTE_TOOL, 0.5);
    }

    tools.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    Selection { tools, method: SelectionMethod::Heuristic, simple }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tools::test_support::test_registry;
    use sp_domain::error::Result;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait::async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }
    }

    fn selector_with(
        cfg: SelectorConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> ToolSelector {
        ToolSelector::new(cfg, embedder, Arc::new(Metrics::new()))
    }

    #[test]
    fn greetings_are_simple() {
        assert!(is_simple_query("Hello"));
        assert!(is_simple_query("thanks!"));
        assert!(is_simple_query("ok"));
        assert!(!is_simple_query("What is the current price of AAPL?"));
        assert!(!is_simple_query("TSLA"));
    }

    #[tokio::test]
    async fn price_question_selects_the_quote_tool() {
        let (registry, _dirs) = test_registry().await;
        let s = selector_with(SelectorConfig::default(), None);
        let sel = s.select("What is the current price of AAPL?", &registry).await;
        assert_eq!(sel.method, SelectionMethod::Heuristic);
        assert!(sel.contains(tools::QUOTE_TOOL));
        let (_, conf) = &sel.tools[0];
        assert!(*conf >= 0.5);
    }

    #[tokio::test]
    async fn news_question_selects_news_and_search() {
        let (registry, _dirs) = test_registry().await;
        let s = selector_with(SelectorConfig::default(), None);
        let sel = s.select("Latest Tesla news", &registry).await;
        assert!(sel.contains(tools::NEWS_TOOL));
        assert!(sel.contains(tools::WEB_SEARCH_TOOL));
    }

    #[tokio::test]
    async fn simple_queries_get_no_tools() {
        let (registry, _dirs) = test_registry().await;
        let s = selector_with(SelectorConfig::default(), None);
        let sel = s.select("Hello", &registry).await;
        assert!(sel.simple);
        assert!(sel.tools.is_empty());
    }

    #[tokio::test]
    async fn ml_path_thresholds_caps_and_orders() {
        let (registry, _dirs) = test_registry().await;

        // Classifier over a 2-dim embedding space with hand-set weights:
        // strongly positive for quote + news, negative for the rest.
        let classifier = LinearClassifier {
            labels: vec![
                tools::QUOTE_TOOL.into(),
                tools::NEWS_TOOL.into(),
                tools::PREDICT_TOOL.into(),
            ],
            dim: 2,
            weights: vec![vec![4.0, 0.0], vec![2.0, 0.0], vec![-4.0, 0.0]],
            bias: vec![0.0, 0.0, 0.0],
        };

        let mut cfg = SelectorConfig::default();
        cfg.ml_enabled = true;
        cfg.max_tools = 2;
        let mut s = selector_with(cfg, Some(Arc::new(FixedEmbedder { vector: vec![1.0, 0.0] })));
        s.classifier = Some(classifier);

        let sel = s.select("how is AAPL doing versus the street", &registry).await;
        assert_eq!(sel.method, SelectionMethod::Ml);
        let names = sel.names();
        assert_eq!(names, vec![tools::QUOTE_TOOL, tools::NEWS_TOOL]);
        assert!(sel.tools[0].1 > sel.tools[1].1);
        // predict scored sigmoid(-4) ≈ 0.018 < 0.3 and was cut.
        assert!(!sel.contains(tools::PREDICT_TOOL));
    }

    #[tokio::test]
    async fn ml_failure_falls_back_to_heuristic() {
        struct FailingEmbedder;
        #[async_trait::async_trait]
        impl Embedder for FailingEmbedder {
            async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                Err(sp_domain::Error::Timeout("embedding upstream".into()))
            }
        }

        let (registry, _dirs) = test_registry().await;
        let metrics = Arc::new(Metrics::new());
        let mut cfg = SelectorConfig::default();
        cfg.ml_enabled = true;
        let mut s = ToolSelector::new(cfg, Some(Arc::new(FailingEmbedder)), metrics.clone());
        s.classifier = Some(LinearClassifier {
            labels: vec![tools::QUOTE_TOOL.into()],
            dim: 2,
            weights: vec![vec![1.0, 0.0]],
            bias: vec![0.0],
        });

        let sel = s.select("What is the price of AAPL?", &registry).await;
        assert_eq!(sel.method, SelectionMethod::Heuristic);
        assert!(sel.contains(tools::QUOTE_TOOL));
        assert_eq!(
            metrics.selector_fallbacks.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
