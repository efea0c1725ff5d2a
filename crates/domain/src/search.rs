//! Web-search and knowledge-base retrieval types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search results & citations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One ranked web-search result.
///
/// Created by a search backend with only `title`/`url`/`snippet`/`provider`/
/// `raw_score` populated; the ranker fills in the remaining scores and the
/// citation id, after which the result is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Extracted page text (comprehensive mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Which backend produced this result ("brave", "ddgs").
    pub provider: String,
    /// Position-derived relevance from the backend, in [0,1].
    pub raw_score: f64,
    #[serde(default)]
    pub bm25_score: f64,
    #[serde(default)]
    pub semantic_score: f64,
    #[serde(default)]
    pub combined_score: f64,
    /// Assigned 1..N in rank order once ranking completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<u32>,
}

impl SearchResult {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
        provider: impl Into<String>,
        raw_score: f64,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            content: None,
            provider: provider.into(),
            raw_score,
            bm25_score: 0.0,
            semantic_score: 0.0,
            combined_score: 0.0,
            citation_id: None,
        }
    }

    /// Registrable domain portion of the URL (host, minus a `www.` prefix).
    pub fn domain(&self) -> String {
        let after_scheme = self.url.split("://").nth(1).unwrap_or(&self.url);
        let host = after_scheme.split('/').next().unwrap_or(after_scheme);
        host.strip_prefix("www.").unwrap_or(host).to_string()
    }
}

/// A citation map entry: everything a client needs to render `[n]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub snippet: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The finished product of the search pipeline: ranked results, the
/// citation map, and (when synthesis ran) a grounded answer with inline
/// `[n]` markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    /// citation id → citation, ordered by id.
    pub citations: BTreeMap<u32, Citation>,
    /// Aggregate confidence in [0,1].
    pub confidence: f64,
    /// Provider fan-out wall clock.
    pub search_time_ms: u64,
    /// Ranking (BM25 + semantic + scoring) wall clock.
    #[serde(default)]
    pub rank_time_ms: u64,
    /// Zero when synthesis was elided.
    pub synthesis_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl SearchResponse {
    /// An empty response for a query that produced no usable sources.
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            results: Vec::new(),
            citations: BTreeMap::new(),
            confidence: 0.0,
            search_time_ms: 0,
            rank_time_ms: 0,
            synthesis_time_ms: 0,
            answer: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge-base hits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One nearest-neighbor hit from the local knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagHit {
    pub doc_id: String,
    pub score: f32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}
