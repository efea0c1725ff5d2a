//! Knowledge-base retrieval.
//!
//! The embedder and the nearest-neighbor index are consumed as opaque
//! services; the in-memory cosine index ships as the default backing for a
//! JSON-file knowledge base loaded at startup.

use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sp_domain::error::{Error, Result};
use sp_domain::search::RagHit;
use sp_providers::Embedder;

/// One knowledge-base document as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbDocument {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Load the knowledge base: a JSON array of documents.
pub fn load_kb(path: &Path) -> Result<Vec<KbDocument>> {
    let raw = std::fs::read_to_string(path)?;
    let docs: Vec<KbDocument> = serde_json::from_str(&raw)?;
    Ok(docs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vector index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque nearest-neighbor index contract.
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RagHit>>;
}

/// Brute-force cosine index. Fine for the local knowledge base — a few
/// thousand documents at most.
pub struct InMemoryIndex {
    entries: RwLock<Vec<(KbDocument, Vec<f32>)>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    pub fn insert(&self, doc: KbDocument, vector: Vec<f32>) {
        self.entries.write().push((doc, vector));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Embed and index a batch of documents.
    pub async fn ingest(&self, embedder: &dyn Embedder, docs: Vec<KbDocument>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        if vectors.len() != docs.len() {
            return Err(Error::Internal(format!(
                "embedder returned {} vectors for {} documents",
                vectors.len(),
                docs.len()
            )));
        }
        let count = docs.len();
        let mut entries = self.entries.write();
        for (doc, vector) in docs.into_iter().zip(vectors) {
            entries.push((doc, vector));
        }
        Ok(count)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VectorIndex for InMemoryIndex {
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RagHit>> {
        let entries = self.entries.read();
        let mut hits: Vec<RagHit> = entries
            .iter()
            .map(|(doc, v)| RagHit {
                doc_id: doc.id.clone(),
                score: cosine(vector, v),
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Searcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Embeds a query and asks the index for the nearest documents.
pub struct RagSearcher {
    embedder: std::sync::Arc<dyn Embedder>,
    index: std::sync::Arc<dyn VectorIndex>,
}

impl RagSearcher {
    pub fn new(
        embedder: std::sync::Arc<dyn Embedder>,
        index: std::sync::Arc<dyn VectorIndex>,
    ) -> Self {
        Self { embedder, index }
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<RagHit>> {
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vec = vectors
            .first()
            .ok_or_else(|| Error::Internal("embedder returned no vector for query".into()))?;
        self.index.query(query_vec, k).await
    }
}
