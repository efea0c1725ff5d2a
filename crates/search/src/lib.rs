//! Multi-provider web search with ranking and citation synthesis.
//!
//! [`engine::SearchEngine`] is the entry point: parallel provider fan-out
//! (Brave primary, DuckDuckGo-style fallback) under breakers and limiters,
//! BM25 + embedding reranking, domain-trust weighting, citation assignment,
//! and an optional second-pass LLM synthesis that the orchestrator elides
//! when search runs inside its tool loop.

pub mod backend;
pub mod bm25;
pub mod engine;
pub mod extract;
pub mod rank;
pub mod synthesize;

pub use backend::SearchBackend;
pub use engine::{SearchEngine, SearchOptions};
