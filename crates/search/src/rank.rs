//! Combined scoring, tie-breaking, and citation assignment.
//!
//! combined = (0.4·norm(bm25) + 0.4·norm(semantic) + 0.1·raw + 0.1·quality)
//!            × domain trust factor
//!
//! Ties break by raw score, then preferred provider, then shorter URL.
//! Citation ids are 1…N in final rank order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use sp_domain::config::SearchConfig;
use sp_domain::search::{Citation, SearchResult};

const W_BM25: f64 = 0.4;
const W_SEMANTIC: f64 = 0.4;
const W_RAW: f64 = 0.1;
const W_QUALITY: f64 = 0.1;

const TRUST_BOOST: f64 = 1.15;
const TRUST_PENALTY: f64 = 0.4;

/// Min-max normalize into [0,1]. A flat distribution maps to 0.5 so it
/// neither dominates nor zeroes out the weighted sum.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let (min, max) = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    if scores.is_empty() || (max - min) < 1e-12 {
        return vec![0.5; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / (max - min)).collect()
}

/// Structural quality cues independent of the query.
fn quality_score(r: &SearchResult) -> f64 {
    let mut q: f64 = 0.0;
    if r.url.starts_with("https://") {
        q += 0.4;
    }
    if !r.title.trim().is_empty() {
        q += 0.2;
    }
    // Substantial snippets read better in synthesis than stubs.
    q += match r.snippet.len() {
        0 => 0.0,
        1..=40 => 0.2,
        _ => 0.4,
    };
    q.min(1.0)
}

fn trust_factor(domain: &str, cfg: &SearchConfig) -> f64 {
    let matches_suffix = |list: &[String]| {
        list.iter()
            .any(|d| domain == d || domain.ends_with(&format!(".{d}")))
    };
    if matches_suffix(&cfg.denied_domains) {
        TRUST_PENALTY
    } else if matches_suffix(&cfg.trusted_domains) {
        TRUST_BOOST
    } else {
        1.0
    }
}

fn provider_preference(provider: &str) -> u8 {
    // Lower sorts first on ties.
    match provider {
        "brave" => 0,
        _ => 1,
    }
}

/// Fill in scores, sort, and assign citation ids. `bm25` and `semantic`
/// are parallel to `results`; missing semantic scores pass zeros.
pub fn rank(
    mut results: Vec<SearchResult>,
    bm25: &[f64],
    semantic: &[f64],
    cfg: &SearchConfig,
) -> Vec<SearchResult> {
    let bm25_norm = normalize(bm25);
    let sem_norm = normalize(semantic);

    for (i, r) in results.iter_mut().enumerate() {
        r.bm25_score = bm25.get(i).copied().unwrap_or(0.0);
        r.semantic_score = semantic.get(i).copied().unwrap_or(0.0);
        let nb = bm25_norm.get(i).copied().unwrap_or(0.0);
        let ns = sem_norm.get(i).copied().unwrap_or(0.0);
        let base = W_BM25 * nb + W_SEMANTIC * ns + W_RAW * r.raw_score + W_QUALITY * quality_score(r);
        r.combined_score = base * trust_factor(&r.domain(), cfg);
    }

    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.raw_score.partial_cmp(&a.raw_score).unwrap_or(Ordering::Equal))
            .then_with(|| provider_preference(&a.provider).cmp(&provider_preference(&b.provider)))
            .then_with(|| a.url.len().cmp(&b.url.len()))
    });

    for (i, r) in results.iter_mut().enumerate() {
        r.citation_id = Some(i as u32 + 1);
    }
    results
}

/// Build the citation map from ranked results.
pub fn citations(results: &[SearchResult]) -> BTreeMap<u32, Citation> {
    results
        .iter()
        .filter_map(|r| {
            let id = r.citation_id?;
            Some((
                id,
                Citation {
                    title: r.title.clone(),
                    url: r.url.clone(),
                    domain: r.domain(),
                    snippet: r.snippet.clone(),
                },
            ))
        })
        .collect()
}

/// Aggregate confidence: mean combined score of the top three, clamped.
pub fn confidence(results: &[SearchResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let top: Vec<f64> = results.iter().take(3).map(|r| r.combined_score).collect();
    (top.iter().sum::<f64>() / top.len() as f64).clamp(0.0, 1.0)
}
