//! Second-pass synthesis: summarize ranked sources into a grounded answer
//! with inline `[n]` citation markers.
//!
//! Called only when the engine runs standalone; inside the orchestrator's
//! tool loop synthesis is elided and the main model does the single
//! authoritative pass.

use std::time::Instant;

use sp_domain::error::Result;
use sp_domain::message::Message;
use sp_domain::search::SearchResult;
use sp_providers::{ChatRequest, LlmClient};

/// Per-source context budget in the synthesis prompt.
const SOURCE_CHARS: usize = 800;

pub const NO_SOURCES_ANSWER: &str =
    "I could not find any web sources for this query, so I cannot give a sourced answer. \
     Try rephrasing the query or asking again later.";

/// Produce a cited answer over the ranked sources.
///
/// With no sources this returns a fixed notice without calling the model.
pub async fn synthesize(
    llm: &dyn LlmClient,
    deployment: &str,
    query: &str,
    results: &[SearchResult],
    deadline: Option<Instant>,
) -> Result<String> {
    if results.is_empty() {
        return Ok(NO_SOURCES_ANSWER.to_string());
    }

    let mut sources = String::new();
    for r in results {
        let id = r.citation_id.unwrap_or(0);
        let body = r.content.as_deref().unwrap_or(&r.snippet);
        let body: String = body.chars().take(SOURCE_CHARS).collect();
        sources.push_str(&format!("[{id}] {} ({})\n{body}\n\n", r.title, r.domain()));
    }

    let system = "You answer questions using only the numbered sources provided. \
                  Cite every claim with its source marker, e.g. [1] or [2][3]. \
                  If the sources do not cover the question, say so explicitly.";
    let user = format!("Question: {query}\n\nSources:\n{sources}");

    let mut req = ChatRequest::new(
        deployment,
        vec![Message::system(system), Message::user(user)],
    );
    req.temperature = Some(0.2);
    req.max_tokens = Some(700);
    req.deadline = deadline;

    let resp = llm.complete(&req).await?;
    Ok(resp.content)
}

/// Citation markers (`[n]`) present in a synthesized answer.
pub fn cited_ids(answer: &str) -> Vec<u32> {
    let mut ids = Vec::new();
    let bytes = answer.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(close) = answer[i + 1..].find(']') {
                let inner = &answer[i + 1..i + 1 + close];
                if let Ok(id) = inner.parse::<u32>() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                i += close + 2;
                continue;
            }
        }
        i += 1;
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cited_ids_parses_markers() {
        assert_eq!(cited_ids("Revenue rose 12% [1], margins fell [3][1]."), vec![1, 3]);
        assert_eq!(cited_ids("no markers here"), Vec::<u32>::new());
        assert_eq!(cited_ids("[not-a-number] but [2] counts"), vec![2]);
    }

    #[test]
    fn no_sources_notice_mentions_the_gap() {
        assert!(NO_SOURCES_ANSWER.contains("could not find"));
    }
}
