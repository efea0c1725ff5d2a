//! Search provider backends.
//!
//! Each backend turns one upstream SERP API into raw [`SearchResult`]s with
//! only title/url/snippet/provider/raw-score populated. Backends are dumb
//! transports: breakers, limiters, and timeouts live in the engine.

use std::time::Duration;

use serde_json::Value;

use sp_domain::error::{Error, Result};
use sp_domain::search::SearchResult;

/// The user agent sent on every outbound search or fetch request.
pub(crate) const USER_AGENT: &str = "stockpilot/0.1 (+https://github.com/stockpilot)";

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// Upstream name, also used for breaker and limiter routing.
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, count: usize, timeout: Duration)
        -> Result<Vec<SearchResult>>;
}

/// Position-derived relevance: rank 0 → 1.0, decaying linearly.
fn position_score(index: usize, total: usize) -> f64 {
    1.0 - index as f64 / total.max(1) as f64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Brave (primary)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BraveBackend {
    api_key: String,
    client: reqwest::Client,
}

impl BraveBackend {
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_millis(800))
            .build()
            .map_err(|e| Error::Internal(format!("brave http client: {e}")))?;
        Ok(Self { api_key, client })
    }

    fn parse(body: &Value, count: usize) -> Vec<SearchResult> {
        let Some(results) = body
            .pointer("/web/results")
            .and_then(|r| r.as_array())
        else {
            return Vec::new();
        };
        let total = results.len().min(count);
        results
            .iter()
            .take(count)
            .enumerate()
            .filter_map(|(i, r)| {
                let title = r.get("title")?.as_str()?;
                let url = r.get("url")?.as_str()?;
                let snippet = r.get("description").and_then(|d| d.as_str()).unwrap_or("");
                Some(SearchResult::new(
                    title,
                    url,
                    snippet,
                    "brave",
                    position_score(i, total),
                ))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SearchBackend for BraveBackend {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(
        &self,
        query: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>> {
        let resp = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport("brave", e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited { upstream: "brave".into() });
        }
        if !status.is_success() {
            return Err(Error::UpstreamUnavailable { upstream: "brave".into() });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| classify_transport("brave", e))?;
        Ok(Self::parse(&body, count))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DuckDuckGo-style fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keyless fallback that scrapes the HTML SERP. Deliberately tolerant:
/// markup drift yields fewer results, never an error.
pub struct DuckBackend {
    client: reqwest::Client,
    link_re: regex::Regex,
    snippet_re: regex::Regex,
}

impl DuckBackend {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_millis(800))
            .build()
            .map_err(|e| Error::Internal(format!("ddgs http client: {e}")))?;
        let link_re = regex::Regex::new(
            r#"(?s)<a[^>]+class="result__a"[^>]+href="(?P<url>[^"]+)"[^>]*>(?P<title>.*?)</a>"#,
        )
        .map_err(|e| Error::Internal(format!("ddgs link regex: {e}")))?;
        let snippet_re = regex::Regex::new(
            r#"(?s)<a[^>]+class="result__snippet"[^>]*>(?P<text>.*?)</a>"#,
        )
        .map_err(|e| Error::Internal(format!("ddgs snippet regex: {e}")))?;
        Ok(Self { client, link_re, snippet_re })
    }

    fn parse(&self, html: &str, count: usize) -> Vec<SearchResult> {
        let snippets: Vec<String> = self
            .snippet_re
            .captures_iter(html)
            .map(|c| crate::extract::strip_tags(&c["text"]))
            .collect();

        let links: Vec<(String, String)> = self
            .link_re
            .captures_iter(html)
            .take(count)
            .map(|c| (decode_ddg_url(&c["url"]), crate::extract::strip_tags(&c["title"])))
            .collect();

        let total = links.len();
        links
            .into_iter()
            .enumerate()
            .map(|(i, (url, title))| {
                let snippet = snippets.get(i).cloned().unwrap_or_default();
                SearchResult::new(title, url, snippet, "ddgs", position_score(i, total))
            })
            .collect()
    }
}

/// DDG wraps destination URLs in a `/l/?uddg=<encoded>` redirect.
fn decode_ddg_url(raw: &str) -> String {
    if let Some(idx) = raw.find("uddg=") {
        let enc = &raw[idx + 5..];
        let enc = enc.split('&').next().unwrap_or(enc);
        return percent_decode(enc);
    }
    raw.to_string()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait::async_trait]
impl SearchBackend for DuckBackend {
    fn name(&self) -> &'static str {
        "ddgs"
    }

    async fn search(
        &self,
        query: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>> {
        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport("ddgs", e))?;

        if !resp.status().is_success() {
            return Err(Error::UpstreamUnavailable { upstream: "ddgs".into() });
        }

        let html = resp.text().await.map_err(|e| classify_transport("ddgs", e))?;
        Ok(self.parse(&html, count))
    }
}

pub(crate) fn classify_transport(upstream: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{upstream} search timed out"))
    } else {
        Error::UpstreamUnavailable { upstream: upstream.to_string() }
    }
}
