//! Bounded page fetch and readable-text extraction for comprehensive mode.
//!
//! Limits: response size cap, redirect cap, per-fetch timeout, http(s)
//! schemes only. Extraction is a tag stripper, not a DOM parser — good
//! enough for reranking and synthesis context.

use std::time::Duration;

use sp_domain::error::{Error, Result};

use crate::backend::USER_AGENT;

/// Hard cap on bytes read from any single page.
pub const MAX_PAGE_BYTES: usize = 512 * 1024;
/// Cap on extracted text handed to ranking/synthesis.
pub const MAX_TEXT_CHARS: usize = 6_000;

pub fn fetch_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| Error::Internal(format!("fetch client: {e}")))
}

/// Fetch a page and return its readable text, bounded in size and time.
pub async fn page_text(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::InvalidRequest(format!("unsupported scheme in '{url}'")));
    }

    let resp = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| crate::backend::classify_transport("web-fetch", e))?;

    if !resp.status().is_success() {
        return Err(Error::UpstreamUnavailable { upstream: "web-fetch".into() });
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("text/") && !content_type.contains("html") {
        return Err(Error::InvalidRequest(format!(
            "not a text resource: {content_type}"
        )));
    }

    let mut body = Vec::new();
    let mut resp = resp;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| crate::backend::classify_transport("web-fetch", e))?
    {
        body.extend_from_slice(&chunk);
        if body.len() >= MAX_PAGE_BYTES {
            break;
        }
    }

    let html = String::from_utf8_lossy(&body);
    let mut text = strip_tags(&html);
    if text.chars().count() > MAX_TEXT_CHARS {
        text = text.chars().take(MAX_TEXT_CHARS).collect();
    }
    Ok(text)
}

/// Strip markup: drops `<script>`/`<style>` blocks wholesale, removes tags,
/// decodes the common entities, and collapses whitespace.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    'outer: while !rest.is_empty() {
        match rest.find('<') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(lt) => {
                out.push_str(&rest[..lt]);
                rest = &rest[lt..];

                // Skip script/style including their contents.
                for block in ["script", "style"] {
                    let lower = rest.to_lowercase();
                    if lower.starts_with(&format!("<{block}")) {
                        let close = format!("</{block}");
                        match lower.find(&close) {
                            Some(end) => {
                                let after = rest[end..].find('>').map(|g| end + g + 1);
                                rest = after.map_or("", |a| &rest[a..]);
                                continue 'outer;
                            }
                            None => break 'outer,
                        }
                    }
                }

                match rest.find('>') {
                    Some(gt) => {
                        // Tags that imply a break keep words separated.
                        out.push(' ');
                        rest = &rest[gt + 1..];
                    }
                    None => break,
                }
            }
        }
    }

    let decoded = out
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_removed_and_whitespace_collapsed() {
        let html = "<p>Tesla   <b>shares</b> rose</p>\n<div>5%</div>";
        assert_eq!(strip_tags(html), "Tesla shares rose 5%");
    }

    #[test]
    fn script_and_style_blocks_vanish() {
        let html = "<script>var x = 'hidden';</script><p>visible</p><style>.a{}</style>";
        assert_eq!(strip_tags(html), "visible");
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(strip_tags("Q&amp;A &lt;2024&gt;"), "Q&A <2024>");
    }

    #[test]
    fn unclosed_tag_does_not_panic() {
        assert_eq!(strip_tags("text <a href="), "text");
    }
}
