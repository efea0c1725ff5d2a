//! Market-data upstream client.
//!
//! The narrow contract the gateway consumes: point quotes, OHLCV history,
//! and symbol news, with errors classified into `not_found`,
//! `rate_limited`, `timeout`, and `upstream_unavailable`.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use sp_domain::error::{Error, Result};
use sp_domain::market::{Candle, NewsItem, Quote};

#[async_trait::async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;

    /// Ordered (oldest-first) candles for `period` at `interval`
    /// granularity, e.g. `("1mo", "1d")`.
    async fn history(&self, symbol: &str, period: &str, interval: &str) -> Result<Vec<Candle>>;

    async fn news(&self, symbol: &str, limit: usize) -> Result<Vec<NewsItem>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP client (Yahoo chart wire format)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpMarketData {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketData {
    pub fn new() -> Result<Self> {
        Self::with_base_url("https://query1.finance.yahoo.com")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("stockpilot/0.1")
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()
            .map_err(|e| Error::Internal(format!("market http client: {e}")))?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), client })
    }

    async fn get_json(&self, url: &str, symbol: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;

        match resp.status().as_u16() {
            200 => {}
            404 => return Err(Error::NotFound(format!("unknown symbol '{symbol}'"))),
            429 => return Err(Error::RateLimited { upstream: "market-data".into() }),
            _ => return Err(Error::UpstreamUnavailable { upstream: "market-data".into() }),
        }

        resp.json().await.map_err(classify_transport)
    }

    fn chart_result(body: &Value, symbol: &str) -> Result<Value> {
        if body.pointer("/chart/error").map_or(false, |e| !e.is_null()) {
            return Err(Error::NotFound(format!("unknown symbol '{symbol}'")));
        }
        body.pointer("/chart/result/0")
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no market data for '{symbol}'")))
    }

    fn parse_candles(result: &Value) -> Vec<Candle> {
        let timestamps: Vec<i64> = result
            .pointer("/timestamp")
            .and_then(|t| t.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        let quote = result.pointer("/indicators/quote/0");

        let series = |key: &str| -> Vec<Option<f64>> {
            quote
                .and_then(|q| q.get(key))
                .and_then(|v| v.as_array())
                .map(|a| a.iter().map(|v| v.as_f64()).collect())
                .unwrap_or_default()
        };
        let opens = series("open");
        let highs = series("high");
        let lows = series("low");
        let closes = series("close");
        let volumes: Vec<Option<u64>> = quote
            .and_then(|q| q.get("volume"))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().map(|v| v.as_u64()).collect())
            .unwrap_or_default();

        timestamps
            .iter()
            .enumerate()
            .filter_map(|(i, &ts)| {
                // Sparse rows (halts, partial sessions) are dropped whole.
                Some(Candle {
                    ts: Utc.timestamp_opt(ts, 0).single()?,
                    open: opens.get(i).copied().flatten()?,
                    high: highs.get(i).copied().flatten()?,
                    low: lows.get(i).copied().flatten()?,
                    close: closes.get(i).copied().flatten()?,
                    volume: volumes.get(i).copied().flatten().unwrap_or(0),
                })
            })
            .collect()
    }
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout("market-data call timed out".into())
    } else {
        Error::UpstreamUnavailable { upstream: "market-data".into() }
    }
}

#[async_trait::async_trait]
impl MarketData for HttpMarketData {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=1d&interval=1d",
            self.base_url, symbol
        );
        let body = self.get_json(&url, symbol).await?;
        let result = Self::chart_result(&body, symbol)?;

        let meta = result
            .get("meta")
            .ok_or_else(|| Error::UpstreamUnavailable { upstream: "market-data".into() })?;
        let price = meta
            .get("regularMarketPrice")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::NotFound(format!("no price for '{symbol}'")))?;
        let prev_close = meta
            .get("chartPreviousClose")
            .or_else(|| meta.get("previousClose"))
            .and_then(|v| v.as_f64())
            .unwrap_or(price);
        let ts = meta
            .get("regularMarketTime")
            .and_then(|v| v.as_i64())
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let change = price - prev_close;
        let change_percent = if prev_close.abs() > f64::EPSILON {
            change / prev_close * 100.0
        } else {
            0.0
        };

        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price,
            change,
            change_percent,
            ts,
        })
    }

    async fn history(&self, symbol: &str, period: &str, interval: &str) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/v8/finance/chart/{}?range={}&interval={}",
            self.base_url, symbol, period, interval
        );
        let body = self.get_json(&url, symbol).await?;
        let result = Self::chart_result(&body, symbol)?;
        let mut candles = Self::parse_candles(&result);
        candles.sort_by_key(|c| c.ts);
        Ok(candles)
    }

    async fn news(&self, symbol: &str, limit: usize) -> Result<Vec<NewsItem>> {
        let url = format!(
            "{}/v1/finance/search?q={}&newsCount={}&quotesCount=0",
            self.base_url, symbol, limit
        );
        let body = self.get_json(&url, symbol).await?;
        let Some(items) = body.get("news").and_then(|n| n.as_array()) else {
            return Ok(Vec::new());
        };

        Ok(items
            .iter()
            .take(limit)
            .filter_map(|item| {
                Some(NewsItem {
                    title: item.get("title")?.as_str()?.to_string(),
                    url: item.get("link")?.as_str()?.to_string(),
                    source: item
                        .get("publisher")
                        .and_then(|p| p.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    published_at: item
                        .get("providerPublishTime")
                        .and_then(|v| v.as_i64())
                        .and_then(|t| Utc.timestamp_opt(t, 0).single()),
                    summary: None,
                })
            })
            .collect())
    }
}

/// Timestamp helper shared with tests.
pub fn day_ts(days_ago: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days_ago)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_error_maps_to_not_found() {
        let body = serde_json::json!({
            "chart": { "result": null, "error": { "code": "Not Found" } }
        });
        let err = HttpMarketData::chart_result(&body, "NOPE").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn candles_skip_sparse_rows() {
        let result = serde_json::json!({
            "timestamp": [1700000000i64, 1700086400i64, 1700172800i64],
            "indicators": { "quote": [{
                "open":   [10.0, null, 12.0],
                "high":   [11.0, 11.5, 13.0],
                "low":    [9.5, 10.0, 11.5],
                "close":  [10.5, 11.0, 12.5],
                "volume": [1000, 1100, 1200]
            }]}
        });
        let candles = HttpMarketData::parse_candles(&result);
        assert_eq!(candles.len(), 2, "row with a null open is dropped");
        assert_eq!(candles[0].close, 10.5);
        assert_eq!(candles[1].close, 12.5);
    }

    #[test]
    fn candles_tolerate_missing_sections() {
        assert!(HttpMarketData::parse_candles(&serde_json::json!({})).is_empty());
    }
}
