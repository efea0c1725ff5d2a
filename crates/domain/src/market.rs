//! Market-data collaborator shapes: quotes, candles, news, forecasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time quote for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    /// Absolute change since previous close.
    pub change: f64,
    pub change_percent: f64,
    pub ts: DateTime<Utc>,
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// A headline attached to a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub url: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Output of the prediction core: one projected close per trading day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub symbol: String,
    pub horizon_days: u32,
    pub points: Vec<ForecastPoint>,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Trading days ahead, 1-based.
    pub day: u32,
    pub price: f64,
}
