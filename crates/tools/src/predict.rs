//! Price-forecast core.
//!
//! A per-symbol linear trend + momentum model over daily closes, persisted
//! as JSON under the model directory. The orchestrator sees none of this:
//! the tool handler calls [`Forecaster::forecast`] and maps
//! [`ForecastError`] kinds into tool error payloads.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sp_domain::config::PredictionConfig;
use sp_domain::error::Error;
use sp_domain::market::{Candle, Forecast, ForecastPoint};

use crate::market::MarketData;

/// Trading days of history requested when auto-training.
const TRAIN_RANGE: &str = "1y";
/// Closes used for the momentum term.
const MOMENTUM_WINDOW: usize = 5;
/// Weight of the fitted trend vs the momentum path in a prediction.
const TREND_WEIGHT: f64 = 0.7;

pub const MIN_HORIZON: u32 = 1;
pub const MAX_HORIZON: u32 = 30;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic forecast failure kinds, surfaced to the model as tool
/// error payloads.
#[derive(Debug)]
pub enum ForecastError {
    InsufficientHistory { needed: usize, got: usize },
    ModelUnavailable(String),
    UpstreamData(Error),
    InvalidHorizon(u32),
}

impl ForecastError {
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::InsufficientHistory { .. } => "insufficient_history",
            ForecastError::ModelUnavailable(_) => "model_unavailable",
            ForecastError::UpstreamData(_) => "upstream_data_error",
            ForecastError::InvalidHorizon(_) => "tool_arg_invalid",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ForecastError::InsufficientHistory { needed, got } => {
                format!("need at least {needed} daily closes to fit a model, got {got}")
            }
            ForecastError::ModelUnavailable(symbol) => {
                format!("no trained model for '{symbol}' and auto-train is disabled")
            }
            ForecastError::UpstreamData(e) => e.safe_message(),
            ForecastError::InvalidHorizon(h) => {
                format!("horizon must be {MIN_HORIZON}–{MAX_HORIZON} trading days, got {h}")
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model & store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceModel {
    pub symbol: String,
    /// Least-squares fit over (day index, close).
    pub intercept: f64,
    pub slope: f64,
    /// Mean close-to-close delta over the momentum window.
    pub momentum: f64,
    pub last_close: f64,
    pub samples: usize,
    pub trained_at: chrono::DateTime<Utc>,
}

impl PriceModel {
    /// Fit a model from ordered candles.
    pub fn fit(symbol: &str, candles: &[Candle], min_history: usize) -> Result<Self, ForecastError> {
        if candles.len() < min_history {
            return Err(ForecastError::InsufficientHistory {
                needed: min_history,
                got: candles.len(),
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let n = closes.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = closes.iter().sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (i, &y) in closes.iter().enumerate() {
            let dx = i as f64 - mean_x;
            sxx += dx * dx;
            sxy += dx * (y - mean_y);
        }
        let slope = if sxx.abs() < f64::EPSILON { 0.0 } else { sxy / sxx };
        let intercept = mean_y - slope * mean_x;

        let window = MOMENTUM_WINDOW.min(closes.len() - 1);
        let momentum = if window == 0 {
            0.0
        } else {
            closes
                .windows(2)
                .rev()
                .take(window)
                .map(|w| w[1] - w[0])
                .sum::<f64>()
                / window as f64
        };

        Ok(Self {
            symbol: symbol.to_uppercase(),
            intercept,
            slope,
            momentum,
            last_close: *closes.last().expect("non-empty by min_history"),
            samples: closes.len(),
            trained_at: Utc::now(),
        })
    }

    /// Project `horizon` trading days ahead.
    pub fn project(&self, horizon: u32) -> Vec<ForecastPoint> {
        let n = self.samples as f64;
        (1..=horizon)
            .map(|day| {
                let trend = self.intercept + self.slope * (n - 1.0 + day as f64);
                let momentum_path = self.last_close + self.momentum * day as f64;
                let price = TREND_WEIGHT * trend + (1.0 - TREND_WEIGHT) * momentum_path;
                ForecastPoint { day, price: (price.max(0.0) * 100.0).round() / 100.0 }
            })
            .collect()
    }
}

/// On-disk store: one JSON file per symbol under the model directory.
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol.to_uppercase()))
    }

    pub fn load(&self, symbol: &str) -> Option<PriceModel> {
        let raw = std::fs::read_to_string(self.path_for(symbol)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(model) => Some(model),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "corrupt model file ignored");
                None
            }
        }
    }

    pub fn save(&self, model: &PriceModel) -> sp_domain::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(model)?;
        std::fs::write(self.path_for(&model.symbol), json)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Forecaster
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Forecaster {
    store: ModelStore,
    cfg: PredictionConfig,
}

impl Forecaster {
    pub fn new(cfg: PredictionConfig) -> Self {
        Self { store: ModelStore::new(cfg.model_dir.clone()), cfg }
    }

    /// Forecast `horizon` trading days for `symbol`, training on first use
    /// when configured to.
    pub async fn forecast(
        &self,
        market: &dyn MarketData,
        symbol: &str,
        horizon: u32,
    ) -> Result<Forecast, ForecastError> {
        if !(MIN_HORIZON..=MAX_HORIZON).contains(&horizon) {
            return Err(ForecastError::InvalidHorizon(horizon));
        }

        let model = match self.store.load(symbol) {
            Some(m) => m,
            None if self.cfg.auto_train => {
                let candles = market
                    .history(symbol, TRAIN_RANGE, "1d")
                    .await
                    .map_err(ForecastError::UpstreamData)?;
                let model = PriceModel::fit(symbol, &candles, self.cfg.min_history)?;
                if let Err(e) = self.store.save(&model) {
                    tracing::warn!(symbol, error = %e, "model persist failed; forecasting anyway");
                }
                model
            }
            None => return Err(ForecastError::ModelUnavailable(symbol.to_string())),
        };

        Ok(Forecast {
            symbol: model.symbol.clone(),
            horizon_days: horizon,
            points: model.project(horizon),
            trained_at: model.trained_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::day_ts;
    use sp_domain::error::Result as SpResult;
    use sp_domain::market::{NewsItem, Quote};

    fn rising_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle {
                    ts: day_ts((n - i) as i64),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000,
                }
            })
            .collect()
    }

    struct FixedMarket {
        candles: Vec<Candle>,
    }

    #[async_trait::async_trait]
    impl MarketData for FixedMarket {
        async fn quote(&self, _symbol: &str) -> SpResult<Quote> {
            unreachable!("forecaster only uses history")
        }
        async fn history(&self, _s: &str, _p: &str, _i: &str) -> SpResult<Vec<Candle>> {
            Ok(self.candles.clone())
        }
        async fn news(&self, _s: &str, _l: usize) -> SpResult<Vec<NewsItem>> {
            Ok(Vec::new())
        }
    }

    fn forecaster(dir: &std::path::Path, auto_train: bool) -> Forecaster {
        Forecaster::new(PredictionConfig {
            model_dir: dir.to_path_buf(),
            auto_train,
            min_history: 30,
        })
    }

    #[test]
    fn fit_captures_a_rising_trend() {
        let model = PriceModel::fit("AAPL", &rising_candles(60), 30).unwrap();
        assert!(model.slope > 0.9 && model.slope < 1.1);
        assert!(model.momentum > 0.0);
        assert_eq!(model.samples, 60);

        let points = model.project(5);
        assert_eq!(points.len(), 5);
        assert!(points[4].price > points[0].price);
        assert!(points[0].price > model.last_close - 1.0);
    }

    #[test]
    fn fit_requires_minimum_history() {
        let err = PriceModel::fit("AAPL", &rising_candles(10), 30).unwrap_err();
        assert_eq!(err.kind(), "insufficient_history");
        assert!(err.message().contains("30"));
    }

    #[tokio::test]
    async fn auto_train_fits_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let f = forecaster(dir.path(), true);
        let market = FixedMarket { candles: rising_candles(90) };

        let forecast = f.forecast(&market, "aapl", 10).await.unwrap();
        assert_eq!(forecast.symbol, "AAPL");
        assert_eq!(forecast.points.len(), 10);

        // Second call must hit the stored model, not retrain.
        let empty_market = FixedMarket { candles: Vec::new() };
        let again = f.forecast(&empty_market, "AAPL", 5).await.unwrap();
        assert_eq!(again.points.len(), 5);
    }

    #[tokio::test]
    async fn no_model_without_auto_train() {
        let dir = tempfile::tempdir().unwrap();
        let f = forecaster(dir.path(), false);
        let market = FixedMarket { candles: rising_candles(90) };
        let err = f.forecast(&market, "TSLA", 5).await.unwrap_err();
        assert_eq!(err.kind(), "model_unavailable");
    }

    #[tokio::test]
    async fn horizon_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let f = forecaster(dir.path(), true);
        let market = FixedMarket { candles: rising_candles(90) };
        assert_eq!(f.forecast(&market, "AAPL", 0).await.unwrap_err().kind(), "tool_arg_invalid");
        assert_eq!(f.forecast(&market, "AAPL", 31).await.unwrap_err().kind(), "tool_arg_invalid");
    }

    #[tokio::test]
    async fn upstream_failure_is_classified() {
        struct DownMarket;
        #[async_trait::async_trait]
        impl MarketData for DownMarket {
            async fn quote(&self, _s: &str) -> SpResult<Quote> {
                Err(Error::UpstreamUnavailable { upstream: "market-data".into() })
            }
            async fn history(&self, _s: &str, _p: &str, _i: &str) -> SpResult<Vec<Candle>> {
                Err(Error::UpstreamUnavailable { upstream: "market-data".into() })
            }
            async fn news(&self, _s: &str, _l: usize) -> SpResult<Vec<NewsItem>> {
                Ok(Vec::new())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let f = forecaster(dir.path(), true);
        let err = f.forecast(&DownMarket, "AAPL", 5).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_data_error");
    }
}
