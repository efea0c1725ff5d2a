//! Upstream data services behind the gateway's tools: the market-data
//! client, knowledge-base retrieval, and the price-forecast core.

pub mod market;
pub mod predict;
pub mod rag;

pub use market::{HttpMarketData, MarketData};
pub use predict::{ForecastError, Forecaster};
pub use rag::{InMemoryIndex, RagSearcher, VectorIndex};
