//! Shared domain types for the StockPilot gateway.
//!
//! Everything the member crates exchange lives here: the error taxonomy,
//! conversation messages and tool-call shapes, provider-agnostic stream
//! events, search/citation types, market-data types, the strict JSON-schema
//! argument validator, and the configuration tree.

pub mod config;
pub mod error;
pub mod market;
pub mod message;
pub mod schema;
pub mod search;
pub mod stream;

pub use error::{Error, Result};
