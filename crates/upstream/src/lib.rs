//! Failure isolation for flaky upstreams: per-upstream circuit breakers
//! and token-bucket rate limiters. Process-wide singletons, built once at
//! startup and shared by every external-call site.

pub mod breaker;
pub mod limiter;

pub use breaker::{BreakerMap, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use limiter::{LimiterMap, TokenBucket};
