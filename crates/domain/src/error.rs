//! Workspace-wide error type.
//!
//! Every error carries a stable `kind` string that survives serialization to
//! clients and tool-result messages. Transport-level failures (`Io`, `Json`)
//! collapse into the `internal` kind: their details are for logs, never for
//! the wire.

/// Shared error type used across all StockPilot crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed payload or unknown model alias. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing conversation, unknown symbol, or absent document.
    #[error("not found: {0}")]
    NotFound(String),

    /// An upstream rate limiter refused the call.
    #[error("rate limited by {upstream}")]
    RateLimited { upstream: String },

    /// Circuit breaker open or repeated upstream failures.
    #[error("upstream {upstream} unavailable")]
    UpstreamUnavailable { upstream: String },

    /// A per-call deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Tool arguments failed schema validation.
    #[error("invalid tool arguments: {0}")]
    ToolArgInvalid(String),

    /// The LLM call failed (connect error, mid-stream abort, bad payload).
    #[error("model error: {0}")]
    ModelError(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind string for wire payloads and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::NotFound(_) => "not_found",
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::Timeout(_) => "timeout",
            Error::ToolArgInvalid(_) => "tool_arg_invalid",
            Error::ModelError(_) => "model_error",
            Error::Internal(_) | Error::Io(_) | Error::Json(_) => "internal",
        }
    }

    /// Human-readable message that is safe to return to a client or feed
    /// back to the model. Internal variants are collapsed to a generic
    /// message; the full error stays in the logs.
    pub fn safe_message(&self) -> String {
        match self {
            Error::Internal(_) | Error::Io(_) | Error::Json(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether a single jittered retry inside the tool dispatcher is
    /// worthwhile. Only limiter trips qualify; breaker-open and timeouts
    /// are returned to the model as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}
