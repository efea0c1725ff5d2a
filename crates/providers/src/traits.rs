//! The model-client contract.

use std::time::Instant;

use sp_domain::error::Result;
use sp_domain::message::{Message, ToolCallRequest, ToolDefinition};
use sp_domain::stream::{BoxStream, StreamEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One completion request against a concrete deployment.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke. Empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
    /// Concrete deployment name (already resolved from an alias).
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Absolute deadline for the whole call. `None` falls back to the
    /// client's configured hard cap.
    pub deadline: Option<Instant>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            deadline: None,
        }
    }
}

/// A fully aggregated (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The provider-agnostic model client.
///
/// `complete` blocks until the full assistant message is available;
/// `stream` returns a lazy, cancellable event sequence — dropping the
/// stream releases the underlying connection.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse>;

    async fn stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Identifier for logging and breaker naming.
    fn client_id(&self) -> &str;
}

/// Batch text embedding with a deterministic dimension.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
