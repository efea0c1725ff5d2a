//! Provider-agnostic LLM streaming events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while a completion streams.
///
/// Tool-call arguments arrive as deltas keyed by call id and are assembled
/// by the consumer; `Finished` is emitted by providers that send complete
/// calls in one chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text token chunk.
    Token { text: String },

    /// A tool call opened; arguments follow as deltas.
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool-call argument JSON.
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call arrived fully assembled.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// The stream finished.
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// The provider reported an error mid-stream.
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Fold another round's usage into a turn total.
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
