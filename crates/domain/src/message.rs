//! Conversation messages and tool-call shapes.
//!
//! A `Message` is one entry in a conversation transcript. Assistant messages
//! may carry [`ToolCallRequest`]s; tool messages answer exactly one of them
//! via `tool_call_id`. Token counts are memoized per message and reset when
//! the content is replaced.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::market::{Candle, Forecast, NewsItem, Quote};
use crate::search::{RagHit, SearchResponse};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles & tool calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation emitted by the model. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The schema triple the model sees for one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One transcript entry.
///
/// `content` is private so the memoized token count cannot go stale:
/// all mutation goes through [`Message::set_content`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    content: Option<String>,
    /// Tool calls emitted alongside assistant content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on tool-role messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Whether a tool-role message carries an error payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(skip)]
    tokens: OnceLock<usize>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Some(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Some(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(text.into()))
    }

    /// Assistant message carrying tool-call requests (content may be empty).
    pub fn assistant_tool_calls(text: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let text = text.into();
        let content = if text.is_empty() { None } else { Some(text) };
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool-role message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            is_error,
            ..Self::new(Role::Tool, Some(content.into()))
        }
    }

    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            tokens: OnceLock::new(),
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Replace the content, invalidating the memoized token count.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
        self.tokens = OnceLock::new();
    }

    /// Estimated token count, memoized on first use.
    ///
    /// Covers the content, serialized tool-call arguments, and a small
    /// per-message framing overhead.
    pub fn token_count(&self) -> usize {
        *self.tokens.get_or_init(|| {
            let mut chars = self.content.as_deref().map_or(0, |c| c.chars().count());
            for tc in &self.tool_calls {
                chars += tc.name.len() + tc.arguments.to_string().chars().count();
            }
            estimate_tokens_from_chars(chars) + 4
        })
    }
}

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    estimate_tokens_from_chars(text.chars().count())
}

fn estimate_tokens_from_chars(chars: usize) -> usize {
    chars.div_ceil(4)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed set of payload shapes a tool can produce: one variant per
/// tool plus a shared error variant. Serialized to JSON before being fed
/// back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolPayload {
    Quote(Quote),
    History { symbol: String, candles: Vec<Candle> },
    News { symbol: String, items: Vec<NewsItem> },
    RagSearch { query: String, hits: Vec<RagHit> },
    WebSearch(SearchResponse),
    Forecast(Forecast),
    Error { kind: String, message: String },
}

impl ToolPayload {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ToolPayload::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolPayload::Error { .. })
    }
}

/// A completed tool dispatch, paired with the call it answers.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub tool_name: String,
    pub payload: ToolPayload,
}

impl ToolOutput {
    /// Render the payload as the JSON string the model will see, capped at
    /// `max_bytes`. Oversize payloads are cut at a char boundary and marked
    /// so the model knows it is looking at a prefix.
    pub fn render_for_model(&self, max_bytes: usize) -> String {
        let full = serde_json::to_string(&self.payload)
            .unwrap_or_else(|_| r#"{"tool":"error","kind":"internal","message":"unserializable payload"}"#.into());
        if full.len() <= max_bytes {
            return full;
        }
        let mut cut = max_bytes;
        while cut > 0 && !full.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{} …[truncated {} bytes]", &full[..cut], full.len() - cut)
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_error()
    }
}
