//! OpenAI-compatible adapter.
//!
//! Speaks the chat-completions wire format used by OpenAI, Azure OpenAI,
//! vLLM, and the local inference servers; the only provider surface this
//! gateway needs. Deadlines are applied per request; the caller owns
//! breaker accounting.

use std::time::{Duration, Instant};

use serde_json::Value;

use sp_domain::config::LlmConfig;
use sp_domain::error::{Error, Result};
use sp_domain::message::{Message, Role, ToolCallRequest, ToolDefinition};
use sp_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, ChatResponse, Embedder, LlmClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    embedding_model: String,
    hard_cap: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Build from the `[llm]` config section. The API key env var is read
    /// once here; an empty key is allowed (local servers).
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!(env = %cfg.api_key_env, "LLM API key env var unset or empty");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(transport_error)?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            embedding_model: cfg.embedding_model.clone(),
            hard_cap: Duration::from_secs(cfg.request_timeout_s),
            client,
        })
    }

    fn post(&self, url: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        builder
    }

    /// Remaining time until the request deadline, bounded by the hard cap.
    fn timeout_for(&self, deadline: Option<Instant>) -> Result<Duration> {
        match deadline {
            None => Ok(self.hard_cap),
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout("model call deadline already expired".into()));
                }
                Ok(remaining.min(self.hard_cap))
            }
        }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("model call: {e}"))
    } else {
        Error::ModelError(e.to_string())
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    if status.as_u16() == 429 {
        return Error::RateLimited { upstream: "llm".into() };
    }
    Error::ModelError(format!("HTTP {}: {}", status.as_u16(), truncate(body, 300)))
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.content_or_empty(),
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": msg.content(),
                "tool_calls": calls,
            })
        }
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content_or_empty(),
        }),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
    let Some(arr) = message.get("tool_calls").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let args_raw = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
            let arguments =
                serde_json::from_str(args_raw).unwrap_or(Value::Object(Default::default()));
            Some(ToolCallRequest { id, name, arguments })
        })
        .collect()
}

fn parse_completion(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::ModelError("completion has no choices".into()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::ModelError("choice has no message".into()))?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        tool_calls: parse_tool_calls(message),
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

/// Build the stateful payload parser for one streamed call.
///
/// Later argument fragments identify their call only by `index`, so the
/// parser keeps an index → call-id map for the lifetime of the stream and
/// always emits deltas keyed by the real call id.
fn make_stream_parser() -> impl FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static {
    let mut call_ids: std::collections::HashMap<u64, String> = std::collections::HashMap::new();

    move |data: &str| {
        if data.trim() == "[DONE]" {
            return vec![Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) })];
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::ModelError(format!("bad stream chunk: {e}")))],
        };

        let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

        // Usage-only chunk emitted after the last choice.
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                return vec![Ok(StreamEvent::Done { usage: Some(usage), finish_reason: None })];
            }
            return Vec::new();
        };

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            let usage = v.get("usage").and_then(parse_usage);
            return vec![Ok(StreamEvent::Done { usage, finish_reason: Some(fr.to_string()) })];
        }

        let delta = choice.get("delta").unwrap_or(&Value::Null);
        let mut events = Vec::new();

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    let name = tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    call_ids.insert(index, id.to_string());
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        tool_name: name.to_string(),
                    }));
                }
                if let Some(args) = tc
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                {
                    if !args.is_empty() {
                        let call_id = call_ids
                            .get(&index)
                            .cloned()
                            .unwrap_or_else(|| index.to_string());
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id,
                            delta: args.to_string(),
                        }));
                    }
                }
            }
            return events;
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
            }
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let timeout = self.timeout_for(req.deadline)?;
        let body = self.build_body(req, false);

        tracing::debug!(model = %req.model, tools = req.tools.len(), "completion request");

        let resp = self
            .post(&url, timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| Error::ModelError(format!("bad completion body: {e}")))?;
        parse_completion(&json)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let timeout = self.timeout_for(req.deadline)?;
        let body = self.build_body(req, true);

        tracing::debug!(model = %req.model, tools = req.tools.len(), "stream request");

        let resp = self
            .post(&url, timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(transport_error)?;
            return Err(status_error(status, &text));
        }

        Ok(crate::sse::event_stream(resp, make_stream_parser(), transport_error))
    }

    fn client_id(&self) -> &str {
        "openai-compat"
    }
}

#[async_trait::async_trait]
impl Embedder for OpenAiCompatClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let resp = self
            .post(&url, self.hard_cap)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text)?;
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::ModelError("embeddings response missing 'data'".into()))?;

        Ok(data
            .iter()
            .filter_map(|item| {
                let arr = item.get("embedding")?.as_array()?;
                Some(arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let msg = Message::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "get_stock_quote".into(),
                arguments: serde_json::json!({"symbol": "AAPL"}),
            }],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "assistant");
        let args = wire["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert!(args.contains("AAPL"));
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = Message::tool_result("call_9", "{\"price\":1.0}", false);
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }

    #[test]
    fn completion_parse_extracts_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4.1",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "get_stock_quote", "arguments": "{\"symbol\":\"TSLA\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20 }
        });
        let resp = parse_completion(&body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "get_stock_quote");
        assert_eq!(resp.tool_calls[0].arguments["symbol"], "TSLA");
        assert_eq!(resp.usage.unwrap().total_tokens, 20);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn stream_parser_token_delta() {
        let mut parse = make_stream_parser();
        let events = parse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Token { ref text }) if text == "Hel"));
    }

    #[test]
    fn stream_parser_maps_index_to_call_id() {
        let mut parse = make_stream_parser();
        let open = parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_stock_quote","arguments":""}}]}}]}"#,
        );
        assert!(matches!(open[0], Ok(StreamEvent::ToolCallStarted { ref call_id, .. }) if call_id == "call_1"));

        // Later fragments carry only the index; the parser restores the id.
        let delta = parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"sym"}}]}}]}"#,
        );
        match &delta[0] {
            Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                assert_eq!(call_id, "call_1");
                assert_eq!(delta, "{\"sym");
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn stream_parser_done_sentinel() {
        let mut parse = make_stream_parser();
        let events = parse("[DONE]");
        assert!(matches!(events[0], Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn stream_parser_usage_only_chunk() {
        let mut parse = make_stream_parser();
        let events = parse(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        );
        match &events[0] {
            Ok(StreamEvent::Done { usage: Some(u), .. }) => assert_eq!(u.total_tokens, 7),
            other => panic!("expected usage Done, got {other:?}"),
        }
    }
}
