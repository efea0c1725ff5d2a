//! Chat endpoints.
//!
//! - `POST /chat`        — non-streaming: drains the turn and returns JSON
//! - `POST /chat/stream` — SSE: one `data: <json>` record per turn event
//! - `POST /chat/clear`  — drop a conversation
//!
//! The SSE bridge reads from the turn's bounded channel; a slow client
//! backs the channel up, which pauses model-stream consumption instead of
//! dropping events.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;

use sp_domain::stream::Usage;

use crate::runtime::{run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub prompt: String,
    /// Model alias override (e.g. "analyst").
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClearBody {
    pub conversation_id: String,
}

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "invalid_request" | "tool_arg_invalid" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "upstream_unavailable" | "model_error" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_json(kind: &str, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": { "kind": kind, "message": message } }))
}

fn validate(body: &ChatBody) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if body.prompt.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_json("invalid_request", "prompt must not be empty"),
        ));
    }
    Ok(())
}

fn turn_input(body: ChatBody) -> TurnInput {
    TurnInput {
        conversation_id: body.conversation_id,
        prompt: body.prompt,
        deployment: body.deployment,
        system_prompt: body.system_prompt,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> impl IntoResponse {
    if let Err(resp) = validate(&body) {
        return resp.into_response();
    }

    let mut handle = run_turn(state, turn_input(body));

    let mut answer = String::new();
    let mut model = String::new();
    let mut usage = Usage::default();
    let mut cached = false;
    let mut error: Option<(String, String)> = None;

    while let Some(event) = handle.events.recv().await {
        match event {
            TurnEvent::Content { delta } => answer.push_str(&delta),
            TurnEvent::Done { model: m, usage: u, cached: c } => {
                model = m;
                usage = u;
                cached = c;
            }
            TurnEvent::Error { kind, message } => error = Some((kind, message)),
            TurnEvent::Start { .. } | TurnEvent::ToolCall { .. } | TurnEvent::ToolsCalled { .. } => {}
        }
    }

    if let Some((kind, message)) = error {
        return (status_for(&kind), error_json(&kind, &message)).into_response();
    }

    Json(serde_json::json!({
        "answer": answer,
        "conversation_id": handle.conversation_id,
        "model": model,
        "usage": usage,
        "cached": cached,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    if let Err((_, json)) = validate(&body) {
        // SSE responses cannot carry an HTTP error after headers; emit a
        // single error event instead.
        let stream = futures_util::stream::once(async move {
            Ok::<_, std::convert::Infallible>(Event::default().data(json.0.to_string()))
        });
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    let handle = run_turn(state, turn_input(body));
    Sse::new(event_stream(handle.events))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Frame each turn event as one `data: <json>\n\n` record. The `type`
/// discriminator lives inside the JSON payload.
fn event_stream(
    mut rx: tokio::sync::mpsc::Receiver<TurnEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => {
                    tracing::warn!(error = %e, "unserializable turn event dropped");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat/clear
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_clear(
    State(state): State<AppState>,
    Json(body): Json<ClearBody>,
) -> impl IntoResponse {
    if state.conversations.clear(&body.conversation_id) {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_json(
                "not_found",
                &format!("no conversation '{}'", body.conversation_id),
            ),
        )
            .into_response()
    }
}
