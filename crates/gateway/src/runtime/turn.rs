//! Turn execution — the tool-calling loop at the heart of the gateway.
//!
//! Per user turn: fingerprint → response-cache lookup → in-flight dedup →
//! model/tool selection → bounded tool-call rounds → forced tools-disabled
//! completion at the bound → cache write + fan-out. Events stream through a
//! bounded channel; a full channel pauses upstream consumption, a closed
//! one marks the turn cancelled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use sp_domain::error::{Error, Result};
use sp_domain::message::{Message, ToolCallRequest};
use sp_domain::stream::{StreamEvent, Usage};
use sp_providers::{ChatRequest, ResolvedModel};
use sp_sessions::TurnLogRecord;

use crate::runtime::cache::{self, CachedAnswer};
use crate::runtime::inflight::{Join, TurnOutcome};
use crate::runtime::metrics::{bump, STAGE_TURN};
use crate::runtime::selector::Selection;
use crate::runtime::tools::{self, RAG_TOOL};
use crate::state::AppState;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a stock-analysis assistant. Use the available tools for market \
     data, news, web search, knowledge-base lookups, and forecasts; answer \
     from tool results rather than memory when they are available, and cite \
     web sources with their [n] markers.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — the wire event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

/// Events framed to the client. `start` precedes everything; exactly one
/// `done` or `error` terminates the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Start {
        conversation_id: String,
        model: String,
        cached: bool,
    },
    Content {
        delta: String,
    },
    ToolCall {
        name: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Round summary emitted when the model requests tools.
    ToolsCalled {
        round: usize,
        tools: Vec<String>,
    },
    Error {
        kind: String,
        message: String,
    },
    Done {
        model: String,
        usage: Usage,
        cached: bool,
    },
}

/// Input to a single turn.
pub struct TurnInput {
    pub conversation_id: Option<String>,
    pub prompt: String,
    /// Model alias override; `None` uses the default (or the cheap alias
    /// on the simple-query fast path).
    pub deployment: Option<String>,
    pub system_prompt: Option<String>,
}

pub struct TurnHandle {
    pub conversation_id: String,
    pub events: mpsc::Receiver<TurnEvent>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event sink — cancellation-aware sender
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps the event channel. A failed send means the client is gone; the
/// sink flips to cancelled and later sends become no-ops, while the turn
/// decides whether to finish for subscribers or abandon.
struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
    cancelled: AtomicBool,
}

impl EventSink {
    fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx, cancelled: AtomicBool::new(false) }
    }

    async fn send(&self, event: TurnEvent) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.cancelled.store(true, Ordering::Release);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn on its own task. The caller reads [`TurnEvent`]s from the
/// returned handle; dropping the receiver cancels the turn (subject to the
/// in-flight ownership-transfer rule).
pub fn run_turn(state: AppState, input: TurnInput) -> TurnHandle {
    let conversation_id = input
        .conversation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);

    let turn_id = Uuid::new_v4();
    let cid = conversation_id.clone();
    let span = tracing::info_span!("turn", %turn_id, conversation_id = %cid);

    tokio::spawn(
        async move {
            bump(&state.metrics.turns_started);
            let started = Instant::now();
            let sink = EventSink::new(tx);

            match run_turn_inner(&state, &input, &cid, turn_id, &sink).await {
                Ok(()) => {
                    state
                        .metrics
                        .record_latency(STAGE_TURN, started.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    tracing::warn!(kind = e.kind(), error = %e, "turn failed");
                    bump(&state.metrics.turns_failed);
                    sink.send(TurnEvent::Error {
                        kind: e.kind().to_string(),
                        message: e.safe_message(),
                    })
                    .await;
                }
            }
        }
        .instrument(span),
    );

    TurnHandle { conversation_id, events: rx }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn body
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: &AppState,
    input: &TurnInput,
    cid: &str,
    turn_id: Uuid,
    sink: &EventSink,
) -> Result<()> {
    let deadline =
        Instant::now() + Duration::from_secs(state.config.orchestrator.turn_deadline_s);

    let window = state.conversations.window(cid);
    let selection = state.selector.select(&input.prompt, &state.tools).await;

    // The cheap alias is substituted only when the client left the model
    // unset; an explicit choice is always honored.
    let resolved = match (&input.deployment, selection.simple) {
        (Some(alias), _) => state.models.resolve(Some(alias))?,
        (None, true) => state.models.resolve_simple(),
        (None, false) => state.models.resolve(None)?,
    };

    let system_prompt = input
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let fp = cache::fingerprint(&input.prompt, &resolved.alias, &system_prompt, &window);

    // ── Response cache ───────────────────────────────────────────────
    if let Some(hit) = state.caches.lookup(&fp) {
        bump(&state.metrics.response_cache_hits);
        tracing::debug!("response cache hit");
        replay_answer(state, sink, cid, &input.prompt, &hit).await;
        bump(&state.metrics.turns_completed);
        return Ok(());
    }
    bump(&state.metrics.response_cache_misses);

    // ── In-flight dedup ──────────────────────────────────────────────
    match state.inflight.join(&fp) {
        Join::Subscriber(mut outcome_rx) => {
            bump(&state.metrics.inflight_subscribed);
            tracing::debug!("subscribed to in-flight computation");
            let deadline_t = tokio::time::Instant::from_std(deadline);
            match tokio::time::timeout_at(deadline_t, outcome_rx.recv()).await {
                Ok(Ok(TurnOutcome::Completed(answer))) => {
                    replay_answer(state, sink, cid, &input.prompt, &answer).await;
                    bump(&state.metrics.turns_completed);
                    Ok(())
                }
                // Subscribers observe the originator's failure; they do not
                // retry automatically.
                Ok(Ok(TurnOutcome::Failed { kind, message })) => {
                    sink.send(TurnEvent::Error { kind, message }).await;
                    bump(&state.metrics.turns_failed);
                    Ok(())
                }
                Ok(Err(_closed)) => Err(Error::Internal(
                    "shared computation was abandoned before completing".into(),
                )),
                Err(_elapsed) => Err(Error::Timeout("waiting on shared computation".into())),
            }
        }
        Join::Owner => {
            let result = compute_turn(
                state, input, cid, turn_id, sink, &fp, &resolved, &selection, &system_prompt,
                window, deadline,
            )
            .await;
            if let Err(e) = &result {
                state.inflight.complete(
                    &fp,
                    TurnOutcome::Failed {
                        kind: e.kind().to_string(),
                        message: e.safe_message(),
                    },
                );
            }
            result
        }
    }
}

/// Stream a cached or deduplicated answer back and record the exchange in
/// this turn's conversation.
async fn replay_answer(
    state: &AppState,
    sink: &EventSink,
    cid: &str,
    prompt: &str,
    answer: &CachedAnswer,
) {
    sink.send(TurnEvent::Start {
        conversation_id: cid.to_string(),
        model: answer.model_alias.clone(),
        cached: true,
    })
    .await;
    sink.send(TurnEvent::Content { delta: answer.answer.clone() }).await;
    sink.send(TurnEvent::Done {
        model: answer.model_alias.clone(),
        usage: Usage::default(),
        cached: true,
    })
    .await;

    if !sink.is_cancelled() {
        state.conversations.append(
            cid,
            vec![Message::user(prompt), Message::assistant(answer.answer.clone())],
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The owner's computation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn compute_turn(
    state: &AppState,
    input: &TurnInput,
    cid: &str,
    turn_id: Uuid,
    sink: &EventSink,
    fp: &str,
    resolved: &ResolvedModel,
    selection: &Selection,
    system_prompt: &str,
    window: Vec<Message>,
    deadline: Instant,
) -> Result<()> {
    let max_rounds = state.config.orchestrator.max_tool_rounds;

    // ── Tool subset ──────────────────────────────────────────────────
    let mut tool_names = selection.names();
    if mentions_knowledge_base(&input.prompt) && !tool_names.iter().any(|n| n == RAG_TOOL) {
        tool_names.push(RAG_TOOL.to_string());
    }
    let tool_defs = state.tools.describe(&tool_names);
    tracing::debug!(tools = ?tool_names, simple = selection.simple, "turn context ready");

    // ── Message window ───────────────────────────────────────────────
    let mut messages = Vec::with_capacity(window.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(window);
    messages.push(Message::user(&input.prompt));

    // Conversation writes are buffered and committed at round boundaries,
    // so a turn cancelled before any byte leaves no partial writes.
    let mut pending: Vec<Message> = vec![Message::user(&input.prompt)];

    sink.send(TurnEvent::Start {
        conversation_id: cid.to_string(),
        model: resolved.alias.clone(),
        cached: false,
    })
    .await;

    let mut total_usage = Usage::default();
    let mut seen_call_ids: HashSet<String> = HashSet::new();
    let mut final_text = String::new();

    // ── Tool-call rounds (plus one forced tools-disabled completion) ──
    for round in 0..=max_rounds {
        let tools_enabled = round < max_rounds;
        let defs = if tools_enabled { tool_defs.clone() } else { Vec::new() };

        let outcome = stream_model_round(state, resolved, &messages, defs, deadline, fp, sink)
            .instrument(tracing::info_span!("llm.call", round))
            .await?;

        if let Some(u) = &outcome.usage {
            total_usage.absorb(u);
        }
        if outcome.abandoned {
            state.inflight.abandon(fp);
            bump(&state.metrics.turns_cancelled);
            tracing::debug!("turn abandoned mid-stream, no subscribers");
            return Ok(());
        }

        if outcome.tool_calls.is_empty() || !tools_enabled {
            if !tools_enabled {
                tracing::debug!(max_rounds, "tool-round bound hit, used forced completion");
            }
            final_text = outcome.text;
            break;
        }

        // A call id the model reuses is dropped: handlers must never see
        // the same ToolCallRequest id twice.
        let calls: Vec<ToolCallRequest> = outcome
            .tool_calls
            .into_iter()
            .filter(|c| seen_call_ids.insert(c.id.clone()))
            .collect();

        sink.send(TurnEvent::ToolsCalled {
            round,
            tools: calls.iter().map(|c| c.name.clone()).collect(),
        })
        .await;
        for call in &calls {
            sink.send(TurnEvent::ToolCall {
                name: call.name.clone(),
                status: ToolCallStatus::Running,
                error: None,
            })
            .await;
        }

        if sink.is_cancelled() && !state.inflight.has_subscribers(fp) {
            state.inflight.abandon(fp);
            bump(&state.metrics.turns_cancelled);
            return Ok(());
        }

        // ── Concurrent dispatch ──────────────────────────────────────
        // Lifecycle events go out in completion order; transcript appends
        // stay in request order so the next round sees a deterministic
        // conversation. Latency is bounded by the slowest tool.
        let mut outputs: Vec<Option<sp_domain::message::ToolOutput>> =
            (0..calls.len()).map(|_| None).collect();
        let mut dispatches: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let span = tracing::info_span!("tool.call", tool = %call.name);
                async move {
                    let output = tools::dispatch(
                        &state.tools,
                        &state.limiters,
                        &state.breakers,
                        &state.metrics,
                        call,
                        deadline,
                        turn_id,
                    )
                    .await;
                    (i, output)
                }
                .instrument(span)
            })
            .collect();

        while let Some((i, output)) = dispatches.next().await {
            let error = match &output.payload {
                sp_domain::message::ToolPayload::Error { message, .. } => Some(message.clone()),
                _ => None,
            };
            sink.send(TurnEvent::ToolCall {
                name: output.tool_name.clone(),
                status: if output.is_error() {
                    ToolCallStatus::Error
                } else {
                    ToolCallStatus::Completed
                },
                error,
            })
            .await;
            outputs[i] = Some(output);
        }

        // ── Request-order transcript ─────────────────────────────────
        let assistant = Message::assistant_tool_calls(&outcome.text, calls.clone());
        messages.push(assistant.clone());
        pending.push(assistant);
        let max_bytes = state.config.orchestrator.tool_result_max_bytes;
        for (call, output) in calls.iter().zip(outputs.into_iter()) {
            let output = output.expect("every dispatched call produced an output");
            let rendered = output.render_for_model(max_bytes);
            let message = Message::tool_result(&call.id, rendered, output.is_error());
            messages.push(message.clone());
            pending.push(message);
        }

        for call in &calls {
            state.turn_log.append(
                TurnLogRecord::new(cid, "tool", resolved.alias.clone(), 0).with_tool(&call.name),
            );
        }

        // Completed dispatches are committed even if the turn is later
        // cancelled, so repeats can reuse their effects.
        state.conversations.append(cid, std::mem::take(&mut pending));
    }

    // ── Finalize ─────────────────────────────────────────────────────
    if sink.is_cancelled() && !state.inflight.has_subscribers(fp) {
        state.inflight.abandon(fp);
        bump(&state.metrics.turns_cancelled);
        return Ok(());
    }

    pending.push(Message::assistant(final_text.clone()));
    state.conversations.append(cid, std::mem::take(&mut pending));

    state.turn_log.append(TurnLogRecord::new(
        cid,
        "user",
        resolved.alias.clone(),
        total_usage.prompt_tokens,
    ));
    state.turn_log.append(TurnLogRecord::new(
        cid,
        "assistant",
        resolved.alias.clone(),
        total_usage.completion_tokens,
    ));

    let answer = CachedAnswer {
        answer: final_text,
        model_alias: resolved.alias.clone(),
    };
    state.caches.store(fp, answer.clone(), selection.simple);
    state.inflight.complete(fp, TurnOutcome::Completed(answer.clone()));

    sink.send(TurnEvent::Done {
        model: resolved.alias.clone(),
        usage: total_usage,
        cached: false,
    })
    .await;
    bump(&state.metrics.turns_completed);
    Ok(())
}

fn mentions_knowledge_base(prompt: &str) -> bool {
    let p = prompt.to_lowercase();
    p.contains("knowledge base") || p.contains("internal doc") || p.contains(" kb ")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One streamed model round
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RoundOutcome {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    /// The client vanished and nobody is subscribed: the stream was dropped
    /// early and the turn should stop.
    abandoned: bool,
}

async fn stream_model_round(
    state: &AppState,
    resolved: &ResolvedModel,
    messages: &[Message],
    defs: Vec<sp_domain::message::ToolDefinition>,
    deadline: Instant,
    fp: &str,
    sink: &EventSink,
) -> Result<RoundOutcome> {
    let mut req = ChatRequest::new(resolved.deployment.clone(), messages.to_vec());
    req.tools = defs;
    req.temperature = Some(0.2);
    req.deadline = Some(deadline);

    let breaker = state.breakers.get("llm");
    breaker.admit()?;

    let client = state.models.client();
    let mut stream = match client.stream(&req).await {
        Ok(s) => s,
        Err(e) => {
            breaker.record_failure();
            return Err(into_model_error(e));
        }
    };

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    // call_id → (tool_name, argument buffer), in arrival order.
    let mut partial: Vec<(String, String, String)> = Vec::new();
    let mut usage: Option<Usage> = None;

    while let Some(event) = stream.next().await {
        if sink.is_cancelled() && !state.inflight.has_subscribers(fp) {
            // Dropping the stream releases the connection within one
            // roundtrip; the breaker saw a healthy call so far.
            breaker.record_success();
            return Ok(RoundOutcome {
                text,
                tool_calls,
                usage,
                abandoned: true,
            });
        }

        match event {
            Ok(StreamEvent::Token { text: delta }) => {
                sink.send(TurnEvent::Content { delta: delta.clone() }).await;
                text.push_str(&delta);
            }
            Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                partial.push((call_id, tool_name, String::new()));
            }
            Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                if let Some(entry) = partial.iter_mut().find(|(id, _, _)| *id == call_id) {
                    entry.2.push_str(&delta);
                }
            }
            Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                partial.retain(|(id, _, _)| *id != call_id);
                tool_calls.push(ToolCallRequest { id: call_id, name: tool_name, arguments });
            }
            Ok(StreamEvent::Done { usage: u, .. }) => {
                usage = u;
                break;
            }
            Ok(StreamEvent::Error { message }) => {
                breaker.record_failure();
                return Err(Error::ModelError(message));
            }
            Err(e) => {
                breaker.record_failure();
                return Err(into_model_error(e));
            }
        }
    }

    // Assemble calls that streamed via start/delta without a finish marker.
    for (call_id, tool_name, buffer) in partial {
        let arguments = if buffer.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&buffer).unwrap_or_else(|e| {
                tracing::warn!(call_id = %call_id, tool = %tool_name, error = %e,
                    "tool-call arguments were not valid JSON; using empty object");
                serde_json::Value::Object(Default::default())
            })
        };
        tool_calls.push(ToolCallRequest { id: call_id, name: tool_name, arguments });
    }

    breaker.record_success();
    Ok(RoundOutcome { text, tool_calls, usage, abandoned: false })
}

/// Transport-layer errors from the model client keep their timeout kind;
/// everything else surfaces as `model_error`.
fn into_model_error(e: Error) -> Error {
    match e {
        Error::Timeout(_) | Error::ModelError(_) | Error::RateLimited { .. } => e,
        other => Error::ModelError(other.safe_message()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::Value;

    use sp_domain::config::Config;
    use sp_domain::message::Role;
    use sp_domain::stream::BoxStream;
    use sp_providers::{ChatResponse, LlmClient, ModelRegistry};
    use sp_sessions::ConversationStore;
    use sp_upstream::{BreakerMap, LimiterMap};

    use crate::runtime::cache::ResponseCaches;
    use crate::runtime::inflight::InflightMap;
    use crate::runtime::metrics::Metrics;
    use crate::runtime::selector::ToolSelector;
    use crate::runtime::tools::test_support::test_registry;
    use crate::runtime::tools::QUOTE_TOOL;

    // ── Scripted model ───────────────────────────────────────────────

    enum Step {
        Text(&'static str),
        Calls(Vec<(&'static str, Value)>),
    }

    struct ScriptedLlm {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        /// tools.len() of each request, in call order.
        tools_seen: Mutex<Vec<usize>>,
        connect_delay: Duration,
    }

    impl ScriptedLlm {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Self::with_delay(steps, Duration::ZERO)
        }

        fn with_delay(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                tools_seen: Mutex::new(Vec::new()),
                connect_delay: delay,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Err(Error::ModelError("scripted client only streams".into()))
        }

        async fn stream(
            &self,
            req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tools_seen.lock().push(req.tools.len());
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }

            let step = self
                .steps
                .lock()
                .pop_front()
                .unwrap_or(Step::Text("fallback answer"));

            let mut events: Vec<Result<StreamEvent>> = Vec::new();
            match step {
                Step::Text(text) => {
                    let mid = text.len() / 2;
                    let mut cut = mid;
                    while cut > 0 && !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    events.push(Ok(StreamEvent::Token { text: text[..cut].to_string() }));
                    events.push(Ok(StreamEvent::Token { text: text[cut..].to_string() }));
                    events.push(Ok(StreamEvent::Done {
                        usage: Some(Usage {
                            prompt_tokens: 20,
                            completion_tokens: 10,
                            total_tokens: 30,
                        }),
                        finish_reason: Some("stop".into()),
                    }));
                }
                Step::Calls(calls) => {
                    let round = self.calls.load(Ordering::SeqCst);
                    for (i, (name, args)) in calls.into_iter().enumerate() {
                        let id = format!("call_{round}_{}", i + 1);
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: id.clone(),
                            tool_name: name.to_string(),
                        }));
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: id,
                            delta: args.to_string(),
                        }));
                    }
                    events.push(Ok(StreamEvent::Done {
                        usage: Some(Usage {
                            prompt_tokens: 25,
                            completion_tokens: 5,
                            total_tokens: 30,
                        }),
                        finish_reason: Some("tool_calls".into()),
                    }));
                }
            }

            Ok(Box::pin(futures_util::stream::iter(events)))
        }

        fn client_id(&self) -> &str {
            "scripted"
        }
    }

    // ── Harness ─────────────────────────────────────────────────────

    async fn test_state(llm: Arc<dyn LlmClient>) -> (AppState, tempfile::TempDir) {
        let config = Arc::new(Config::default());
        let metrics = Arc::new(Metrics::new());
        let (registry, dir) = test_registry().await;

        let state = AppState {
            models: Arc::new(ModelRegistry::new(&config.llm, llm).unwrap()),
            conversations: Arc::new(ConversationStore::new(
                config.conversation.max_tokens_per_turn,
                Duration::from_secs(config.conversation.ttl_s),
            )),
            tools: Arc::new(registry),
            selector: Arc::new(ToolSelector::new(
                config.selector.clone(),
                None,
                metrics.clone(),
            )),
            caches: Arc::new(ResponseCaches::new(&config.cache)),
            inflight: Arc::new(InflightMap::new(Duration::from_secs(
                config.cache.dedup_ttl_s,
            ))),
            breakers: Arc::new(BreakerMap::new(config.breakers.clone())),
            limiters: Arc::new(LimiterMap::new(&config.limits)),
            metrics,
            config,
            turn_log: Arc::new(sp_sessions::TracingLogSink),
        };
        (state, dir)
    }

    async fn collect(mut handle: TurnHandle) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(ev) = handle.events.recv().await {
            events.push(ev);
        }
        events
    }

    fn answer_of(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Content { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    fn done_of(events: &[TurnEvent]) -> (&str, bool) {
        match events.last() {
            Some(TurnEvent::Done { model, cached, .. }) => (model, *cached),
            other => panic!("stream must terminate with done, got {other:?}"),
        }
    }

    fn input(prompt: &str, conversation_id: Option<&str>) -> TurnInput {
        TurnInput {
            conversation_id: conversation_id.map(String::from),
            prompt: prompt.into(),
            deployment: None,
            system_prompt: None,
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_greeting_is_computed_then_served_from_cache() {
        let llm = ScriptedLlm::new(vec![Step::Text("Hello! How can I help with markets today?")]);
        let (state, _dir) = test_state(llm.clone()).await;

        let first = collect(run_turn(state.clone(), input("Hello", None))).await;
        assert!(matches!(
            first.first(),
            Some(TurnEvent::Start { cached: false, .. })
        ));
        let first_answer = answer_of(&first);
        assert!(!first_answer.is_empty());
        let (model, cached) = done_of(&first);
        assert_eq!(model, "lite", "simple query downgrades to the cheap alias");
        assert!(!cached);

        // Identical turn inside the TTL: byte-identical, flagged cached,
        // no second model call.
        let second = collect(run_turn(state.clone(), input("Hello", None))).await;
        assert_eq!(answer_of(&second), first_answer);
        let (_, cached) = done_of(&second);
        assert!(cached);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn quote_turn_runs_one_tool_and_answers_with_the_price() {
        let llm = ScriptedLlm::new(vec![
            Step::Calls(vec![(QUOTE_TOOL, serde_json::json!({"symbol": "AAPL"}))]),
            Step::Text("AAPL is trading at 172.34, up 0.74% on the day."),
        ]);
        let (state, _dir) = test_state(llm.clone()).await;

        let handle = run_turn(
            state.clone(),
            input("What is the current price of AAPL?", Some("conv-1")),
        );
        let events = collect(handle).await;

        // start → tools_called → running → completed → content → done.
        assert!(matches!(events[0], TurnEvent::Start { cached: false, .. }));
        let statuses: Vec<ToolCallStatus> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolCall { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ToolCallStatus::Running, ToolCallStatus::Completed]);
        assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolsCalled { round: 0, tools } if tools == &vec![QUOTE_TOOL.to_string()])));
        assert!(answer_of(&events).contains("172.34"));
        assert_eq!(llm.call_count(), 2);

        // Conversation invariant: the tool answer directly follows the
        // assistant message that requested it, exactly once.
        let window = state.conversations.window("conv-1");
        let idx = window
            .iter()
            .position(|m| !m.tool_calls.is_empty())
            .expect("assistant tool-call message stored");
        assert_eq!(window[idx + 1].role, Role::Tool);
        assert_eq!(
            window[idx + 1].tool_call_id.as_deref(),
            Some(window[idx].tool_calls[0].id.as_str())
        );
        let tool_answers = window
            .iter()
            .filter(|m| m.tool_call_id.as_deref() == Some(window[idx].tool_calls[0].id.as_str()))
            .count();
        assert_eq!(tool_answers, 1);
    }

    #[tokio::test]
    async fn tool_round_bound_forces_a_tools_disabled_completion() {
        let always_call = || Step::Calls(vec![(QUOTE_TOOL, serde_json::json!({"symbol": "AAPL"}))]);
        let llm = ScriptedLlm::new(vec![
            always_call(),
            always_call(),
            always_call(),
            Step::Text("Based on the quotes gathered, AAPL looks steady."),
        ]);
        let (state, _dir) = test_state(llm.clone()).await;

        let events = collect(run_turn(
            state.clone(),
            input("What is the price of AAPL stock today?", None),
        ))
        .await;

        // max_tool_rounds tool rounds plus the forced completion.
        let max_rounds = state.config.orchestrator.max_tool_rounds;
        assert_eq!(llm.call_count(), max_rounds + 1);
        // The forced final call carried no tool definitions.
        assert_eq!(*llm.tools_seen.lock().last().unwrap(), 0);
        assert!(answer_of(&events).contains("steady"));
        let (_, cached) = done_of(&events);
        assert!(!cached);
    }

    #[tokio::test]
    async fn invalid_model_alias_errors_before_any_token() {
        let llm = ScriptedLlm::new(vec![Step::Text("never reached")]);
        let (state, _dir) = test_state(llm.clone()).await;

        let mut turn_input = input("What is the price of AAPL?", None);
        turn_input.deployment = Some("gpt-99-ultra".into());
        let events = collect(run_turn(state, turn_input)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TurnEvent::Error { kind, .. } if kind == "invalid_request"
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_identical_turns_share_one_computation() {
        let llm = ScriptedLlm::with_delay(
            vec![Step::Text("Shared computation result.")],
            Duration::from_millis(100),
        );
        let (state, _dir) = test_state(llm.clone()).await;

        let h1 = run_turn(state.clone(), input("Hello", None));
        let h2 = run_turn(state.clone(), input("Hello", None));
        let (e1, e2) = tokio::join!(collect(h1), collect(h2));

        assert_eq!(llm.call_count(), 1, "one computation for both turns");
        assert_eq!(answer_of(&e1), answer_of(&e2), "identical payloads");

        let cached_flags: Vec<bool> = [&e1, &e2].iter().map(|e| done_of(e).1).collect();
        assert!(cached_flags.contains(&false), "the owner computed");
        assert!(cached_flags.contains(&true), "the subscriber was served");
        assert_eq!(
            state
                .metrics
                .inflight_subscribed
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn cancellation_before_any_byte_leaves_no_traces() {
        let llm = ScriptedLlm::with_delay(
            vec![Step::Text("slow answer")],
            Duration::from_millis(80),
        );
        let (state, _dir) = test_state(llm.clone()).await;

        let handle = run_turn(state.clone(), input("Hello", Some("conv-gone")));
        drop(handle.events);

        // Give the turn task time to notice and unwind.
        let waited = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if state.metrics.turns_cancelled.load(Ordering::Relaxed) > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "turn should observe the cancellation");

        assert_eq!(state.caches.sizes(), (0, 0), "no cache entry written");
        assert!(state.conversations.window("conv-gone").is_empty());
        assert_eq!(state.inflight.len(), 0);

        // The next identical turn is a full miss and computes fresh.
        let events = collect(run_turn(state.clone(), input("Hello", None))).await;
        let (_, cached) = done_of(&events);
        assert!(!cached);
    }

    #[tokio::test]
    async fn model_error_closes_the_stream_with_an_error_event() {
        struct BrokenLlm;
        #[async_trait::async_trait]
        impl LlmClient for BrokenLlm {
            async fn complete(&self, _req: &ChatRequest) -> Result<ChatResponse> {
                Err(Error::ModelError("upstream 500".into()))
            }
            async fn stream(
                &self,
                _req: &ChatRequest,
            ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
                Err(Error::ModelError("upstream 500".into()))
            }
            fn client_id(&self) -> &str {
                "broken"
            }
        }

        let (state, _dir) = test_state(Arc::new(BrokenLlm)).await;
        let events = collect(run_turn(state.clone(), input("Hello", None))).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::Error { kind, .. }) if kind == "model_error"
        ));
        // The failed computation was not cached; entry released.
        assert_eq!(state.caches.sizes(), (0, 0));
        assert_eq!(state.inflight.len(), 0);
    }

    #[tokio::test]
    async fn clear_then_reask_starts_fresh() {
        let llm = ScriptedLlm::new(vec![
            Step::Text("first answer"),
            Step::Text("second answer"),
        ]);
        let (state, _dir) = test_state(llm.clone()).await;

        let _ = collect(run_turn(state.clone(), input("Hello", Some("conv-x")))).await;
        assert!(!state.conversations.window("conv-x").is_empty());

        assert!(state.conversations.clear("conv-x"));
        assert!(state.conversations.window("conv-x").is_empty());
        assert!(!state.conversations.clear("conv-x"), "second clear is not found");
    }
}
