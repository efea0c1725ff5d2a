//! The truncation policy applied after every store.
//!
//! Rules, in priority order:
//! 1. System messages are preserved in full.
//! 2. The final user message is preserved in full (it rides above the
//!    budget; the stored window may exceed `max_tokens` by exactly its size).
//! 3. Walking from the tail, whole turn units are kept while they fit.
//! 4. A unit is atomic: an assistant message that emitted tool calls stays
//!    with all of its tool-role answers — a tool message is never orphaned.

use sp_domain::message::{Message, Role};

/// One atomic slice of the transcript: a single user/assistant message, or
/// an assistant tool-call message plus its tool-role answers.
#[derive(Debug)]
struct Unit {
    start: usize,
    end: usize, // exclusive
    tokens: usize,
}

/// Apply the truncation policy in place.
pub fn enforce_budget(messages: &mut Vec<Message>, max_tokens: usize) {
    let last_user = messages
        .iter()
        .rposition(|m| m.role == Role::User);

    // System messages always survive and count against the budget.
    let system_tokens: usize = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.token_count())
        .sum();

    let units = partition_units(messages);

    // Walk units newest-first, keeping whole units while they fit. The unit
    // holding the final user message is exempt from the budget.
    let mut remaining = max_tokens.saturating_sub(system_tokens);
    let mut keep = vec![false; units.len()];
    for (i, unit) in units.iter().enumerate().rev() {
        let holds_last_user = last_user.is_some_and(|lu| unit.start <= lu && lu < unit.end);
        if holds_last_user {
            keep[i] = true;
            continue;
        }
        if unit.tokens <= remaining {
            keep[i] = true;
            remaining -= unit.tokens;
        } else {
            // Everything older than the first unit that does not fit is
            // dropped too, so the window stays contiguous.
            break;
        }
    }

    let mut kept = Vec::with_capacity(messages.len());
    let mut unit_iter = units.iter().zip(keep.iter()).peekable();
    for (idx, msg) in messages.drain(..).enumerate() {
        if msg.role == Role::System {
            kept.push(msg);
            continue;
        }
        while let Some((u, _)) = unit_iter.peek() {
            if idx >= u.end {
                unit_iter.next();
            } else {
                break;
            }
        }
        if let Some((u, keep_unit)) = unit_iter.peek() {
            if idx >= u.start && **keep_unit {
                kept.push(msg);
            }
        }
    }
    *messages = kept;
}

/// Partition the non-system tail of the transcript into atomic units.
fn partition_units(messages: &[Message]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        if messages[i].role == Role::System {
            i += 1;
            continue;
        }
        let start = i;
        let mut tokens = messages[i].token_count();
        let mut end = i + 1;
        if messages[i].role == Role::Assistant && !messages[i].tool_calls.is_empty() {
            while end < messages.len() && messages[end].role == Role::Tool {
                tokens += messages[end].token_count();
                end += 1;
            }
        }
        units.push(Unit { start, end, tokens });
        i = end;
    }
    units
}

/// Total estimated tokens across a window.
pub fn window_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.token_count()).sum()
}
