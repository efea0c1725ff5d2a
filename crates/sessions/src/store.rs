//! Process-local conversation store.
//!
//! Maps conversation id → bounded message window. Mutated only by the
//! orchestrator; evicted lazily on access and by [`ConversationStore::sweep`]
//! once the idle TTL passes. Nothing is persisted — the spec's conversation
//! state is an in-memory cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use sp_domain::message::Message;

use crate::window;

struct Conversation {
    messages: Vec<Message>,
    updated_at: Instant,
}

pub struct ConversationStore {
    max_tokens: usize,
    ttl: Duration,
    inner: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new(max_tokens: usize, ttl: Duration) -> Self {
        Self {
            max_tokens,
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append messages to a conversation (created on first use), then apply
    /// the truncation policy.
    pub fn append(&self, id: &str, messages: Vec<Message>) {
        let mut inner = self.inner.write();
        let convo = inner.entry(id.to_string()).or_insert_with(|| Conversation {
            messages: Vec::new(),
            updated_at: Instant::now(),
        });
        convo.messages.extend(messages);
        window::enforce_budget(&mut convo.messages, self.max_tokens);
        convo.updated_at = Instant::now();
    }

    /// The current message window, empty when the conversation is unknown
    /// or expired. Expired entries are dropped on the spot.
    pub fn window(&self, id: &str) -> Vec<Message> {
        {
            let inner = self.inner.read();
            match inner.get(id) {
                Some(c) if c.updated_at.elapsed() <= self.ttl => return c.messages.clone(),
                Some(_) => {}
                None => return Vec::new(),
            }
        }
        self.inner.write().remove(id);
        Vec::new()
    }

    /// Remove a conversation. Returns whether it existed (and was live).
    pub fn clear(&self, id: &str) -> bool {
        match self.inner.write().remove(id) {
            Some(c) => c.updated_at.elapsed() <= self.ttl,
            None => false,
        }
    }

    /// Drop every conversation past the idle TTL. Returns the evicted count.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|_, c| c.updated_at.elapsed() <= self.ttl);
        let evicted = before - inner.len();
        if evicted > 0 {
            tracing::debug!(evicted, "conversation sweep");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
