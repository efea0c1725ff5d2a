//! Response caching: TTL+LRU caches keyed by request fingerprints.
//!
//! The fingerprint covers the normalized prompt, the resolved model alias,
//! a digest of the system prompt, and a digest of the trailing conversation
//! window — so multi-turn exchanges stay coherent while single-turn simple
//! queries collide freely.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use sp_domain::config::CacheConfig;
use sp_domain::message::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprinting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Leading politeness tokens that never change the meaning of a query.
const STOPWORD_PREFIX: &[&str] = &["please", "pls", "kindly", "hey", "hi", "hello"];

/// Number of trailing window messages folded into the fingerprint.
const WINDOW_TAIL: usize = 6;

/// Lowercase, trim, collapse whitespace, strip the politeness prefix.
pub fn normalize_prompt(prompt: &str) -> String {
    let lowered = prompt.to_lowercase();
    let mut words: Vec<&str> = lowered.split_whitespace().collect();
    while let Some(first) = words.first() {
        let bare = first.trim_matches(|c: char| !c.is_alphanumeric());
        if STOPWORD_PREFIX.contains(&bare) {
            words.remove(0);
        } else {
            break;
        }
    }
    words.join(" ")
}

/// Stable SHA-256 fingerprint for a turn.
pub fn fingerprint(
    prompt: &str,
    model_alias: &str,
    system_prompt: &str,
    window: &[Message],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update([0]);
    hasher.update(model_alias.as_bytes());
    hasher.update([0]);
    hasher.update(Sha256::digest(system_prompt.as_bytes()));

    // Trailing window digest: role + content of the last few messages.
    let mut tail = Sha256::new();
    let skip = window.len().saturating_sub(WINDOW_TAIL);
    for msg in &window[skip..] {
        tail.update([msg.role as u8, 0x1f]);
        tail.update(msg.content_or_empty().as_bytes());
        tail.update([0x1e]);
    }
    hasher.update(tail.finalize());

    hex::encode(hasher.finalize())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTL + LRU cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Slot<V> {
    value: V,
    inserted: Instant,
}

struct CacheInner<V> {
    map: HashMap<String, Slot<V>>,
    /// Recency order, least-recent first.
    order: VecDeque<String>,
}

/// Bounded cache with lazy TTL expiry and LRU eviction at capacity.
/// Entries are immutable; `put` on an existing key replaces atomically.
pub struct TtlLruCache<V: Clone> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner { map: HashMap::new(), order: VecDeque::new() }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut g = self.inner.lock();
        match g.map.get(key) {
            Some(slot) if slot.inserted.elapsed() <= self.ttl => {
                let value = slot.value.clone();
                touch(&mut g.order, key);
                Some(value)
            }
            Some(_) => {
                g.map.remove(key);
                g.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: V) {
        let mut g = self.inner.lock();
        if g.map.insert(key.to_string(), Slot { value, inserted: Instant::now() }).is_some() {
            touch(&mut g.order, key);
        } else {
            g.order.push_back(key.to_string());
        }
        while g.map.len() > self.capacity {
            match g.order.pop_front() {
                Some(evicted) => {
                    g.map.remove(&evicted);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_back(key.to_string());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response caches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A cached final answer, replayable to any client.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub answer: String,
    pub model_alias: String,
}

/// The two response caches of the gateway: the general one and the
/// short-TTL one populated only for simple-classified queries.
pub struct ResponseCaches {
    response: TtlLruCache<CachedAnswer>,
    simple: TtlLruCache<CachedAnswer>,
}

impl ResponseCaches {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            response: TtlLruCache::new(cfg.response_capacity, Duration::from_secs(cfg.response_ttl_s)),
            simple: TtlLruCache::new(cfg.simple_capacity, Duration::from_secs(cfg.simple_ttl_s)),
        }
    }

    /// Check both caches (general first).
    pub fn lookup(&self, fp: &str) -> Option<CachedAnswer> {
        self.response.get(fp).or_else(|| self.simple.get(fp))
    }

    /// Store a computed answer into the cache matching its classification.
    pub fn store(&self, fp: &str, answer: CachedAnswer, simple_query: bool) {
        if simple_query {
            self.simple.put(fp, answer);
        } else {
            self.response.put(fp, answer);
        }
    }

    pub fn sizes(&self) -> (usize, usize) {
        (self.response.len(), self.simple.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_noise() {
        assert_eq!(normalize_prompt("  Please   tell me the AAPL price "), "tell me the aapl price");
        assert_eq!(normalize_prompt("Hey, please what is TSLA?"), "what is tsla?");
        assert_eq!(normalize_prompt("plain query"), "plain query");
    }

    #[test]
    fn equivalent_prompts_share_a_fingerprint() {
        let a = fingerprint("Please what is AAPL?", "analyst", "sys", &[]);
        let b = fingerprint("what   is aapl?", "analyst", "sys", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn model_and_context_split_fingerprints() {
        let base = fingerprint("what is aapl?", "analyst", "sys", &[]);
        assert_ne!(base, fingerprint("what is aapl?", "lite", "sys", &[]));
        assert_ne!(base, fingerprint("what is aapl?", "analyst", "other-sys", &[]));

        let window = vec![Message::user("earlier turn")];
        assert_ne!(base, fingerprint("what is aapl?", "analyst", "sys", &window));
    }

    #[test]
    fn lru_evicts_least_recent_at_capacity() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put("a", 1);
        cache.put("b", 2);
        cache.get("a"); // refresh a
        cache.put("c", 3); // evicts b
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn ttl_expires_lazily() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(10, Duration::ZERO);
        cache.put("k", 7);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_replaces_atomically() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put("k", 1);
        cache.put("k", 2);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn simple_and_general_caches_are_disjoint() {
        let caches = ResponseCaches::new(&CacheConfig::default());
        let ans = CachedAnswer { answer: "hi".into(), model_alias: "lite".into() };
        caches.store("fp1", ans.clone(), true);
        assert_eq!(caches.lookup("fp1"), Some(ans));
        let (general, simple) = caches.sizes();
        assert_eq!((general, simple), (0, 1));
    }
}
