//! Request deduplication: the in-flight map.
//!
//! The first turn to see a fingerprint becomes the **owner** and computes;
//! later turns become **subscribers** on a broadcast channel and receive the
//! owner's outcome. At most one computation runs per fingerprint.
//!
//! Cancellation rules:
//! - a subscriber dropping its receiver affects nobody else;
//! - an owner whose client is gone keeps computing while subscribers remain
//!   (ownership effectively transfers), and abandons otherwise;
//! - a failed computation fans the failure out and removes the entry, so
//!   the next identical request retries immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::runtime::cache::CachedAnswer;

/// How one shared computation ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(CachedAnswer),
    Failed { kind: String, message: String },
}

struct Entry {
    tx: broadcast::Sender<TurnOutcome>,
    started: Instant,
}

/// Result of [`InflightMap::join`].
pub enum Join {
    /// This caller computes; it must end with [`InflightMap::complete`] or
    /// [`InflightMap::abandon`].
    Owner,
    /// Another turn is already computing the same fingerprint.
    Subscriber(broadcast::Receiver<TurnOutcome>),
}

pub struct InflightMap {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InflightMap {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Join the computation for `fp`: the first caller (or the first after a
    /// stale entry) becomes the owner.
    pub fn join(&self, fp: &str) -> Join {
        let mut g = self.entries.lock();
        if let Some(entry) = g.get(fp) {
            if entry.started.elapsed() <= self.ttl {
                return Join::Subscriber(entry.tx.subscribe());
            }
            // The previous owner hung past the dedup window; take over.
            tracing::warn!(fingerprint = %short(fp), "stale in-flight entry replaced");
        }
        let (tx, _) = broadcast::channel(4);
        g.insert(fp.to_string(), Entry { tx, started: Instant::now() });
        Join::Owner
    }

    /// Whether anyone is currently subscribed to `fp`'s outcome. Used by a
    /// cancelled owner to decide between finishing and abandoning.
    pub fn has_subscribers(&self, fp: &str) -> bool {
        self.entries
            .lock()
            .get(fp)
            .map(|e| e.tx.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Publish the outcome to all subscribers and release the entry.
    pub fn complete(&self, fp: &str, outcome: TurnOutcome) {
        if let Some(entry) = self.entries.lock().remove(fp) {
            // No receivers is fine; send only fails when nobody subscribed.
            let _ = entry.tx.send(outcome);
        }
    }

    /// Drop the entry without publishing (cancelled owner, no subscribers).
    pub fn abandon(&self, fp: &str) {
        self.entries.lock().remove(fp);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn short(fp: &str) -> &str {
    &fp[..fp.len().min(12)]
}
