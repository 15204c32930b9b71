//! Bounded per-process rate accounting used while the shared store is unreachable.

use super::routes::RouteLimit;
use super::store::{epoch_ms, StoreDecision};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LocalEntry {
    count: u64,
    expires_at: Instant,
}

/// LRU cache of per-identifier counters with a per-entry TTL equal to the
/// limit's window.
///
/// Memory stays bounded by `capacity` no matter how many distinct
/// identifiers are seen; the least recently used entry is evicted first.
pub struct LocalRateCache {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalRateCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, LocalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one request for `key` and reports whether it fits the limit.
    pub fn hit(&self, key: &str, limit: &RouteLimit) -> StoreDecision {
        let now = Instant::now();
        let mut entries = self.lock();

        let fresh = match entries.get(key) {
            Some(entry) => now >= entry.expires_at,
            None => true,
        };
        if fresh {
            entries.put(
                key.to_string(),
                LocalEntry {
                    count: 0,
                    expires_at: now + limit.window,
                },
            );
        }

        let Some(entry) = entries.get_mut(key) else {
            return StoreDecision {
                allowed: false,
                count: 0,
                reset_at_ms: epoch_ms() + limit.window.as_millis() as u64,
            };
        };
        let allowed = entry.count < limit.limit;
        if allowed {
            entry.count += 1;
        }
        StoreDecision {
            allowed,
            count: entry.count,
            reset_at_ms: epoch_ms() + entry.expires_at.saturating_duration_since(now).as_millis() as u64,
        }
    }

    /// Drops entries whose window has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}
