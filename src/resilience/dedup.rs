//! In-flight request coalescing.
//!
//! Concurrent callers that present the same [`DedupKey`] share a single
//! invocation of the underlying operation and all observe its outcome. The
//! entry is dropped as soon as the operation settles, so the next call after
//! that starts fresh. Entries that never settle are removed by
//! [`RequestDeduplicator::sweep_stale`].

use crate::{Error, ErrorContext, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// SHA-256 over a canonical encoding of the request. Header names are
    /// case-insensitive and header order does not matter.
    pub fn for_request(
        method: &str,
        target: &str,
        body: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Self {
        let headers: BTreeMap<String, &str> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), *value))
            .collect();
        let canonical = serde_json::json!({
            "method": method.to_ascii_uppercase(),
            "target": target,
            "body": body,
            "headers": headers,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DedupKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DedupKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

type Erased = Arc<dyn Any + Send + Sync>;
type SharedOutcome = Shared<BoxFuture<'static, std::result::Result<Erased, Error>>>;

struct Pending {
    id: u64,
    created_at: Instant,
    outcome: SharedOutcome,
}

struct Inner {
    pending: Mutex<HashMap<DedupKey, Pending>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<DedupKey, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes `key` only if it still refers to invocation `id`.
    fn settle(&self, key: &DedupKey, id: u64) {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|p| p.id == id) {
            pending.remove(key);
        }
    }
}

/// Diagnostics for one in-flight key.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub key: DedupKey,
    pub age: Duration,
}

#[derive(Clone)]
pub struct RequestDeduplicator {
    inner: Arc<Inner>,
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl RequestDeduplicator {
    /// `timeout` is the age after which an unsettled entry is considered stale.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Runs `op` unless an invocation for `key` is already in flight, in
    /// which case the caller waits for and receives that invocation's outcome.
    ///
    /// The operation is driven by whichever caller polls it, so it completes
    /// even if the caller that started it goes away. Callers sharing a key
    /// must agree on `T`; a mismatch is reported as [`Error::Internal`].
    pub async fn deduplicate_request<T, F, Fut>(&self, op: F, key: impl Into<DedupKey>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        let outcome = {
            let mut pending = self.inner.lock();
            match pending.get(&key) {
                Some(p) if p.created_at.elapsed() < self.inner.timeout => {
                    debug!(key = %key, "joining in-flight request");
                    p.outcome.clone()
                }
                _ => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let settle_key = key.clone();
                    let fut = op();
                    let outcome = async move {
                        let result = fut.await.map(|value| Arc::new(value) as Erased);
                        inner.settle(&settle_key, id);
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        key.clone(),
                        Pending {
                            id,
                            created_at: Instant::now(),
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        let value = outcome.await?;
        match value.downcast::<T>() {
            Ok(typed) => Ok(T::clone(&typed)),
            Err(_) => Err(Error::internal_with_context(
                "deduplicated result has a different type than requested",
                ErrorContext::new()
                    .with_details(key.to_string())
                    .with_source("dedup"),
            )),
        }
    }

    /// Drops entries older than the timeout. Returns how many were removed.
    ///
    /// Callers already waiting on a removed entry keep waiting on it; only
    /// new callers start a fresh invocation.
    pub fn sweep_stale(&self) -> usize {
        let timeout = self.inner.timeout;
        let mut pending = self.inner.lock();
        let before = pending.len();
        pending.retain(|key, p| {
            let keep = p.created_at.elapsed() < timeout;
            if !keep {
                warn!(key = %key, "dropping stale in-flight request");
            }
            keep
        });
        before - pending.len()
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        self.inner
            .lock()
            .iter()
            .map(|(key, p)| InFlight {
                key: key.clone(),
                age: p.created_at.elapsed(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
