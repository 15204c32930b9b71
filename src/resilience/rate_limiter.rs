use crate::config::duration_ms;
use crate::resilience::token_bucket::{valid_request, TokenBucket};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub name: String,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    pub queued: usize,
    /// Estimated wait time until one token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Bucket capacity (burst size).
    pub max_tokens: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Upper bound on how long the queue processor sleeps between attempts.
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 10.0,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            max_tokens: rps.max(1.0), // default burst: 1 second worth, at least 1
            refill_rate: rps,
            ..Self::new()
        })
    }

    /// Set the maximum tokens (burst size)
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens as f64;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call options for [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    /// How long the caller is willing to wait in the queue. Zero means a
    /// single non-blocking attempt.
    pub timeout: Duration,
    /// Higher priorities are served first.
    pub priority: i32,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            priority: 0,
        }
    }
}

/// Immediate-attempt schedule used by [`RateLimiter::acquire_with_backoff`]
/// before it falls back to queueing.
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

struct QueuedRequest {
    id: u64,
    tokens: f64,
    priority: i32,
    enqueued_at: Instant,
    deadline: Instant,
    done: oneshot::Sender<bool>,
}

struct State {
    bucket: TokenBucket,
    /// Sorted by priority desc, then enqueue order asc.
    queue: VecDeque<QueuedRequest>,
    processing: bool,
    next_id: u64,
}

struct Shared {
    name: String,
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serves the queue head until the queue drains. At most one of these
    /// runs per limiter, guarded by `State::processing`.
    async fn process_queue(self: Arc<Self>) {
        let mut running = ProcessingFlag {
            shared: &self,
            armed: true,
        };
        loop {
            let pause = {
                let mut guard = self.lock();
                let st = &mut *guard;
                let now = Instant::now();

                let mut i = 0;
                while i < st.queue.len() {
                    let stale = st.queue[i].deadline <= now || st.queue[i].done.is_closed();
                    if stale {
                        if let Some(waiter) = st.queue.remove(i) {
                            debug!(
                                limiter = %self.name,
                                waited_ms = now.duration_since(waiter.enqueued_at).as_millis() as u64,
                                "rate limiter waiter expired"
                            );
                            let _ = waiter.done.send(false);
                        }
                    } else {
                        i += 1;
                    }
                }

                loop {
                    let Some(tokens) = st.queue.front().map(|w| w.tokens) else {
                        st.processing = false;
                        running.armed = false;
                        return;
                    };
                    if !st.bucket.try_consume(tokens) {
                        break;
                    }
                    if let Some(waiter) = st.queue.pop_front() {
                        if waiter.done.send(true).is_err() {
                            st.bucket.refund(tokens);
                        }
                    }
                }

                match st.queue.front() {
                    Some(head) => st
                        .bucket
                        .wait_time(head.tokens)
                        .min(self.cfg.poll_interval)
                        .min(head.deadline.saturating_duration_since(now)),
                    None => {
                        st.processing = false;
                        running.armed = false;
                        return;
                    }
                }
            };
            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
        }
    }
}

/// Clears `State::processing` if the processor exits without doing so
/// itself (panic or task cancellation), so the next waiter can start a new one.
struct ProcessingFlag<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(limiter = %self.shared.name, "rate limiter queue processor stopped unexpectedly");
            self.shared.lock().processing = false;
        }
    }
}

/// Queued, priority-ordered token-bucket rate limiter.
///
/// Cloning is cheap and clones share the same bucket and queue.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self::named("default", cfg)
    }

    pub fn named(name: impl Into<String>, cfg: RateLimiterConfig) -> Self {
        let bucket = TokenBucket::new(cfg.max_tokens, cfg.refill_rate);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                cfg,
                state: Mutex::new(State {
                    bucket,
                    queue: VecDeque::new(),
                    processing: false,
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.shared.cfg
    }

    /// Single non-blocking attempt; never queues.
    pub fn try_acquire(&self, tokens: f64) -> bool {
        self.shared.lock().bucket.try_consume(tokens)
    }

    /// Waits until `tokens` are granted or `opts.timeout` expires.
    ///
    /// Consumes immediately only when nobody is queued, so queued waiters are
    /// never overtaken. Returns `false` on timeout without consuming anything.
    pub async fn acquire(&self, tokens: f64, opts: AcquireOptions) -> bool {
        if opts.timeout.is_zero() {
            return self.try_acquire(tokens);
        }

        if !valid_request(tokens) {
            warn!(limiter = %self.shared.name, tokens, "invalid token request");
            return false;
        }

        let (id, mut rx) = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            if tokens > st.bucket.max_tokens() {
                warn!(
                    limiter = %self.shared.name,
                    tokens,
                    capacity = st.bucket.max_tokens(),
                    "request exceeds rate limiter capacity"
                );
                return false;
            }
            if st.queue.is_empty() && st.bucket.try_consume(tokens) {
                return true;
            }

            let (tx, rx) = oneshot::channel();
            let id = st.next_id;
            st.next_id += 1;
            let now = Instant::now();
            let waiter = QueuedRequest {
                id,
                tokens,
                priority: opts.priority,
                enqueued_at: now,
                deadline: now
                    .checked_add(opts.timeout)
                    .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600)),
                done: tx,
            };
            let pos = st
                .queue
                .iter()
                .position(|w| w.priority < opts.priority)
                .unwrap_or(st.queue.len());
            st.queue.insert(pos, waiter);

            if !st.processing {
                st.processing = true;
                tokio::spawn(Arc::clone(&self.shared).process_queue());
            }
            (id, rx)
        };

        match tokio::time::timeout(opts.timeout, &mut rx).await {
            Ok(Ok(granted)) => granted,
            Ok(Err(_)) => false,
            Err(_) => {
                let mut st = self.shared.lock();
                if let Some(pos) = st.queue.iter().position(|w| w.id == id) {
                    st.queue.remove(pos);
                    debug!(limiter = %self.shared.name, "rate limiter acquire timed out");
                    false
                } else {
                    // The processor settled this waiter while the timer fired.
                    drop(st);
                    rx.try_recv().unwrap_or(false)
                }
            }
        }
    }

    /// Acquires then runs `op`; fails with [`Error::RateLimited`] otherwise.
    pub async fn execute<T, F, Fut>(&self, op: F, tokens: f64, opts: AcquireOptions) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(tokens, opts).await {
            return Err(self.rate_limited(tokens));
        }
        op().await
    }

    /// Retries immediate consumption on an exponential schedule, then falls
    /// back to the queued [`acquire`](Self::acquire).
    pub async fn acquire_with_backoff(
        &self,
        tokens: f64,
        backoff: &BackoffOptions,
        opts: AcquireOptions,
    ) -> bool {
        let mut delay = backoff.initial_delay;
        for attempt in 0..backoff.max_attempts {
            if self.try_acquire(tokens) {
                return true;
            }
            if attempt + 1 < backoff.max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(backoff.multiplier.max(1.0)).min(backoff.max_delay);
            }
        }
        self.acquire(tokens, opts).await
    }

    pub async fn execute_with_backoff<T, F, Fut>(
        &self,
        op: F,
        tokens: f64,
        backoff: &BackoffOptions,
        opts: AcquireOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire_with_backoff(tokens, backoff, opts).await {
            return Err(self.rate_limited(tokens));
        }
        op().await
    }

    fn rate_limited(&self, tokens: f64) -> Error {
        let wait = self.shared.lock().bucket.wait_time(tokens);
        Error::RateLimited {
            scope: self.shared.name.clone(),
            retry_after_ms: wait.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut guard = self.shared.lock();
        let st = &mut *guard;
        let tokens = st.bucket.available();
        let wait = st.bucket.wait_time(1.0);
        RateLimiterSnapshot {
            name: self.shared.name.clone(),
            max_tokens: st.bucket.max_tokens(),
            refill_rate: st.bucket.refill_rate(),
            tokens,
            queued: st.queue.len(),
            estimated_wait_ms: (!wait.is_zero())
                .then(|| wait.as_millis().min(u64::MAX as u128) as u64),
        }
    }
}
