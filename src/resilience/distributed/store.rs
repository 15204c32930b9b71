//! Shared rate store access.

use super::routes::RouteLimit;
use crate::config::StoreConfig;
use crate::transport::{RestCommandClient, TransportError};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of counting one request against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDecision {
    pub allowed: bool,
    /// Requests counted in the current window, including this one if allowed.
    pub count: u64,
    /// Wall-clock time (epoch ms) at which the window frees up.
    pub reset_at_ms: u64,
}

/// Authoritative, cross-instance rate accounting.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Records one request for `key` if it fits in `limit`.
    async fn hit(
        &self,
        key: &str,
        limit: &RouteLimit,
    ) -> std::result::Result<StoreDecision, TransportError>;

    fn name(&self) -> &'static str;
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sliding-window log kept in a sorted set, timestamped by the store's own
/// clock so that instances with skewed clocks agree.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local member = ARGV[3]

local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

redis.call("ZREMRANGEBYSCORE", key, "-inf", now_ms - window_ms)
local count = redis.call("ZCARD", key)
local allowed = 0

if count < limit then
    redis.call("ZADD", key, now_ms, member)
    count = count + 1
    allowed = 1
end

redis.call("PEXPIRE", key, window_ms)

local reset_ms = now_ms + window_ms
local oldest = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")
if #oldest > 0 then
    reset_ms = tonumber(oldest[2]) + window_ms
end

return {allowed, count, reset_ms}
"#;

/// [`RateStore`] over a Redis-compatible REST endpoint.
pub struct UpstashRestStore {
    client: RestCommandClient,
    prefix: String,
}

impl UpstashRestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            client: RestCommandClient::new(config)?,
            prefix: config.key_prefix.clone(),
        })
    }

    fn parse_reply(reply: &Value) -> std::result::Result<StoreDecision, TransportError> {
        let fields = reply
            .as_array()
            .filter(|a| a.len() == 3)
            .ok_or_else(|| TransportError::Decode(format!("sliding window reply: {}", reply)))?;
        let int = |v: &Value| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| TransportError::Decode(format!("expected integer, got {}", v)))
        };
        Ok(StoreDecision {
            allowed: int(&fields[0])? == 1,
            count: int(&fields[1])?,
            reset_at_ms: int(&fields[2])?,
        })
    }
}

#[async_trait]
impl RateStore for UpstashRestStore {
    async fn hit(
        &self,
        key: &str,
        limit: &RouteLimit,
    ) -> std::result::Result<StoreDecision, TransportError> {
        let member = format!("{}-{:016x}", epoch_ms(), rand::random::<u64>());
        let reply = self
            .client
            .eval(
                SLIDING_WINDOW_SCRIPT,
                &[format!("{}:{}", self.prefix, key)],
                &[
                    limit.limit.to_string(),
                    (limit.window.as_millis() as u64).to_string(),
                    member,
                ],
            )
            .await?;
        Self::parse_reply(&reply)
    }

    fn name(&self) -> &'static str {
        "upstash-rest"
    }
}
