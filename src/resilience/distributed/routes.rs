use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Rate limit category. Broad categories cover request classes, narrow ones
/// cover individual features; each is enforced independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitType {
    Read,
    Write,
    Auth,
    Realtime,
    Posts,
    Comments,
    Reactions,
    Follows,
    Uploads,
}

impl RateLimitType {
    pub const ALL: [RateLimitType; 9] = [
        RateLimitType::Read,
        RateLimitType::Write,
        RateLimitType::Auth,
        RateLimitType::Realtime,
        RateLimitType::Posts,
        RateLimitType::Comments,
        RateLimitType::Reactions,
        RateLimitType::Follows,
        RateLimitType::Uploads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitType::Read => "read",
            RateLimitType::Write => "write",
            RateLimitType::Auth => "auth",
            RateLimitType::Realtime => "realtime",
            RateLimitType::Posts => "posts",
            RateLimitType::Comments => "comments",
            RateLimitType::Reactions => "reactions",
            RateLimitType::Follows => "follows",
            RateLimitType::Uploads => "uploads",
        }
    }
}

impl fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit+window pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimit {
    pub limit: u64,
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,
    /// Deny instead of falling back to local accounting while the shared
    /// store is unavailable.
    #[serde(default)]
    pub strict: bool,
}

impl RouteLimit {
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            strict: false,
        }
    }

    pub const fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub const fn per_hour(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    pub const fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Per-route limit table.
///
/// Auth is strict by default: a login limit that each instance counts on its
/// own multiplies an attacker's budget by the instance count. Strictness only
/// bites when a configured store is down, so local-only deployments still
/// serve auth from the local cache.
#[derive(Debug, Clone)]
pub struct RouteLimitTable {
    limits: HashMap<RateLimitType, RouteLimit>,
}

impl Default for RouteLimitTable {
    fn default() -> Self {
        let limits = HashMap::from([
            (RateLimitType::Read, RouteLimit::per_minute(200)),
            (RateLimitType::Write, RouteLimit::per_minute(30)),
            (RateLimitType::Auth, RouteLimit::per_minute(20).strict()),
            (RateLimitType::Realtime, RouteLimit::per_minute(60)),
            (RateLimitType::Posts, RouteLimit::per_hour(10)),
            (RateLimitType::Comments, RouteLimit::per_hour(30)),
            (RateLimitType::Reactions, RouteLimit::per_hour(120)),
            (RateLimitType::Follows, RouteLimit::per_hour(50)),
            (RateLimitType::Uploads, RouteLimit::per_hour(20)),
        ]);
        Self { limits }
    }
}

impl RouteLimitTable {
    pub fn with_overrides(mut self, overrides: &HashMap<RateLimitType, RouteLimit>) -> Self {
        self.limits
            .extend(overrides.iter().map(|(kind, limit)| (*kind, *limit)));
        self
    }

    pub fn get(&self, kind: RateLimitType) -> RouteLimit {
        self.limits
            .get(&kind)
            .copied()
            .unwrap_or_else(|| RouteLimit::per_minute(60))
    }

    pub fn set(&mut self, kind: RateLimitType, limit: RouteLimit) {
        self.limits.insert(kind, limit);
    }

    /// Entries in category order.
    pub fn entries(&self) -> Vec<(RateLimitType, RouteLimit)> {
        RateLimitType::ALL
            .iter()
            .map(|kind| (*kind, self.get(*kind)))
            .collect()
    }
}
