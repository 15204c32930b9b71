//! Distributed limiter against a mocked shared store.

use mockito::{Matcher, Server};
use std::time::Duration;
use throttle_shield::config::{ShieldConfig, StoreConfig};
use throttle_shield::resilience::distributed::{
    DistributedRateLimiter, LimitSource, RateLimitType, RouteLimit,
};

fn config_for(url: &str, cooldown_ms: u64) -> ShieldConfig {
    ShieldConfig {
        store: StoreConfig {
            recovery_cooldown_ms: cooldown_ms,
            ..StoreConfig::default().with_endpoint(url, "test-token")
        },
        ..ShieldConfig::default()
    }
}

fn reset_at() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
        + 60_000
}

#[tokio::test]
async fn test_shared_store_decision_is_used() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer test-token")
        .match_body(Matcher::Regex(r#"^\["EVAL",.*"ratelimit:write:user-1""#.to_string()))
        .with_status(200)
        .with_body(format!(r#"{{"result":[1,3,{}]}}"#, reset_at()))
        .expect(1)
        .create_async()
        .await;

    let limiter = DistributedRateLimiter::new(&config_for(&server.url(), 300_000)).unwrap();
    let outcome = limiter.check("user-1", RateLimitType::Write).await;

    assert!(outcome.success);
    assert_eq!(outcome.source, LimitSource::Shared);
    assert_eq!(outcome.remaining, 27);
    assert!(limiter.is_store_available());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_denial_from_store_carries_reset() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body(format!(r#"{{"result":[0,10,{}]}}"#, reset_at()))
        .create_async()
        .await;

    let limiter = DistributedRateLimiter::new(&config_for(&server.url(), 300_000)).unwrap();
    let outcome = limiter.check("user-2", RateLimitType::Posts).await;

    assert!(!outcome.success);
    assert_eq!(outcome.remaining, 0);
    assert!(outcome.retry_after() > Duration::from_secs(50));
    let err = outcome.into_result("posts").unwrap_err();
    assert!(err.retry_after().is_some());
}

#[tokio::test]
async fn test_store_failure_falls_back_and_stops_calling_store() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_body(r#"{"error":"ERR internal"}"#)
        .expect(1)
        .create_async()
        .await;

    let limiter = DistributedRateLimiter::new(&config_for(&server.url(), 300_000)).unwrap();
    let limit = RouteLimit::per_minute(3);

    let outcomes = [
        limiter.check_rate_limit("user-3", &limit, "write").await,
        limiter.check_rate_limit("user-3", &limit, "write").await,
        limiter.check_rate_limit("user-3", &limit, "write").await,
        limiter.check_rate_limit("user-3", &limit, "write").await,
    ];

    assert!(outcomes.iter().all(|o| o.source == LimitSource::Local));
    assert_eq!(
        outcomes.iter().map(|o| o.success).collect::<Vec<_>>(),
        vec![true, true, true, false]
    );
    assert!(!limiter.is_store_available());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_store_recovers_after_cooldown() {
    let mut server = Server::new_async().await;
    let down = server
        .mock("POST", "/")
        .with_status(503)
        .with_body(r#"{"error":"unavailable"}"#)
        .expect(1)
        .create_async()
        .await;

    let limiter = DistributedRateLimiter::new(&config_for(&server.url(), 200)).unwrap();
    let first = limiter.check("user-4", RateLimitType::Read).await;
    assert_eq!(first.source, LimitSource::Local);
    down.assert_async().await;
    down.remove_async().await;

    let up = server
        .mock("POST", "/")
        .with_status(200)
        .with_body(format!(r#"{{"result":[1,1,{}]}}"#, reset_at()))
        .expect(1)
        .create_async()
        .await;

    // Still cooling off: served locally without touching the store.
    let during = limiter.check("user-4", RateLimitType::Read).await;
    assert_eq!(during.source, LimitSource::Local);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let after = limiter.check("user-4", RateLimitType::Read).await;
    assert_eq!(after.source, LimitSource::Shared);
    assert!(limiter.is_store_available());
    up.assert_async().await;
}

#[tokio::test]
async fn test_strict_route_denied_when_store_down() {
    let mut config = config_for("http://127.0.0.1:9", 300_000);
    config.store.timeout_ms = 500;
    // Auth is strict without any override.
    let limiter = DistributedRateLimiter::new(&config).unwrap();

    let auth = limiter.check("user-5", RateLimitType::Auth).await;
    assert!(!auth.success);
    assert_eq!(auth.source, LimitSource::StoreUnavailable);

    // Non-strict routes keep working locally.
    let read = limiter.check("user-5", RateLimitType::Read).await;
    assert!(read.success);
    assert_eq!(read.source, LimitSource::Local);
}

#[tokio::test]
async fn test_unconfigured_store_runs_locally() {
    let limiter = DistributedRateLimiter::new(&ShieldConfig::default()).unwrap();
    assert!(!limiter.status().configured);

    for _ in 0..20 {
        assert!(limiter.check("user-6", RateLimitType::Auth).await.success);
    }
    let denied = limiter.check("user-6", RateLimitType::Auth).await;
    assert!(!denied.success);
    assert_eq!(denied.source, LimitSource::Local);
}
