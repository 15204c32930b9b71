//! Benchmarks for the hot-path checks
//!
//! This benchmark measures:
//! - Token bucket consumption
//! - Circuit breaker admission and outcome recording
//! - Local fallback accounting under identifier churn
//! - Request key hashing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;
use throttle_shield::config::ShieldConfig;
use throttle_shield::resilience::dedup::DedupKey;
use throttle_shield::resilience::distributed::{DistributedRateLimiter, LocalRateCache, RouteLimit};
use throttle_shield::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, TokenBucket};

fn bench_token_bucket(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    c.bench_function("token_bucket_try_consume", |b| {
        let mut bucket = TokenBucket::new(1_000_000.0, 1_000_000.0);
        b.iter(|| black_box(bucket.try_consume(1.0)))
    });

    c.bench_function("rate_limiter_try_acquire", |b| {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new()
                .with_max_tokens(1_000_000)
                .with_refill_rate(1_000_000.0),
        );
        b.iter(|| black_box(limiter.try_acquire(1.0)))
    });
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    let breaker = CircuitBreaker::named(
        "bench",
        CircuitBreakerConfig::new()
            .with_failure_threshold(u32::MAX)
            .with_monitoring_window(Duration::from_secs(1)),
    );
    c.bench_function("circuit_breaker_success_path", |b| {
        b.iter(|| {
            if breaker.allow_request() {
                breaker.record_success();
            }
        })
    });

    c.bench_function("circuit_breaker_execute", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(breaker.execute(|| async { Ok::<_, throttle_shield::Error>(1u32) }).await)
        })
    });
}

fn bench_local_cache(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    let mut group = c.benchmark_group("local_rate_cache");
    let limit = RouteLimit::per_minute(1_000);
    for capacity in [1_000usize, 10_000] {
        let cache = LocalRateCache::new(capacity);
        let mut i = 0u64;
        group.bench_with_input(BenchmarkId::new("churn", capacity), &capacity, |b, _| {
            b.iter(|| {
                i = i.wrapping_add(1);
                black_box(cache.hit(&format!("user-{}", i % 50_000), &limit))
            })
        });
    }
    group.finish();

    let limiter = DistributedRateLimiter::local_only(&ShieldConfig::default());
    let limit = RouteLimit::per_minute(u64::MAX);
    c.bench_function("distributed_local_check", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(limiter.check_rate_limit("user-1", &limit, "read").await) })
    });
}

fn bench_dedup_key(c: &mut Criterion) {
    let body = r#"{"content":"hello","visibility":"public"}"#;
    c.bench_function("dedup_key_for_request", |b| {
        b.iter(|| {
            black_box(DedupKey::for_request(
                "POST",
                "/api/posts",
                Some(body),
                &[("content-type", "application/json"), ("x-user", "42")],
            ))
        })
    });
}

criterion_group!(
    benches,
    bench_token_bucket,
    bench_circuit_breaker,
    bench_local_cache,
    bench_dedup_key
);
criterion_main!(benches);
