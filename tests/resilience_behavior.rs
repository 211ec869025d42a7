//! Behavior-driven tests for the resilience primitives
//!
//! These tests verify HOW the rate limiter spaces upstream requests and HOW
//! the circuit breaker trips, cools down, and probes storage.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quotestream_core::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, ConfigError,
    ManualClock, RateLimitConfig, RateLimiter, StreamingMetrics,
};
use tokio::sync::oneshot;

fn breaker(threshold: u32, cooldown: Duration, clock: &ManualClock) -> CircuitBreaker {
    CircuitBreaker::new(
        "storage",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        },
    )
    .expect("valid breaker config")
    .with_clock(Arc::new(clock.clone()))
}

async fn fail(breaker: &CircuitBreaker) {
    let result = breaker
        .call(|| async { Err::<(), _>(String::from("storage down")) })
        .await;
    assert!(matches!(result, Err(CallError::Failed(_))));
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), CallError<String>> {
    breaker.call(|| async { Ok::<(), String>(()) }).await
}

// =============================================================================
// Rate Limiter: Token Bucket Spacing
// =============================================================================

#[tokio::test]
async fn when_bucket_is_drained_next_request_waits_one_refill_interval() {
    // Given: A bucket of 4 requests per 2 seconds (2 tokens per second)
    let clock = ManualClock::new();
    let limiter = RateLimiter::new(
        RateLimitConfig {
            max_requests: 4,
            period: Duration::from_secs(2),
        },
        Arc::new(clock.clone()),
    )
    .expect("valid limiter");
    let start = clock.now();

    // When: The full capacity is consumed
    for _ in 0..4 {
        limiter.acquire().await;
    }

    // Then: No time has passed yet
    assert_eq!(clock.now(), start);

    // When: One more request is made
    limiter.acquire().await;

    // Then: It waited roughly 1/rate = 500ms
    let waited = clock.now() - start;
    assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
    assert!(waited < Duration::from_millis(501), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn hourly_budget_refills_one_token_per_second_on_the_tokio_clock() {
    // Given: 3600 requests per hour on the system clock
    let limiter = RateLimiter::per_hour(3600).expect("valid limiter");
    while limiter.try_acquire() {}

    // When: Another request is made with time paused
    let before = tokio::time::Instant::now();
    limiter.acquire().await;

    // Then: The request was released after about a second
    let waited = before.elapsed();
    assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1010), "waited {waited:?}");
}

#[test]
fn when_capacity_is_zero_limiter_refuses_to_start() {
    // Given/When: A limiter with zero requests per hour
    let result = RateLimiter::per_hour(0);

    // Then: Construction fails with a config error
    assert_eq!(result.err(), Some(ConfigError::ZeroCapacity));
}

#[tokio::test]
async fn concurrent_callers_never_overspend_the_bucket() {
    // Given: A shared bucket of 2 tokens per 10 seconds
    let clock = ManualClock::new();
    let limiter = Arc::new(
        RateLimiter::new(
            RateLimitConfig {
                max_requests: 2,
                period: Duration::from_secs(10),
            },
            Arc::new(clock.clone()),
        )
        .expect("valid limiter"),
    );
    let start = clock.now();

    // When: Four callers race for tokens
    let mut handles = Vec::new();
    for _ in 0..4 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move { limiter.acquire().await }));
    }
    for handle in handles {
        handle.await.expect("acquire task");
    }

    // Then: The two extra requests each waited for a full refill (5s)
    assert!(clock.now() - start >= Duration::from_secs(10));
}

// =============================================================================
// Circuit Breaker: Tripping and Rejection
// =============================================================================

#[tokio::test]
async fn when_failures_reach_threshold_breaker_opens_and_rejects_without_calling() {
    // Given: A breaker that trips after 3 consecutive failures
    let clock = ManualClock::new();
    let breaker = breaker(3, Duration::from_secs(30), &clock);

    // When: Three calls fail
    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    fail(&breaker).await;

    // Then: The breaker is open
    assert_eq!(breaker.state(), CircuitState::Open);

    // And: The next call is rejected without running the operation
    let invoked = AtomicU32::new(0);
    let result = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await;
    match result {
        Err(CallError::Open(err)) => assert_eq!(err.name(), "storage"),
        other => panic!("expected open rejection, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_success_between_failures_resets_the_count() {
    // Given: A breaker with threshold 2
    let clock = ManualClock::new();
    let breaker = breaker(2, Duration::from_secs(30), &clock);

    // When: Failures are interleaved with a success
    fail(&breaker).await;
    succeed(&breaker).await.expect("closed breaker admits");
    fail(&breaker).await;

    // Then: The breaker never opened
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 1);
}

#[test]
fn zero_threshold_or_cooldown_is_a_config_error() {
    let zero_threshold = CircuitBreaker::new(
        "storage",
        CircuitBreakerConfig {
            failure_threshold: 0,
            cooldown: Duration::from_secs(60),
        },
    );
    assert_eq!(zero_threshold.err(), Some(ConfigError::InvalidFailureThreshold));

    let zero_cooldown = CircuitBreaker::new(
        "storage",
        CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::ZERO,
        },
    );
    assert_eq!(zero_cooldown.err(), Some(ConfigError::InvalidCooldown));
}

// =============================================================================
// Circuit Breaker: Cooldown and Half-Open Probing
// =============================================================================

#[tokio::test]
async fn after_cooldown_a_successful_probe_closes_the_breaker() {
    // Given: An open breaker with a 30s cooldown
    let clock = ManualClock::new();
    let breaker = breaker(1, Duration::from_secs(30), &clock);
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // When: The cooldown has not fully elapsed
    clock.advance(Duration::from_secs(29));

    // Then: Calls are still rejected
    assert!(matches!(succeed(&breaker).await, Err(CallError::Open(_))));

    // When: The cooldown elapses and a probe succeeds
    clock.advance(Duration::from_secs(1));
    succeed(&breaker).await.expect("probe admitted");

    // Then: The breaker is closed with a clean count
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[tokio::test]
async fn a_failed_probe_reopens_with_a_fresh_cooldown() {
    // Given: A breaker whose cooldown has elapsed
    let clock = ManualClock::new();
    let breaker = breaker(2, Duration::from_secs(30), &clock);
    fail(&breaker).await;
    fail(&breaker).await;
    clock.advance(Duration::from_secs(30));

    // When: The probe fails
    fail(&breaker).await;

    // Then: The breaker is open again, without needing `threshold` failures
    assert_eq!(breaker.state(), CircuitState::Open);

    // And: The cooldown restarts from the probe failure
    clock.advance(Duration::from_secs(29));
    assert!(matches!(succeed(&breaker).await, Err(CallError::Open(_))));
    clock.advance(Duration::from_secs(1));
    succeed(&breaker).await.expect("second probe admitted");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn only_one_probe_is_admitted_while_half_open() {
    // Given: A breaker past its cooldown
    let clock = ManualClock::new();
    let breaker = Arc::new(breaker(1, Duration::from_secs(10), &clock));
    fail(&breaker).await;
    clock.advance(Duration::from_secs(10));

    // When: A slow probe is in flight
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let probe = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<(), String>(())
                })
                .await
        })
    };
    started_rx.await.expect("probe started");
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Then: A concurrent call is rejected
    assert!(matches!(succeed(&breaker).await, Err(CallError::Open(_))));

    // When: The probe completes successfully
    release_tx.send(()).expect("probe waiting");
    probe.await.expect("probe task").expect("probe succeeded");

    // Then: The breaker is closed and admits calls again
    assert_eq!(breaker.state(), CircuitState::Closed);
    succeed(&breaker).await.expect("closed breaker admits");
}

#[tokio::test]
async fn a_late_success_from_before_the_trip_does_not_close_the_breaker() {
    // Given: A threshold-1 breaker with a slow call admitted while closed
    let clock = ManualClock::new();
    let breaker = Arc::new(breaker(1, Duration::from_secs(30), &clock));
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let slow = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<(), String>(())
                })
                .await
        })
    };
    started_rx.await.expect("slow call started");

    // When: Another call fails and trips the breaker
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // And: The slow call then succeeds
    release_tx.send(()).expect("slow call waiting");
    slow.await.expect("slow task").expect("admitted while closed");

    // Then: The breaker stays open and keeps rejecting until the cooldown
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(matches!(succeed(&breaker).await, Err(CallError::Open(_))));
    clock.advance(Duration::from_secs(30));
    succeed(&breaker).await.expect("cooldown call admitted");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn breaker_state_and_rejections_are_exported_as_metrics() {
    // Given: A breaker wired to metrics
    let clock = ManualClock::new();
    let metrics = Arc::new(StreamingMetrics::new().expect("metrics"));
    let breaker = breaker(1, Duration::from_secs(60), &clock).with_metrics(Arc::clone(&metrics));
    assert_eq!(metrics.snapshot().circuit_breaker_state, 0);

    // When: It opens and rejects a call
    fail(&breaker).await;
    let _ = succeed(&breaker).await;

    // Then: The gauge reads open and the rejection is counted
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.circuit_breaker_state, 1);
    assert_eq!(snapshot.breaker_rejections_total, 1);

    // When: The cooldown elapses and the probe succeeds
    clock.advance(Duration::from_secs(60));
    succeed(&breaker).await.expect("probe admitted");

    // Then: The gauge is back to closed
    assert_eq!(metrics.snapshot().circuit_breaker_state, 0);
}
