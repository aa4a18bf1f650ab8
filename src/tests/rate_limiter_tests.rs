// src/tests/rate_limiter_tests.rs

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

use crate::cache_stats::StatsSource;
use crate::clock::ManualClock;
use crate::config::InMemoryConfig;
use crate::error::{RateLimiterError, StorageError};
use crate::intercept::{RateLimit, RateLimitGuard};
use crate::limiter::ApiRateLimiter;
use crate::resilience::StorageFailurePolicy;
use crate::test_utils::{create_test_limiter, test_limiter_config, MockStorage, T0};

#[tokio::test]
async fn test_capacity_bound() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());

    for i in 0..3 {
        assert!(limiter.try_consume("burst").await.unwrap(), "call {} should pass", i);
    }
    assert!(!limiter.try_consume("burst").await.unwrap());
}

#[tokio::test]
async fn test_interval_refill() {
    let (limiter, _, clock) = create_test_limiter(&test_limiter_config());

    for _ in 0..3 {
        limiter.try_consume("refill").await.unwrap();
    }
    clock.advance(Duration::from_secs(5));

    for _ in 0..3 {
        assert!(limiter.try_consume("refill").await.unwrap());
    }
    assert!(!limiter.try_consume("refill").await.unwrap());
}

#[tokio::test]
async fn test_no_refill_one_ms_early() {
    let (limiter, _, clock) = create_test_limiter(&test_limiter_config());

    for _ in 0..3 {
        limiter.try_consume("early").await.unwrap();
    }
    clock.advance(Duration::from_millis(4999));
    assert!(!limiter.try_consume("early").await.unwrap());

    clock.advance(Duration::from_millis(1));
    assert!(limiter.try_consume("early").await.unwrap());
}

#[tokio::test]
async fn test_documented_scenario() {
    let (limiter, _, clock) = create_test_limiter(&test_limiter_config());

    let mut at_zero = Vec::new();
    for _ in 0..4 {
        at_zero.push(limiter.try_consume("k1").await.unwrap());
    }
    assert_eq!(at_zero, vec![true, true, true, false]);

    clock.advance(Duration::from_secs(6));
    assert!(limiter.try_consume("k1").await.unwrap());

    let mut at_six = Vec::new();
    for _ in 0..3 {
        at_six.push(limiter.try_consume("k1").await.unwrap());
    }
    assert_eq!(at_six, vec![true, true, false]);
}

#[tokio::test]
async fn test_key_isolation() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());

    for _ in 0..4 {
        limiter.try_consume("A").await.unwrap();
    }
    assert!(!limiter.try_consume("A").await.unwrap());
    assert_eq!(limiter.available_tokens("B").await.unwrap(), 3);
    assert!(limiter.try_consume("B").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_overdraw() {
    let (limiter, storage, _) = create_test_limiter(&test_limiter_config());
    let barrier = Arc::new(Barrier::new(20));

    let calls = (0..20).map(|_| {
        let limiter = Arc::clone(&limiter);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            limiter.try_consume("contended").await.unwrap()
        })
    });
    let allowed = join_all(calls)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();

    assert_eq!(allowed, 3);
    assert_eq!(storage.insert_calls(), 1);
    assert_eq!(storage.update_calls(), 20);
}

#[tokio::test]
async fn test_check_reports_probe() {
    let (limiter, _, clock) = create_test_limiter(&test_limiter_config());

    let probe = limiter.check("probe").await.unwrap();
    assert!(probe.consumed);
    assert_eq!(probe.remaining_tokens, 2);

    limiter.check("probe").await.unwrap();
    limiter.check("probe").await.unwrap();
    clock.advance(Duration::from_secs(2));

    let probe = limiter.check("probe").await.unwrap();
    assert!(!probe.consumed);
    assert_eq!(probe.wait_for_refill, Duration::from_secs(3));
}

#[tokio::test]
async fn test_reset_restores_capacity() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());

    for _ in 0..3 {
        limiter.try_consume("reset").await.unwrap();
    }
    limiter.reset("reset").await.unwrap();
    assert_eq!(limiter.available_tokens("reset").await.unwrap(), 3);
}

#[tokio::test]
async fn test_storage_error_propagates_by_default() {
    let (limiter, storage, _) = create_test_limiter(&test_limiter_config());
    storage.set_failing(true);

    let result = limiter.try_consume("down").await;
    assert!(matches!(
        result,
        Err(RateLimiterError::Storage(StorageError::RedisConnection(_)))
    ));
    assert_eq!(limiter.failure_policy(), StorageFailurePolicy::Propagate);
}

#[tokio::test]
async fn test_fail_open_and_fail_closed() {
    let mut config = test_limiter_config();

    config.on_storage_error = StorageFailurePolicy::FailOpen;
    let (open, open_storage, _) = create_test_limiter(&config);
    open_storage.set_failing(true);
    assert!(open.try_consume("down").await.unwrap());

    config.on_storage_error = StorageFailurePolicy::FailClosed;
    let (closed, closed_storage, _) = create_test_limiter(&config);
    closed_storage.set_failing(true);
    let probe = closed.check("down").await.unwrap();
    assert!(!probe.consumed);
    assert_eq!(probe.wait_for_refill, Duration::from_secs(5));

    // Recovery goes back to real buckets
    closed_storage.set_failing(false);
    assert!(closed.try_consume("down").await.unwrap());
}

#[tokio::test]
async fn test_guard_skips_operation_when_rejected() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());
    let guard = RateLimitGuard::new(limiter);
    let limit = RateLimit::new("guarded");
    let for_real = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = Arc::clone(&for_real);
        let result: Result<&str, RateLimiterError> = guard
            .around(&limit, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            })
            .await;
        assert_ok!(result);
    }
    assert_eq!(for_real.load(Ordering::SeqCst), 3);

    let rejected_body_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&rejected_body_runs);
    let result: Result<&str, RateLimiterError> = guard
        .around(&limit, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("done")
        })
        .await;

    let err = assert_err!(result);
    assert_eq!(rejected_body_runs.load(Ordering::SeqCst), 0);
    match err {
        RateLimiterError::LimitExceeded { key, retry_after } => {
            assert_eq!(key, "guarded");
            assert_eq!(retry_after, Duration::from_secs(5));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_guard_passes_operation_errors_through() {
    #[derive(Debug)]
    enum AppError {
        Limited(RateLimiterError),
        NotFound,
    }

    impl From<RateLimiterError> for AppError {
        fn from(err: RateLimiterError) -> Self {
            AppError::Limited(err)
        }
    }

    let (limiter, _, _) = create_test_limiter(&test_limiter_config());
    let guard = RateLimitGuard::new(limiter);
    let limit = RateLimit::new("lookup");

    let result: Result<(), AppError> = guard
        .around(&limit, || async { Err(AppError::NotFound) })
        .await;
    assert!(matches!(result, Err(AppError::NotFound)));

    // The failed call still consumed its token
    for _ in 0..2 {
        let ok: Result<(), AppError> = guard.around(&limit, || async { Ok(()) }).await;
        assert!(ok.is_ok());
    }
    let limited: Result<(), AppError> = guard.around(&limit, || async { Ok(()) }).await;
    assert!(matches!(
        limited,
        Err(AppError::Limited(RateLimiterError::LimitExceeded { .. }))
    ));
}

#[tokio::test]
async fn test_wrapped_operation_shares_one_bucket() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());
    let guard = RateLimitGuard::new(limiter);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let double = guard.wrap(RateLimit::new("double"), move |n: u32| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<u32, RateLimiterError>(n * 2)
        }
    });
    assert_eq!(double.rate_limit().key(), "double");

    let mut results = Vec::new();
    for n in 1..=5 {
        results.push(double.call(n).await.ok());
    }
    assert_eq!(results, vec![Some(2), Some(4), Some(6), None, None]);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_scoped_limits_get_their_own_buckets() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());
    let guard = RateLimitGuard::new(Arc::clone(&limiter));
    let base = RateLimit::new("search");

    let alice = base.scoped("alice");
    let bob = base.scoped("bob");
    assert_eq!(alice.key(), "search:alice");

    for _ in 0..3 {
        let _: Result<(), RateLimiterError> = guard.around(&alice, || async { Ok(()) }).await;
    }
    let alice_again: Result<(), RateLimiterError> = guard.around(&alice, || async { Ok(()) }).await;
    assert!(alice_again.is_err());

    let bob_first: Result<(), RateLimiterError> = guard.around(&bob, || async { Ok(()) }).await;
    assert!(bob_first.is_ok());
    assert_eq!(limiter.available_tokens("search").await.unwrap(), 3);
}

#[traced_test]
#[tokio::test]
async fn test_checks_are_logged() {
    let (limiter, _, _) = create_test_limiter(&test_limiter_config());

    limiter.try_consume("logged").await.unwrap();

    assert!(logs_contain("Rate limit check"));
    assert!(logs_contain("key=\"logged\""));
    assert!(logs_contain("remaining=2"));
}

#[traced_test]
#[tokio::test]
async fn test_fallback_is_logged_as_warning() {
    let mut config = test_limiter_config();
    config.on_storage_error = StorageFailurePolicy::FailOpen;
    let (limiter, storage, _) = create_test_limiter(&config);
    storage.set_failing(true);

    limiter.try_consume("down").await.unwrap();

    assert!(logs_contain("applying storage failure policy"));
}

#[tokio::test]
async fn test_available_tokens_creates_nothing() {
    let (limiter, storage, _) = create_test_limiter(&test_limiter_config());

    assert_eq!(limiter.available_tokens("never-called").await.unwrap(), 3);

    assert_eq!(storage.insert_calls(), 0);
    assert!(storage.rows().is_empty());
    assert!(limiter.proxies().is_empty());
    assert_eq!(limiter.proxies().slot_count(), 0);
}

#[tokio::test]
async fn test_scoped_clients_reuse_rows_of_refilled_buckets() {
    let storage = MockStorage::with_config(InMemoryConfig {
        max_entries: 2,
        ..InMemoryConfig::default()
    });
    let clock = Arc::new(ManualClock::new(T0));
    let limiter =
        ApiRateLimiter::with_clock(storage.clone(), &test_limiter_config(), clock.clone()).unwrap();
    let guard = RateLimitGuard::new(Arc::new(limiter));
    let api = RateLimit::new("api");

    async fn call(
        guard: &RateLimitGuard<MockStorage>,
        limit: &RateLimit,
    ) -> Result<(), RateLimiterError> {
        guard.around(limit, || async { Ok(()) }).await
    }

    assert_ok!(call(&guard, &api.scoped(0)).await);
    assert_ok!(call(&guard, &api.scoped(1)).await);

    // Both rows still owe a token: nothing can be reclaimed yet
    let full = assert_err!(call(&guard, &api.scoped(2)).await);
    assert!(matches!(
        full,
        RateLimiterError::Storage(StorageError::TableFull(2))
    ));

    clock.advance(Duration::from_secs(5));
    assert_ok!(call(&guard, &api.scoped(2)).await);
    assert_ok!(call(&guard, &api.scoped(3)).await);
    assert_eq!(storage.rows().len(), 2);

    let limiter = guard.limiter();
    assert_eq!(limiter.proxies().stats().eviction_count, 2);
    assert!(!limiter.proxies().contains("api:0"));
    assert!(limiter.proxies().contains("api:3"));

    // Failed lookups leave no slot behind
    assert_err!(call(&guard, &api.scoped(99)).await);
    assert_eq!(limiter.proxies().slot_count(), 2);

    clock.advance(Duration::from_secs(5));
    assert_ok!(call(&guard, &api.scoped(99)).await);
}

#[tokio::test]
async fn test_evict_idle_keeps_buckets_that_owe_tokens() {
    let (limiter, storage, clock) = create_test_limiter(&test_limiter_config());

    limiter.try_consume("busy").await.unwrap();
    limiter.try_consume("idle").await.unwrap();
    clock.advance(Duration::from_secs(5));
    limiter.try_consume("busy").await.unwrap();

    assert_eq!(limiter.evict_idle().await.unwrap(), 1);
    assert!(limiter.proxies().contains("busy"));
    assert!(!limiter.proxies().contains("idle"));
    assert_eq!(storage.rows().len(), 1);
    assert_eq!(limiter.available_tokens("busy").await.unwrap(), 2);

    // A reclaimed key starts over from a full bucket
    let probe = limiter.check("idle").await.unwrap();
    assert!(probe.consumed);
    assert_eq!(probe.remaining_tokens, 2);
}
