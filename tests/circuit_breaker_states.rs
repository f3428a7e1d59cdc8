mod common;

use common::{counter, engine_with_clock, TestError};
use futures::future::join_all;
use safeguard::config::{CircuitBreakerConfig, PolicyConfig, RetryConfig, TimeoutConfig};
use safeguard::{
    CircuitState, InMemoryMetrics, InvocationContext, ManualClock, MethodKey, Safeguard, TimeoutScope,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker_policies() -> PolicyConfig {
    PolicyConfig::new().with_circuit_breaker(
        CircuitBreakerConfig::default()
            .request_volume_threshold(4)
            .failure_ratio(0.5)
            .delay(Duration::from_secs(1)),
    )
}

async fn fail(engine: &Safeguard, key: &MethodKey, calls: &Arc<AtomicUsize>) {
    let calls = calls.clone();
    let _ = engine
        .execute(InvocationContext::new(key.clone(), move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError("down")) }
        }))
        .await;
}

#[tokio::test]
async fn opens_on_failure_ratio_and_rejects_without_invoking() {
    let key = MethodKey::new("payments", "authorize");
    let metrics = InMemoryMetrics::new();
    let clock = ManualClock::new();
    let engine = engine_with_clock(&key, breaker_policies(), &metrics, &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        fail(&engine, &key, &calls).await;
    }
    assert_eq!(
        engine.circuit_breaker(&key).unwrap().state(),
        CircuitState::Closed,
        "no decision before the window fills"
    );
    fail(&engine, &key, &calls).await;
    assert_eq!(engine.circuit_breaker(&key).unwrap().state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let calls_clone = calls.clone();
    let err = engine
        .execute(InvocationContext::new(key.clone(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(()) }
        }))
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 4, "an open breaker must not invoke the method");
    assert_eq!(counter(&metrics, &key, "circuitbreaker.callsPrevented.total"), 1);
    assert_eq!(counter(&metrics, &key, "circuitbreaker.callsFailed.total"), 4);
    assert_eq!(counter(&metrics, &key, "circuitbreaker.opened.total"), 1);
}

#[tokio::test(start_paused = true)]
async fn exactly_one_half_open_trial_among_racers() {
    let key = MethodKey::new("payments", "capture");
    let metrics = InMemoryMetrics::new();
    let clock = ManualClock::new();
    let engine = engine_with_clock(&key, breaker_policies(), &metrics, &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        fail(&engine, &key, &calls).await;
    }
    assert_eq!(engine.circuit_breaker(&key).unwrap().state(), CircuitState::Open);
    clock.advance(Duration::from_secs(1));
    calls.store(0, Ordering::SeqCst);

    let racers = (0..8).map(|_| {
        let calls = calls.clone();
        engine.execute(InvocationContext::new(key.clone(), move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, TestError>("trial")
            }
        }))
    });
    let results = join_all(racers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one racer runs the trial");
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| e.is_circuit_open()));
    assert_eq!(engine.circuit_breaker(&key).unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn failed_trial_reopens_for_another_delay() {
    let key = MethodKey::new("payments", "refund");
    let metrics = InMemoryMetrics::new();
    let clock = ManualClock::new();
    let engine = engine_with_clock(&key, breaker_policies(), &metrics, &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        fail(&engine, &key, &calls).await;
    }
    clock.advance(Duration::from_secs(1));
    fail(&engine, &key, &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5, "the trial ran");
    assert_eq!(engine.circuit_breaker(&key).unwrap().state(), CircuitState::Open);

    clock.advance(Duration::from_millis(500));
    fail(&engine, &key, &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5, "still inside the new open delay");
    assert_eq!(counter(&metrics, &key, "circuitbreaker.opened.total"), 2);
}

#[tokio::test]
async fn breaker_state_is_shared_across_result_types() {
    let key = MethodKey::new("payments", "status");
    let metrics = InMemoryMetrics::new();
    let clock = ManualClock::new();
    let engine = engine_with_clock(&key, breaker_policies(), &metrics, &clock);

    for _ in 0..4 {
        let _ = engine
            .execute(InvocationContext::new(key.clone(), || async { Err::<u8, _>(TestError("down")) }))
            .await;
    }
    let err = engine
        .execute(InvocationContext::new(key.clone(), || async { Ok::<String, TestError>("up".into()) }))
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
}

#[tokio::test(start_paused = true)]
async fn whole_budget_timeouts_open_the_breaker() {
    let key = MethodKey::new("ledger", "settle");
    let metrics = InMemoryMetrics::new();
    let clock = ManualClock::new();
    let policies = PolicyConfig::new()
        .with_timeout(TimeoutConfig::new(Duration::from_millis(50)))
        .with_retry(RetryConfig::default().max_retries(3).jitter(Duration::ZERO))
        .timeout_scope(TimeoutScope::WholeBudget)
        .with_circuit_breaker(
            CircuitBreakerConfig::default().request_volume_threshold(1).failure_ratio(1.0),
        );
    let engine = engine_with_clock(&key, policies, &metrics, &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    let (c, method) = (calls.clone(), key.clone());
    let hung = move || {
        let c = c.clone();
        InvocationContext::new(method.clone(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, TestError>(())
            }
        })
    };

    assert!(engine.execute(hung()).await.unwrap_err().is_timeout());
    assert_eq!(engine.circuit_breaker(&key).unwrap().state(), CircuitState::Open);

    assert!(engine.execute(hung()).await.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(counter(&metrics, &key, "circuitbreaker.callsFailed.total"), 1);
}
