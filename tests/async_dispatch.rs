mod common;

use common::{counter, engine, TestError};
use safeguard::config::{CircuitBreakerConfig, PolicyConfig, RetryConfig, TimeoutConfig};
use safeguard::{
    DedicatedExecutor, FallbackContext, FallbackPolicy, InMemoryMetrics, InstantSleeper, InvocationContext, MethodKey,
    Safeguard, StaticPolicyResolver,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[tokio::test]
async fn dispatch_returns_before_the_work_runs() {
    let key = MethodKey::new("mailer", "send");
    let metrics = InMemoryMetrics::new();
    let engine = engine(&key, PolicyConfig::new(), &metrics);
    let gate = Arc::new(Semaphore::new(0));

    let waiting = gate.clone();
    let handle = engine.dispatch(InvocationContext::new(key.clone(), move || {
        let waiting = waiting.clone();
        async move {
            let _ = waiting.acquire().await;
            Ok::<_, TestError>("sent")
        }
    }));

    gate.add_permits(1);
    assert_eq!(handle.await.unwrap(), "sent");
    assert_eq!(counter(&metrics, &key, "invocations.total"), 1);
}

#[tokio::test]
async fn dispatched_failures_use_the_same_taxonomy() {
    let key = MethodKey::new("mailer", "bounce");
    let metrics = InMemoryMetrics::new();
    let policies = PolicyConfig::new()
        .with_retry(RetryConfig::default().max_retries(2).jitter(Duration::ZERO))
        .asynchronous();
    let engine = engine(&key, policies, &metrics);

    let err = engine
        .execute(InvocationContext::new(key.clone(), || async { Err::<(), _>(TestError("bounced")) }))
        .await
        .unwrap_err();
    assert!(err.is_retries_exhausted());
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(counter(&metrics, &key, "invocations.failed.total"), 1);
}

#[tokio::test(start_paused = true)]
async fn dispatched_timeout_surfaces_through_the_handle() {
    let key = MethodKey::new("mailer", "slow");
    let metrics = InMemoryMetrics::new();
    let policies = PolicyConfig::new().with_timeout(TimeoutConfig::new(Duration::from_millis(20)));
    let engine = engine(&key, policies, &metrics);

    let err = engine
        .dispatch(InvocationContext::new(key.clone(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TestError>(())
        }))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn dispatched_open_breaker_rejects_through_the_handle() {
    let key = MethodKey::new("mailer", "relay");
    let metrics = InMemoryMetrics::new();
    let policies = PolicyConfig::new()
        .with_circuit_breaker(CircuitBreakerConfig::default().request_volume_threshold(1))
        .asynchronous();
    let engine = engine(&key, policies, &metrics);

    let first = engine
        .execute(InvocationContext::new(key.clone(), || async { Err::<(), _>(TestError("refused")) }))
        .await
        .unwrap_err();
    assert_eq!(first.into_inner(), Some(TestError("refused")));

    let second = engine
        .execute(InvocationContext::new(key.clone(), || async { Ok::<_, TestError>(()) }))
        .await
        .unwrap_err();
    assert!(second.is_circuit_open());
}

#[tokio::test]
async fn fallback_runs_inside_the_dispatched_task() {
    let key = MethodKey::new("mailer", "digest");
    let metrics = InMemoryMetrics::new();
    let engine = engine(&key, PolicyConfig::new().asynchronous(), &metrics);
    let plan = engine
        .plan::<String, TestError>(&key)
        .unwrap()
        .with_fallback(FallbackPolicy::from_fn(|ctx: FallbackContext<TestError>| async move {
            let user = ctx.arguments::<u32>().copied().unwrap_or_default();
            Ok(format!("queued digest for {user}"))
        }));

    let value = plan
        .dispatch(
            InvocationContext::new(key.clone(), || async { Err(TestError("smtp down")) })
                .with_arguments(7u32),
        )
        .await
        .unwrap();
    assert_eq!(value, "queued digest for 7");
    assert_eq!(counter(&metrics, &key, "fallback.calls.total"), 1);
    assert_eq!(counter(&metrics, &key, "invocations.failed.total"), 0);
}

#[test]
fn dedicated_executor_runs_dispatched_calls_off_the_caller_runtime() {
    let key = MethodKey::new("mailer", "archive");
    let executor = DedicatedExecutor::new(2).expect("runtime");
    let engine = Safeguard::builder()
        .resolver(StaticPolicyResolver::new().method(
            &key,
            PolicyConfig::new().with_retry(RetryConfig::default().max_retries(1).jitter(Duration::ZERO)),
        ))
        .sleeper(InstantSleeper)
        .executor(executor)
        .build();
    let calls = Arc::new(AtomicUsize::new(0));

    let caller = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let counter_clone = calls.clone();
    let thread = caller.block_on(
        engine.dispatch(InvocationContext::new(key.clone(), move || {
            let n = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    return Err(TestError("first try"));
                }
                Ok::<_, TestError>(std::thread::current().name().map(str::to_owned))
            }
        })),
    );

    assert_eq!(thread.unwrap().as_deref(), Some("safeguard-worker"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    engine.shutdown(Duration::from_secs(1));
    let err = caller
        .block_on(engine.dispatch(InvocationContext::new(key, || async { Ok::<_, TestError>(()) })))
        .unwrap_err();
    assert!(err.is_aborted());
}

#[tokio::test]
async fn drain_keeps_the_caller_runtime_responsive() {
    let key = MethodKey::new("mailer", "export");
    let engine = Safeguard::builder()
        .resolver(StaticPolicyResolver::new().method(&key, PolicyConfig::new()))
        .executor(DedicatedExecutor::new(1).expect("runtime"))
        .build();
    let started = Arc::new(AtomicBool::new(false));

    let flag = started.clone();
    let handle = engine.dispatch(InvocationContext::blocking(key.clone(), move || {
        flag.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        Ok::<_, TestError>("exported")
    }));
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let ticked = AtomicBool::new(false);
    let (ticked_during_drain, ()) = tokio::join!(
        async {
            engine.drain(Duration::from_secs(2)).await;
            ticked.load(Ordering::SeqCst)
        },
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ticked.store(true, Ordering::SeqCst);
        },
    );

    assert!(ticked_during_drain, "the caller's runtime kept running while the executor drained");
    assert!(handle.await.unwrap_err().is_aborted());
    let err = engine
        .dispatch(InvocationContext::new(key, || async { Ok::<_, TestError>(()) }))
        .await
        .unwrap_err();
    assert!(err.is_aborted());
}
