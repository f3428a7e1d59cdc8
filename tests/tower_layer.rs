mod common;

use common::{counter, engine, TestError};
use safeguard::config::{BulkheadConfig, PolicyConfig, RetryConfig};
use safeguard::{FallbackContext, FallbackPolicy, GuardLayer, InMemoryMetrics, MethodKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceBuilder, ServiceExt};

#[tokio::test]
async fn layer_retries_by_resending_the_request() {
    let key = MethodKey::new("geo", "lookup");
    let metrics = InMemoryMetrics::new();
    let engine = engine(
        &key,
        PolicyConfig::new().with_retry(RetryConfig::default().max_retries(3).jitter(Duration::ZERO)),
        &metrics,
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let seen = calls.clone();
    let svc = ServiceBuilder::new().layer(GuardLayer::new(engine, key.clone())).service(service_fn(
        move |city: &'static str| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError("geocoder busy"))
                } else {
                    Ok(city.len())
                }
            }
        },
    ));

    assert_eq!(svc.oneshot("Porto").await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(counter(&metrics, &key, "retry.callsSucceededRetried.total"), 1);
}

#[tokio::test]
async fn layer_surfaces_protective_failures() {
    let key = MethodKey::new("geo", "reverse");
    let metrics = InMemoryMetrics::new();
    let engine = engine(&key, PolicyConfig::new().with_bulkhead(BulkheadConfig::new(1)), &metrics);
    let svc = GuardLayer::new(engine.clone(), key.clone())
        .asynchronous()
        .layer(service_fn(|_: u8| async { Ok::<_, TestError>(()) }));

    svc.clone().oneshot(1).await.unwrap();
    let bulkhead = engine.bulkhead(&key).expect("bulkhead cached");
    let held = bulkhead.try_admit().expect("free slot");
    let err = svc.oneshot(2).await.unwrap_err();
    assert!(err.is_bulkhead());
    drop(held);
}

#[tokio::test]
async fn layer_fallback_recovers_with_the_request() {
    let key = MethodKey::new("geo", "timezone");
    let metrics = InMemoryMetrics::new();
    let engine = engine(&key, PolicyConfig::new(), &metrics);
    let svc = GuardLayer::new(engine, key.clone())
        .with_fallback(FallbackPolicy::from_fn(|ctx: FallbackContext<TestError>| async move {
            let city = ctx.arguments::<&'static str>().copied().unwrap_or_default();
            Ok(format!("UTC for {city}"))
        }))
        .layer(service_fn(|_: &'static str| async { Err::<String, _>(TestError("tz db offline")) }));

    assert_eq!(svc.oneshot("Faro").await.unwrap(), "UTC for Faro");
    assert_eq!(counter(&metrics, &key, "fallback.calls.total"), 1);
}

#[tokio::test]
async fn layer_fallback_with_other_types_is_ignored() {
    let key = MethodKey::new("geo", "altitude");
    let metrics = InMemoryMetrics::new();
    let engine = engine(&key, PolicyConfig::new(), &metrics);
    let svc = GuardLayer::new(engine, key.clone())
        .with_fallback(FallbackPolicy::<u32, TestError>::value(0))
        .layer(service_fn(|_: u8| async { Err::<i64, _>(TestError("dem missing")) }));

    let err = svc.oneshot(3).await.unwrap_err();
    assert_eq!(err.as_inner(), Some(&TestError("dem missing")));
    assert_eq!(counter(&metrics, &key, "fallback.calls.total"), 0);
}
