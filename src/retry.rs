//! Retry policy implementation
//!
//! Semantics:
//! - `max_retries` counts re-attempts after the initial try; `None` is unbounded and then only
//!   `max_duration` stops the loop.
//! - A failure is classified before anything else: a category in `abort_on` (or an inner error
//!   matching `abort_if`) is returned at once, and so is a category outside a non-empty
//!   `retry_on` (or an inner error rejected by `retry_if`).
//! - A retryable failure with no budget left ends the loop with
//!   `FaultError::RetriesExhausted` wrapping it.
//! - Sleeper controls how delays are applied (production uses `TokioSleeper`; tests can inject
//!   `InstantSleeper`/`TrackingSleeper`).
//!
//! Metrics: `retries` counts every re-attempt; exactly one of `succeeded_not_retried`,
//! `succeeded_retried` or `failed` moves per call, including when the loop is dropped mid-way.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use safeguard::{Backoff, FaultError, InstantSleeper, Jitter, RetryPolicy};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<MyErr>::builder()
//!     .max_retries(2)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_jitter(Jitter::Full)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), FaultError<MyErr>> =
//!     policy.execute(|| async { Err(FaultError::Inner(MyErr)) }).await;
//! assert_eq!(result.unwrap_err().attempts(), Some(3));
//! # });
//! ```

use crate::config::RetryConfig;
use crate::context::Attributes;
use crate::metrics::RetryMetrics;
use crate::time::{Sleeper, TokioSleeper};
use crate::{Backoff, ConfigError, FailureCategory, FaultError, Jitter};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub(crate) type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining budget, backoff, jitter, classification and sleeper.
pub struct RetryPolicy<E> {
    max_retries: Option<u32>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: HashSet<FailureCategory>,
    abort_on: HashSet<FailureCategory>,
    retry_if: Option<ErrorPredicate<E>>,
    abort_if: Option<ErrorPredicate<E>>,
    sleeper: Arc<dyn Sleeper>,
    metrics: RetryMetrics,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            max_duration: self.max_duration,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
            abort_on: self.abort_on.clone(),
            retry_if: self.retry_if.clone(),
            abort_if: self.abort_if.clone(),
            sleeper: self.sleeper.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("max_duration", &self.max_duration)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .field("abort_on", &self.abort_on)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

enum Verdict {
    Raise,
    Exhausted,
    Retry(Duration),
}

/// Moves exactly one final-outcome counter, even if the retry loop is dropped.
struct Settle<'a> {
    metrics: &'a RetryMetrics,
    settled: bool,
}

impl Settle<'_> {
    fn success(mut self, retries: u32) {
        self.settled = true;
        if retries == 0 {
            self.metrics.succeeded_not_retried.inc();
        } else {
            self.metrics.succeeded_retried.inc();
        }
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.failed.inc();
        }
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with(&Attributes::new(), operation).await
    }

    /// Like [`execute`](Self::execute), reporting attempts and failures into `attributes`.
    pub async fn execute_with<T, Fut, Op>(
        &self,
        attributes: &Attributes,
        mut operation: Op,
    ) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnMut() -> Fut,
    {
        let started = Instant::now();
        let settle = Settle { metrics: &self.metrics, settled: false };
        let mut retries: u32 = 0;

        loop {
            attributes.record_attempt();
            let err = match operation().await {
                Ok(value) => {
                    settle.success(retries);
                    return Ok(value);
                }
                Err(err) => err,
            };
            attributes.set_last_failure(err.to_string());

            let elapsed = started.elapsed();
            match self.classify(&err, retries, elapsed) {
                Verdict::Raise => return Err(err),
                Verdict::Exhausted => {
                    tracing::debug!(attempts = retries + 1, ?elapsed, "retries exhausted");
                    return Err(FaultError::RetriesExhausted {
                        attempts: retries + 1,
                        elapsed,
                        last: Box::new(err),
                    });
                }
                Verdict::Retry(delay) => {
                    retries += 1;
                    self.metrics.retries.inc();
                    tracing::debug!(attempt = retries, ?delay, error = %err, "retrying");
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }

    pub(crate) fn set_retry_if(&mut self, predicate: ErrorPredicate<E>) {
        self.retry_if = Some(predicate);
    }

    pub(crate) fn set_abort_if(&mut self, predicate: ErrorPredicate<E>) {
        self.abort_if = Some(predicate);
    }

    pub(crate) fn set_sleeper(&mut self, sleeper: Arc<dyn Sleeper>) {
        self.sleeper = sleeper;
    }

    fn classify(&self, err: &FaultError<E>, retries: u32, elapsed: Duration) -> Verdict {
        let category = err.category();
        let inner = err.as_inner();

        if self.abort_on.contains(&category)
            || matches!((&self.abort_if, inner), (Some(abort), Some(e)) if abort(e))
        {
            return Verdict::Raise;
        }
        if !self.retry_on.is_empty() && !self.retry_on.contains(&category) {
            return Verdict::Raise;
        }
        if matches!((&self.retry_if, inner), (Some(retry), Some(e)) if !retry(e)) {
            return Verdict::Raise;
        }

        if self.max_retries.is_some_and(|max| retries >= max) {
            return Verdict::Exhausted;
        }
        let delay = self.jitter.apply(self.backoff.delay(retries + 1));
        if self.max_duration.is_some_and(|max| elapsed.saturating_add(delay) >= max) {
            return Verdict::Exhausted;
        }
        Verdict::Retry(delay)
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_retries: Option<u32>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: HashSet<FailureCategory>,
    abort_on: HashSet<FailureCategory>,
    retry_if: Option<ErrorPredicate<E>>,
    abort_if: Option<ErrorPredicate<E>>,
    sleeper: Arc<dyn Sleeper>,
    metrics: RetryMetrics,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a builder with the configuration defaults.
    pub fn new() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    /// Builder mirroring a declared retry section: constant `delay`, bounded `jitter`.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: u32::try_from(config.max_retries).ok(),
            max_duration: (!config.max_duration.is_zero()).then_some(config.max_duration),
            backoff: Backoff::constant(config.delay),
            jitter: Jitter::bounded(config.jitter),
            retry_on: config.retry_on.iter().copied().collect(),
            abort_on: config.abort_on.iter().copied().collect(),
            retry_if: None,
            abort_if: None,
            sleeper: Arc::new(TokioSleeper),
            metrics: RetryMetrics::noop(),
        }
    }

    /// Re-attempts after the initial call.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Retry until `max_duration` runs out.
    pub fn unbounded(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Total time budget; `Duration::ZERO` removes the bound.
    pub fn max_duration(mut self, max: Duration) -> Self {
        self.max_duration = (!max.is_zero()).then_some(max);
        self
    }

    /// Set backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Categories eligible for retry. Empty means every category not aborted.
    pub fn retry_on(mut self, categories: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.retry_on = categories.into_iter().collect();
        self
    }

    /// Categories returned immediately, ahead of `retry_on`.
    pub fn abort_on(mut self, categories: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.abort_on = categories.into_iter().collect();
        self
    }

    /// Narrow retries of inner errors to those matching `predicate`.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Return inner errors matching `predicate` immediately.
    pub fn abort_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.abort_if = Some(Arc::new(predicate));
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.with_shared_sleeper(Arc::new(sleeper))
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: RetryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.max_retries.is_none() && self.max_duration.is_none() {
            return Err(ConfigError::out_of_range(
                "retry",
                "max_duration",
                "> 0 when max_retries is unbounded",
                "0ms",
            ));
        }
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            max_duration: self.max_duration,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_on: self.retry_on,
            abort_on: self.abort_on,
            retry_if: self.retry_if,
            abort_if: self.abort_if,
            sleeper: self.sleeper,
            metrics: self.metrics,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetrics, MethodMetrics};
    use crate::time::{InstantSleeper, TrackingSleeper};
    use crate::MethodKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn policy(max_retries: u32) -> RetryPolicyBuilder<TestError> {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .with_jitter(Jitter::None)
            .with_sleeper(InstantSleeper)
    }

    fn failing(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnMut() -> futures::future::Ready<Result<u32, FaultError<TestError>>> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(FaultError::Inner(TestError("boom".into()))))
        }
    }

    #[tokio::test]
    async fn success_first_attempt() {
        let policy = policy(3).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = policy
            .execute(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, FaultError<TestError>>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_retries() {
        let policy = policy(5).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = policy
            .execute(|| {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FaultError::Inner(TestError(format!("attempt {}", attempt))))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_failing_call_runs_max_retries_plus_one() {
        let policy = policy(3).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let attributes = Attributes::new();

        let err = policy.execute_with(&attributes, failing(&counter)).await.unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.last_failure().and_then(|e| e.as_inner()), Some(&TestError("boom".into())));
        assert_eq!(attributes.attempts(), 4);
        assert_eq!(attributes.last_failure().as_deref(), Some("TestError: boom"));
    }

    #[tokio::test]
    async fn zero_retries_still_wraps_the_failure() {
        let policy = policy(0).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = policy.execute(failing(&counter)).await.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(err.is_retries_exhausted());
    }

    #[tokio::test]
    async fn abort_on_wins_over_retry_on() {
        let policy = policy(3)
            .retry_on([FailureCategory::Application])
            .abort_on([FailureCategory::Application])
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = policy.execute(failing(&counter)).await.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(err.is_inner());
    }

    #[tokio::test]
    async fn categories_outside_retry_on_are_not_retried() {
        let policy = policy(3).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let err = policy
            .execute(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(FaultError::<TestError>::BulkheadRejected {
                        in_flight: 1,
                        max: 1,
                        queued: 0,
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(err.is_bulkhead());
    }

    #[tokio::test]
    async fn empty_retry_on_retries_every_category() {
        let policy = policy(2).retry_on([]).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let err = policy
            .execute(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(FaultError::<TestError>::CircuitOpen {
                        method: Arc::from("m"),
                        open_for: Duration::ZERO,
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(err.root().is_circuit_open());
    }

    #[tokio::test]
    async fn error_predicates_refine_classification() {
        let policy = policy(3)
            .retry_if(|e: &TestError| e.0 != "fatal")
            .abort_if(|e: &TestError| e.0 == "stop")
            .build()
            .unwrap();

        for (message, expected_calls) in [("fatal", 1), ("stop", 1), ("flaky", 4)] {
            let counter = Arc::new(AtomicUsize::new(0));
            let c = counter.clone();
            let _ = policy
                .execute(|| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(FaultError::Inner(TestError(message.into()))) }
                })
                .await;
            assert_eq!(counter.load(Ordering::SeqCst), expected_calls, "{message}");
        }
    }

    #[tokio::test]
    async fn backoff_and_jitter_feed_the_sleeper() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .backoff(Backoff::linear(Duration::from_millis(100)))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let _ = policy.execute(failing(&counter)).await;

        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(300)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_bounds_unbounded_retries() {
        let policy = RetryPolicy::builder()
            .unbounded()
            .max_duration(Duration::from_millis(100))
            .backoff(Backoff::constant(Duration::from_millis(30)))
            .with_jitter(Jitter::None)
            .build()
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let err: FaultError<TestError> = policy.execute(failing(&counter)).await.unwrap_err();

        // attempts at 0, 30, 60 and 90ms; another 30ms delay would cross the 100ms budget
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(err.is_retries_exhausted());
    }

    #[test]
    fn unbounded_without_duration_is_rejected() {
        let err = RetryPolicy::<TestError>::builder()
            .unbounded()
            .max_duration(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_duration"));
    }

    #[test]
    fn from_config_maps_declared_values() {
        let config = RetryConfig::default().max_retries(-1).jitter(Duration::ZERO);
        let policy = RetryPolicyBuilder::<TestError>::from_config(&config).build().unwrap();
        assert_eq!(policy.max_retries(), None);
        assert_eq!(policy.max_duration(), Some(Duration::from_secs(180)));
        assert_eq!(policy.jitter, Jitter::None);
    }

    #[tokio::test]
    async fn outcome_counters_move_exactly_once() {
        let sink = InMemoryMetrics::new();
        let metrics = MethodMetrics::new(Arc::new(sink.clone()), "ft", &MethodKey::new("svc", "op"));
        let policy = policy(3).with_metrics(metrics.retry()).build().unwrap();

        let _ = policy.execute(|| async { Ok::<_, FaultError<TestError>>(()) }).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let _ = policy
            .execute(|| {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FaultError::Inner(TestError("flaky".into())))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let _ = policy.execute(failing(&Arc::new(AtomicUsize::new(0)))).await;

        let value = |s: &str| sink.counter_value(&format!("ft.svc.op.retry.{s}"));
        assert_eq!(value("callsSucceededNotRetried.total"), Some(1));
        assert_eq!(value("callsSucceededRetried.total"), Some(1));
        assert_eq!(value("callsFailed.total"), Some(1));
        assert_eq!(value("retries.total"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_loop_counts_as_failed() {
        let sink = InMemoryMetrics::new();
        let metrics = MethodMetrics::new(Arc::new(sink.clone()), "ft", &MethodKey::new("svc", "op"));
        let policy = RetryPolicy::<TestError>::builder()
            .max_retries(10)
            .backoff(Backoff::constant(Duration::from_secs(1)))
            .with_jitter(Jitter::None)
            .with_metrics(metrics.retry())
            .build()
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let run = policy.execute(failing(&counter));
        assert!(tokio::time::timeout(Duration::from_millis(1500), run).await.is_err());

        assert_eq!(sink.counter_value("ft.svc.op.retry.callsFailed.total"), Some(1));
        assert_eq!(sink.counter_value("ft.svc.op.retry.retries.total"), Some(2));
    }
}
