//! Timeout policy implementation
//!
//! [`Deadline`] races an attempt against a tokio timer inside one future. The attempt is polled
//! first, so work that is ready at the deadline still wins. When the timer fires, the attempt
//! is dropped in place: nothing it produces afterwards can reach the caller. A result from a
//! poll that blocked past the deadline is discarded the same way.

use crate::context::Attributes;
use crate::metrics::{nanos, TimeoutMetrics};
use crate::{ConfigError, FaultError};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

#[derive(Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    metrics: TimeoutMetrics,
}

impl TimeoutPolicy {
    /// Create a timeout policy. The duration must be non-zero.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::out_of_range("timeout", "duration", "> 0", "0ms"));
        }
        Ok(Self { duration, metrics: TimeoutMetrics::noop() })
    }

    pub fn with_metrics(mut self, metrics: TimeoutMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Bound `future` by this policy's duration.
    pub fn guard<F>(&self, future: F) -> Deadline<F> {
        Deadline {
            future,
            sleep: tokio::time::sleep(self.duration),
            started: Instant::now(),
            timeout: self.duration,
            metrics: self.metrics.clone(),
            attributes: None,
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnOnce() -> Fut,
    {
        self.guard(operation()).await
    }
}

impl std::fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPolicy").field("duration", &self.duration).finish()
    }
}

/// Future returned by [`TimeoutPolicy::guard`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Deadline<F> {
    #[pin]
    future: F,
    #[pin]
    sleep: Sleep,
    started: Instant,
    timeout: Duration,
    metrics: TimeoutMetrics,
    attributes: Option<Attributes>,
}

impl<F> Deadline<F> {
    /// Flag `attributes` as cancelled when the deadline fires.
    pub fn signal(mut self, attributes: &Attributes) -> Self {
        self.attributes = Some(attributes.clone());
        self
    }
}

impl<F, T, E> Future for Deadline<F>
where
    F: Future<Output = Result<T, FaultError<E>>>,
{
    type Output = Result<T, FaultError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(result) = this.future.poll(cx) {
            let elapsed = this.started.elapsed();
            this.metrics.duration.record(nanos(elapsed));
            if elapsed > *this.timeout {
                // a poll that blocked past the deadline
                this.metrics.timed_out.inc();
                if let Some(attributes) = this.attributes.as_ref() {
                    attributes.cancel();
                }
                tracing::debug!(?elapsed, timeout = ?this.timeout, "late attempt result discarded");
                return Poll::Ready(Err(FaultError::Timeout { elapsed, timeout: *this.timeout }));
            }
            this.metrics.not_timed_out.inc();
            return Poll::Ready(result);
        }
        match this.sleep.poll(cx) {
            Poll::Ready(()) => {
                let elapsed = this.started.elapsed();
                this.metrics.timed_out.inc();
                this.metrics.duration.record(nanos(elapsed));
                if let Some(attributes) = this.attributes.as_ref() {
                    attributes.cancel();
                }
                tracing::debug!(?elapsed, timeout = ?this.timeout, "attempt timed out");
                Poll::Ready(Err(FaultError::Timeout { elapsed, timeout: *this.timeout }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetrics, MethodMetrics};
    use crate::MethodKey;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn rejects_zero_duration() {
        assert!(TimeoutPolicy::new(Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        let result = timeout
            .execute(|| async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, FaultError<TestError>>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation_and_reports_durations() {
        let limit = Duration::from_millis(50);
        let timeout = TimeoutPolicy::new(limit).unwrap();

        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), FaultError<TestError>>(())
            })
            .await;

        match result.unwrap_err() {
            FaultError::Timeout { elapsed, timeout } => {
                assert_eq!(timeout, limit);
                assert!(elapsed >= limit);
            }
            e => panic!("Expected Timeout error, got {:?}", e),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_is_never_observed() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(20)).unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();

        let result = timeout
            .execute(|| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.store(true, Ordering::SeqCst);
                Ok::<_, FaultError<TestError>>("late")
            })
            .await;
        assert!(result.unwrap_err().is_timeout());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst), "abandoned attempt must not keep running");
    }

    #[tokio::test]
    async fn poll_that_blocks_past_the_deadline_is_a_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(20)).unwrap();
        let attributes = Attributes::new();

        let result = timeout
            .guard(async {
                std::thread::sleep(Duration::from_millis(100));
                Ok::<_, FaultError<TestError>>("late")
            })
            .signal(&attributes)
            .await;

        let (elapsed, limit) = result.unwrap_err().timeout_details().unwrap();
        assert_eq!(limit, Duration::from_millis(20));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(attributes.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_signals_cancellation() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(10)).unwrap();
        let attributes = Attributes::new();
        let result: Result<(), FaultError<TestError>> =
            timeout.guard(std::future::pending()).signal(&attributes).await;

        assert!(result.unwrap_err().is_timeout());
        assert!(attributes.is_cancelled());
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();

        let result = timeout
            .execute(|| async {
                Err::<(), _>(FaultError::Inner(TestError("operation failed".to_string())))
            })
            .await;

        match result.unwrap_err() {
            FaultError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("Expected Inner error, got {:?}", e),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn records_timeout_metrics() {
        let sink = InMemoryMetrics::new();
        let metrics = MethodMetrics::new(Arc::new(sink.clone()), "ft", &MethodKey::new("svc", "op"));
        let timeout =
            TimeoutPolicy::new(Duration::from_millis(10)).unwrap().with_metrics(metrics.timeout());

        let _ = timeout.execute(|| async { Ok::<_, FaultError<TestError>>(()) }).await;
        let _ = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, FaultError<TestError>>(())
            })
            .await;

        assert_eq!(sink.counter_value("ft.svc.op.timeout.callsNotTimedOut.total"), Some(1));
        assert_eq!(sink.counter_value("ft.svc.op.timeout.callsTimedOut.total"), Some(1));
        assert_eq!(
            sink.histogram_summary("ft.svc.op.timeout.executionDuration").map(|h| h.count),
            Some(2)
        );
    }
}
