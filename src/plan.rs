//! Execution plan: the fixed composition of policies for one guarded method.
//!
//! Order per invocation, outermost first:
//!
//! ```text
//! invocation metrics
//!   └─ fallback
//!        └─ breaker precheck          (fail fast, no slot taken)
//!             └─ bulkhead admission   (held until the invocation ends)
//!                  └─ retry loop
//!                       └─ breaker acquire + outcome
//!                            └─ timeout (per attempt)
//!                                 └─ operation
//! ```
//!
//! With [`TimeoutScope::WholeBudget`] the timeout moves out to wrap the whole retry loop, just
//! inside the bulkhead. A retry re-enters the breaker, so a breaker that opens mid-loop ends the
//! loop with `CircuitOpen` rather than the original failure.
//!
//! Shared state (breaker, bulkhead, metric instruments) lives in one `MethodState` per
//! method; plans are cheap views over it and may differ in result type and hooks.

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::{BreakerPermit, CircuitBreaker};
use crate::config::{PolicyConfig, TimeoutScope};
use crate::context::{Attributes, InvocationContext, InvocationParts, MethodKey};
use crate::executor::{AsyncHandle, Executor, TokioExecutor};
use crate::fallback::{FallbackContext, FallbackPolicy};
use crate::metrics::{FallbackMetrics, InvocationMetrics, MethodMetrics, RetryMetrics};
use crate::retry::{ErrorPredicate, RetryPolicy, RetryPolicyBuilder};
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;
use crate::{ConfigError, FaultError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;

/// Policy state shared by every call to one method.
pub(crate) struct MethodState {
    key: MethodKey,
    config: PolicyConfig,
    bulkhead: Option<BulkheadPolicy>,
    breaker: Option<CircuitBreaker>,
    timeout: Option<TimeoutPolicy>,
    invocations: InvocationMetrics,
    retry_metrics: RetryMetrics,
    fallback_metrics: FallbackMetrics,
}

impl MethodState {
    pub(crate) fn build(
        key: MethodKey,
        config: PolicyConfig,
        metrics: &MethodMetrics,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let bulkhead = match &config.bulkhead {
            Some(cfg) => {
                let queue = if config.asynchronous { cfg.waiting_task_queue } else { 0 };
                let bulkhead = BulkheadPolicy::new(cfg.max_concurrent)?
                    .with_queue(queue)
                    .with_metrics(metrics.bulkhead());
                bulkhead.register_gauges(metrics);
                Some(bulkhead)
            }
            None => None,
        };
        let breaker = match &config.circuit_breaker {
            Some(cfg) => {
                let breaker = CircuitBreaker::new(cfg.clone())?
                    .with_shared_clock(clock)
                    .with_metrics(metrics.circuit_breaker())
                    .named(key.qualified_arc());
                breaker.register_gauges(metrics);
                Some(breaker)
            }
            None => None,
        };
        let timeout = match &config.timeout {
            Some(cfg) => Some(TimeoutPolicy::new(cfg.duration)?.with_metrics(metrics.timeout())),
            None => None,
        };
        let retry_metrics =
            if config.retry.is_some() { metrics.retry() } else { RetryMetrics::noop() };
        let fallback_metrics = metrics.fallback();

        Ok(Self {
            invocations: metrics.invocations(),
            key,
            config,
            bulkhead,
            breaker,
            timeout,
            retry_metrics,
            fallback_metrics,
        })
    }

    pub(crate) fn key(&self) -> &MethodKey {
        &self.key
    }

    pub(crate) fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub(crate) fn bulkhead(&self) -> Option<&BulkheadPolicy> {
        self.bulkhead.as_ref()
    }
}

impl std::fmt::Debug for MethodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodState").field("key", &self.key).field("config", &self.config).finish()
    }
}

/// The guarded pipeline for one method and one result type.
///
/// Cloning is cheap; clones share breaker and bulkhead state.
pub struct ExecutionPlan<T, E> {
    state: Arc<MethodState>,
    retry: Option<RetryPolicy<E>>,
    fallback: Option<FallbackPolicy<T, E>>,
    fail_on: Option<FailurePredicate<E>>,
    executor: Arc<dyn Executor>,
}

type FailurePredicate<E> = Arc<dyn Fn(&FaultError<E>) -> bool + Send + Sync>;

impl<T, E> Clone for ExecutionPlan<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            retry: self.retry.clone(),
            fallback: self.fallback.clone(),
            fail_on: self.fail_on.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for ExecutionPlan<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("method", &self.state.key)
            .field("config", &self.state.config)
            .field("retry", &self.retry)
            .field("fallback", &self.fallback.is_some())
            .field("executor", &self.executor)
            .finish()
    }
}

impl<T, E> ExecutionPlan<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Standalone plan without metrics, on the ambient tokio runtime.
    ///
    /// ```rust
    /// use safeguard::config::{PolicyConfig, RetryConfig};
    /// use safeguard::{ExecutionPlan, InvocationContext, MethodKey};
    /// use std::time::Duration;
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let key = MethodKey::new("inventory", "reserve");
    /// let config = PolicyConfig::new()
    ///     .with_retry(RetryConfig::default().max_retries(2).jitter(Duration::ZERO));
    /// let plan = ExecutionPlan::<u32, std::io::Error>::from_config(key.clone(), config).unwrap();
    ///
    /// let result = plan.execute(InvocationContext::new(key, || async { Ok(3) })).await;
    /// assert_eq!(result.unwrap(), 3);
    /// # });
    /// ```
    pub fn from_config(key: MethodKey, config: PolicyConfig) -> Result<Self, ConfigError> {
        let metrics = MethodMetrics::noop(&key);
        let state = MethodState::build(key, config, &metrics, Arc::new(MonotonicClock::default()))?;
        Self::with_state(Arc::new(state), Arc::new(TokioSleeper), Arc::new(TokioExecutor::new()))
    }

    pub(crate) fn with_state(
        state: Arc<MethodState>,
        sleeper: Arc<dyn Sleeper>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, ConfigError> {
        let retry = match &state.config.retry {
            Some(cfg) => Some(
                RetryPolicyBuilder::from_config(cfg)
                    .with_shared_sleeper(sleeper)
                    .with_metrics(state.retry_metrics.clone())
                    .build()?,
            ),
            None => None,
        };
        Ok(Self { state, retry, fallback: None, fail_on: None, executor })
    }

    /// Recover final failures with `fallback`.
    pub fn with_fallback(mut self, fallback: FallbackPolicy<T, E>) -> Self {
        self.fallback = Some(fallback.with_metrics(self.state.fallback_metrics.clone()));
        self
    }

    /// Retry inner errors only when `predicate` accepts them. No effect without a retry policy.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        if let Some(retry) = self.retry.as_mut() {
            let predicate: ErrorPredicate<E> = Arc::new(predicate);
            retry.set_retry_if(predicate);
        }
        self
    }

    /// Never retry inner errors matching `predicate`.
    pub fn abort_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        if let Some(retry) = self.retry.as_mut() {
            let predicate: ErrorPredicate<E> = Arc::new(predicate);
            retry.set_abort_if(predicate);
        }
        self
    }

    /// Failures the circuit breaker counts. Rejected failures are recorded as successes.
    pub fn fail_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FaultError<E>) -> bool + Send + Sync + 'static,
    {
        self.fail_on = Some(Arc::new(predicate));
        self
    }

    /// Sleeper used between retries.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        if let Some(retry) = self.retry.as_mut() {
            retry.set_sleeper(Arc::new(sleeper));
        }
        self
    }

    /// Executor for asynchronous dispatch.
    pub fn with_executor<X: Executor + 'static>(mut self, executor: X) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn method(&self) -> &MethodKey {
        &self.state.key
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.state.config
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.state.breaker.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&BulkheadPolicy> {
        self.state.bulkhead.as_ref()
    }

    /// Run `ctx` through the pipeline.
    ///
    /// Calls marked asynchronous (by the context or the method's config) are dispatched onto the
    /// executor and awaited through their handle, so they see the same failures as inline calls.
    pub async fn execute(&self, ctx: InvocationContext<T, E>) -> Result<T, FaultError<E>> {
        if ctx.is_asynchronous() || self.state.config.asynchronous {
            return self.dispatch(ctx).await;
        }
        self.run(ctx.into_parts(), false).await
    }

    /// Hand `ctx` to the executor and return at once.
    ///
    /// The handle resolves when the full pipeline, retries and fallback included, has finished.
    /// A panic inside the pipeline resolves it to [`FaultError::Aborted`].
    pub fn dispatch(&self, ctx: InvocationContext<T, E>) -> AsyncHandle<T, E> {
        let (sender, handle) = AsyncHandle::channel();
        let plan = self.clone();
        let parts = ctx.into_parts();
        self.executor.spawn(Box::pin(async move {
            let result = match AssertUnwindSafe(plan.run(parts, true)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    plan.state.invocations.failed.inc();
                    let reason = panic_reason(&*panic);
                    tracing::error!(method = %plan.state.key, %reason, "dispatched invocation panicked");
                    Err(FaultError::Aborted { reason })
                }
            };
            if sender.send(result).is_err() {
                tracing::trace!(method = %plan.state.key, "async handle dropped before completion");
            }
        }));
        handle
    }

    async fn run(&self, parts: InvocationParts<T, E>, dispatched: bool) -> Result<T, FaultError<E>> {
        self.state.invocations.total.inc();
        let started = Instant::now();

        let result = match self.guarded(&parts, dispatched).await {
            Ok(value) => Ok(value),
            Err(failure) => match &self.fallback {
                Some(fallback) => {
                    let ctx = FallbackContext::new(
                        parts.method.clone(),
                        failure,
                        parts.attributes.clone(),
                        parts.arguments.clone(),
                    );
                    fallback.recover(ctx).await
                }
                None => Err(failure),
            },
        };

        if let Err(failure) = &result {
            self.state.invocations.failed.inc();
            tracing::debug!(method = %self.state.key, category = ?failure.category(), "invocation failed");
        }
        parts.attributes.set_elapsed(started.elapsed());
        result
    }

    async fn guarded(&self, parts: &InvocationParts<T, E>, dispatched: bool) -> Result<T, FaultError<E>> {
        if let Some(breaker) = &self.state.breaker {
            breaker.precheck()?;
        }

        let _slot = match &self.state.bulkhead {
            Some(bulkhead) if dispatched && bulkhead.max_queue() > 0 => Some(bulkhead.admit().await?),
            Some(bulkhead) => Some(bulkhead.try_admit()?),
            None => None,
        };

        let attributes = &parts.attributes;
        match (self.state.config.timeout_scope, &self.state.timeout) {
            (TimeoutScope::WholeBudget, Some(timeout)) => {
                timeout
                    .guard(self.retrying(attributes, move || self.attempt(parts, false)))
                    .signal(attributes)
                    .await
            }
            _ => self.retrying(attributes, move || self.attempt(parts, true)).await,
        }
    }

    async fn retrying<Op, Fut>(&self, attributes: &Attributes, mut attempt: Op) -> Result<T, FaultError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FaultError<E>>>,
    {
        match &self.retry {
            Some(retry) => retry.execute_with(attributes, attempt).await,
            None => {
                attributes.record_attempt();
                let result = attempt().await;
                if let Err(failure) = &result {
                    attributes.set_last_failure(failure.to_string());
                }
                result
            }
        }
    }

    async fn attempt(&self, parts: &InvocationParts<T, E>, timed: bool) -> Result<T, FaultError<E>> {
        let mut settlement = Settlement {
            permit: match &self.state.breaker {
                Some(breaker) => Some(breaker.acquire()?),
                None => None,
            },
            attributes: &parts.attributes,
            fail_on_cancel: !timed,
        };

        let call = (parts.operation)();
        let outcome = match &self.state.timeout {
            Some(timeout) if timed => timeout.guard(call).signal(&parts.attributes).await,
            _ => call.await,
        };

        if let Some(permit) = settlement.permit.take() {
            match &outcome {
                Err(failure) if self.counts_as_failure(failure) => permit.failure(),
                _ => permit.success(),
            }
        }
        outcome
    }

    fn counts_as_failure(&self, failure: &FaultError<E>) -> bool {
        self.fail_on.as_ref().map_or(true, |p| p(failure))
    }
}

/// Breaker permit held across one attempt. An attempt dropped by the whole-budget deadline
/// never reaches its outcome, so the permit is settled as a failure here. Any other unsettled
/// drop only releases the permit.
struct Settlement<'a> {
    permit: Option<BreakerPermit>,
    attributes: &'a Attributes,
    fail_on_cancel: bool,
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.fail_on_cancel && self.attributes.is_cancelled() {
                permit.failure();
            }
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
