//! Fallback: a substitute result once the guarded pipeline has failed.
//!
//! The handler sees the final failure, the method identity, the call's attributes and the
//! original arguments. Whatever it returns goes straight to the caller; a failing handler is
//! not retried, timed or counted by the circuit breaker.

use crate::context::{Attributes, MethodKey};
use crate::metrics::FallbackMetrics;
use crate::FaultError;
use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Everything a fallback handler gets to look at.
pub struct FallbackContext<E> {
    method: MethodKey,
    failure: FaultError<E>,
    attributes: Attributes,
    arguments: Option<Arc<dyn Any + Send + Sync>>,
}

impl<E> FallbackContext<E> {
    pub(crate) fn new(
        method: MethodKey,
        failure: FaultError<E>,
        attributes: Attributes,
        arguments: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self { method, failure, attributes, arguments }
    }

    pub fn method(&self) -> &MethodKey {
        &self.method
    }

    /// The failure that ended the guarded pipeline.
    pub fn failure(&self) -> &FaultError<E> {
        &self.failure
    }

    /// Take the failure, e.g. to re-raise it unchanged.
    pub fn into_failure(self) -> FaultError<E> {
        self.failure
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// The call's arguments, if they were attached as an `A`.
    pub fn arguments<A: Any>(&self) -> Option<&A> {
        self.arguments.as_deref().and_then(|args| args.downcast_ref::<A>())
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for FallbackContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackContext")
            .field("method", &self.method)
            .field("failure", &self.failure)
            .field("arguments", &self.arguments.is_some())
            .finish()
    }
}

/// Produces a substitute result for a failed invocation.
#[async_trait]
pub trait FallbackHandler<T, E>: Send + Sync {
    /// Recover from `ctx.failure()`, or return an error to propagate.
    async fn handle(&self, ctx: FallbackContext<E>) -> Result<T, FaultError<E>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<T, E, F, Fut> FallbackHandler<T, E> for FnHandler<F>
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(FallbackContext<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FaultError<E>>> + Send + 'static,
{
    async fn handle(&self, ctx: FallbackContext<E>) -> Result<T, FaultError<E>> {
        (self.0)(ctx).await
    }
}

struct ValueHandler<T>(T);

#[async_trait]
impl<T, E> FallbackHandler<T, E> for ValueHandler<T>
where
    T: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    async fn handle(&self, _ctx: FallbackContext<E>) -> Result<T, FaultError<E>> {
        Ok(self.0.clone())
    }
}

type FailurePredicate<E> = Arc<dyn Fn(&FaultError<E>) -> bool + Send + Sync>;

/// Fallback policy: a handler plus an optional `apply_on` filter.
pub struct FallbackPolicy<T, E> {
    handler: Arc<dyn FallbackHandler<T, E>>,
    apply_on: Option<FailurePredicate<E>>,
    metrics: FallbackMetrics,
}

impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            apply_on: self.apply_on.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy").field("filtered", &self.apply_on.is_some()).finish()
    }
}

impl<T, E> FallbackPolicy<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<H>(handler: H) -> Self
    where
        H: FallbackHandler<T, E> + 'static,
    {
        Self { handler: Arc::new(handler), apply_on: None, metrics: FallbackMetrics::noop() }
    }

    /// Fallback backed by an async closure.
    pub fn from_fn<F, Fut>(handler: F) -> Self
    where
        F: Fn(FallbackContext<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FaultError<E>>> + Send + 'static,
    {
        Self::new(FnHandler(handler))
    }

    /// Fallback that always answers with `value`.
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(ValueHandler(value))
    }

    /// Only recover failures matching `predicate`; others propagate unchanged.
    pub fn apply_on<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&FaultError<E>) -> bool + Send + Sync + 'static,
    {
        self.apply_on = Some(Arc::new(predicate));
        self
    }

    pub fn with_metrics(mut self, metrics: FallbackMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn applies_to(&self, failure: &FaultError<E>) -> bool {
        self.apply_on.as_ref().map_or(true, |p| p(failure))
    }

    /// Run the handler for `ctx`, or hand its failure back if this policy does not apply.
    pub async fn recover(&self, ctx: FallbackContext<E>) -> Result<T, FaultError<E>> {
        if !self.applies_to(ctx.failure()) {
            return Err(ctx.into_failure());
        }
        self.metrics.calls.inc();
        tracing::debug!(method = %ctx.method(), category = ?ctx.failure().category(), "invoking fallback");
        self.handler.handle(ctx).await
    }

    /// Run `operation` and recover its failure.
    pub async fn execute<Fut, Op>(&self, method: &MethodKey, operation: Op) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnOnce() -> Fut,
    {
        match operation().await {
            Ok(value) => Ok(value),
            Err(failure) => {
                self.recover(FallbackContext::new(method.clone(), failure, Attributes::new(), None))
                    .await
            }
        }
    }
}
