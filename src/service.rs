//! Tower integration: guard any `Service` with a method's execution plan.
//!
//! ```rust
//! use safeguard::config::{PolicyConfig, RetryConfig, StaticPolicyResolver};
//! use safeguard::{GuardLayer, MethodKey, Safeguard};
//! use std::time::Duration;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let key = MethodKey::new("geo", "lookup");
//! let engine = Safeguard::new(StaticPolicyResolver::new().method(
//!     &key,
//!     PolicyConfig::new().with_retry(RetryConfig::default().jitter(Duration::ZERO)),
//! ));
//!
//! let svc = GuardLayer::new(engine, key).layer(service_fn(|city: String| async move {
//!     Ok::<_, std::io::Error>(city.len())
//! }));
//! assert_eq!(svc.oneshot("Lisbon".to_string()).await.unwrap(), 6);
//! # });
//! ```

use crate::{FallbackPolicy, FaultError, InvocationContext, MethodKey, Safeguard};
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Layer guarding the wrapped service as `method`.
#[derive(Clone, Debug)]
pub struct GuardLayer {
    engine: Safeguard,
    method: MethodKey,
    asynchronous: bool,
    fallback: Option<Arc<dyn Any + Send + Sync>>,
}

impl GuardLayer {
    pub fn new(engine: Safeguard, method: MethodKey) -> Self {
        Self { engine, method, asynchronous: false, fallback: None }
    }

    /// Recover failed requests with `fallback`, overriding one registered on the engine.
    ///
    /// `T` and `E` must be the wrapped service's response and error types; otherwise the
    /// fallback never applies.
    pub fn with_fallback<T, E>(mut self, fallback: FallbackPolicy<T, E>) -> Self
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Dispatch every request on the engine's executor.
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }
}

impl<S> Layer<S> for GuardLayer {
    type Service = GuardedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardedService {
            inner,
            engine: self.engine.clone(),
            method: self.method.clone(),
            asynchronous: self.asynchronous,
            fallback: self.fallback.clone(),
        }
    }
}

/// Service produced by [`GuardLayer`].
///
/// Each request becomes an [`InvocationContext`] whose operation drives a fresh clone of the
/// inner service, so retries re-send the request. The request is also attached as the call's
/// arguments for fallback handlers.
#[derive(Clone, Debug)]
pub struct GuardedService<S> {
    inner: S,
    engine: Safeguard,
    method: MethodKey,
    asynchronous: bool,
    fallback: Option<Arc<dyn Any + Send + Sync>>,
}

impl<S, Request> Service<Request> for GuardedService<S>
where
    Request: Clone + Send + Sync + 'static,
    S: Service<Request> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = FaultError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // readiness of the inner service is awaited per attempt
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        let arguments = request.clone();
        let mut ctx = InvocationContext::new(self.method.clone(), move || {
            inner.clone().oneshot(request.clone())
        })
        .with_arguments(arguments);
        if self.asynchronous {
            ctx = ctx.asynchronous();
        }

        let fallback = self.fallback.as_ref().and_then(|fallback| {
            let typed = fallback.downcast_ref::<FallbackPolicy<S::Response, S::Error>>().cloned();
            if typed.is_none() {
                tracing::warn!(method = %self.method, "layer fallback does not match the service types");
            }
            typed
        });
        let engine = self.engine.clone();
        Box::pin(async move { engine.execute_with(ctx, fallback).await })
    }
}
