//! The engine: resolves policies per method once, caches the shared state, and runs calls.
//!
//! Reads of the method cache are lock-free (`arc-swap`); creating an entry takes a short mutex
//! so concurrent first calls to the same method build its breaker and bulkhead only once.

use crate::config::{PolicyConfig, PolicyResolver, StaticPolicyResolver};
use crate::context::{InvocationContext, MethodKey};
use crate::executor::{AsyncHandle, Executor, TokioExecutor};
use crate::fallback::FallbackPolicy;
use crate::metrics::{MethodMetrics, MetricsSink, NoMetrics, DEFAULT_NAMESPACE};
use crate::plan::{ExecutionPlan, MethodState};
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};
use crate::{BulkheadPolicy, CircuitBreaker, ConfigError, FaultError};
use arc_swap::ArcSwap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A `FallbackPolicy<T, E>` with its result types erased; recovered by downcast per plan.
type RegisteredFallback = Arc<dyn Any + Send + Sync>;

struct Inner {
    resolver: Arc<dyn PolicyResolver>,
    sink: Arc<dyn MetricsSink>,
    namespace: String,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    executor: Arc<dyn Executor>,
    fallbacks: HashMap<MethodKey, RegisteredFallback>,
    methods: ArcSwap<HashMap<MethodKey, Arc<MethodState>>>,
    creating: Mutex<()>,
}

/// Fault-tolerance engine shared by every guarded method of an application.
///
/// ```rust
/// use safeguard::config::{PolicyConfig, RetryConfig, StaticPolicyResolver};
/// use safeguard::{InMemoryMetrics, InvocationContext, MethodKey, Safeguard};
/// use std::time::Duration;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let key = MethodKey::new("billing", "charge");
/// let resolver = StaticPolicyResolver::new().method(
///     &key,
///     PolicyConfig::new().with_retry(RetryConfig::default().max_retries(1).jitter(Duration::ZERO)),
/// );
/// let metrics = InMemoryMetrics::new();
/// let engine = Safeguard::builder().resolver(resolver).metrics(metrics.clone()).build();
///
/// let ctx = InvocationContext::new(key, || async { Ok::<_, std::io::Error>("charged") });
/// assert_eq!(engine.execute(ctx).await.unwrap(), "charged");
/// assert_eq!(metrics.counter_value("ft.billing.charge.invocations.total"), Some(1));
/// # });
/// ```
#[derive(Clone)]
pub struct Safeguard {
    inner: Arc<Inner>,
}

impl Safeguard {
    pub fn builder() -> SafeguardBuilder {
        SafeguardBuilder::default()
    }

    /// Engine with default collaborators around `resolver`.
    pub fn new<R: PolicyResolver + 'static>(resolver: R) -> Self {
        Self::builder().resolver(resolver).build()
    }

    /// The plan for `method`, resolving and caching its policies on first use.
    ///
    /// A fallback registered for `method` with matching result types is attached.
    pub fn plan<T, E>(&self, method: &MethodKey) -> Result<ExecutionPlan<T, E>, ConfigError>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let state = self.state(method)?;
        let plan =
            ExecutionPlan::with_state(state, self.inner.sleeper.clone(), self.inner.executor.clone())?;
        let Some(registered) = self.inner.fallbacks.get(method) else {
            return Ok(plan);
        };
        match registered.downcast_ref::<FallbackPolicy<T, E>>() {
            Some(fallback) => Ok(plan.with_fallback(fallback.clone())),
            None => {
                tracing::warn!(
                    method = %method,
                    result = std::any::type_name::<T>(),
                    "registered fallback has different result types; skipped"
                );
                Ok(plan)
            }
        }
    }

    /// Run `ctx` under its method's plan.
    ///
    /// An invalid policy configuration fails the call with [`FaultError::Aborted`] without
    /// running the operation.
    pub async fn execute<T, E>(&self, ctx: InvocationContext<T, E>) -> Result<T, FaultError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with(ctx, None).await
    }

    /// [`execute`](Self::execute) with `fallback` replacing any registered one.
    pub(crate) async fn execute_with<T, E>(
        &self,
        ctx: InvocationContext<T, E>,
        fallback: Option<FallbackPolicy<T, E>>,
    ) -> Result<T, FaultError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.plan::<T, E>(ctx.method()) {
            Ok(plan) => match fallback {
                Some(fallback) => plan.with_fallback(fallback).execute(ctx).await,
                None => plan.execute(ctx).await,
            },
            Err(error) => Err(self.rejected(ctx.method(), error)),
        }
    }

    /// Dispatch `ctx` on the executor and return its handle immediately.
    pub fn dispatch<T, E>(&self, ctx: InvocationContext<T, E>) -> AsyncHandle<T, E>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.plan::<T, E>(ctx.method()) {
            Ok(plan) => plan.dispatch(ctx),
            Err(error) => {
                let (sender, handle) = AsyncHandle::channel();
                let _ = sender.send(Err(self.rejected(ctx.method(), error)));
                handle
            }
        }
    }

    /// Forget the cached state of `method`; the next call resolves its policies again.
    ///
    /// Breaker history and bulkhead occupancy start fresh. Calls already running keep the old
    /// state until they finish. Returns whether anything was cached.
    pub fn reconfigure(&self, method: &MethodKey) -> bool {
        let _creating = self.inner.creating.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.inner.methods.load();
        if !current.contains_key(method) {
            return false;
        }
        let mut next = HashMap::clone(&current);
        next.remove(method);
        self.inner.methods.store(Arc::new(next));
        tracing::warn!(method = %method, "cached policies dropped; next call re-resolves");
        true
    }

    /// The breaker guarding `method`, if it has been used and declares one.
    pub fn circuit_breaker(&self, method: &MethodKey) -> Option<CircuitBreaker> {
        self.inner.methods.load().get(method).and_then(|s| s.breaker().cloned())
    }

    /// The bulkhead guarding `method`, if it has been used and declares one.
    pub fn bulkhead(&self, method: &MethodKey) -> Option<BulkheadPolicy> {
        self.inner.methods.load().get(method).and_then(|s| s.bulkhead().cloned())
    }

    /// Methods with cached state, sorted by qualified name.
    pub fn methods(&self) -> Vec<MethodKey> {
        let mut keys: Vec<MethodKey> = self.inner.methods.load().keys().cloned().collect();
        keys.sort_by(|a, b| a.qualified().cmp(b.qualified()));
        keys
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.sink
    }

    /// Drain the executor, waiting up to `timeout` for dispatched calls.
    ///
    /// Blocks the calling thread. From async code use [`drain`](Self::drain).
    pub fn shutdown(&self, timeout: Duration) {
        tracing::info!(?timeout, "shutting down executor");
        self.inner.executor.shutdown(timeout);
    }

    /// Async form of [`shutdown`](Self::shutdown): the wait runs on tokio's blocking pool so
    /// the caller's worker keeps serving other tasks.
    pub async fn drain(&self, timeout: Duration) {
        let engine = self.clone();
        if let Err(error) = tokio::task::spawn_blocking(move || engine.shutdown(timeout)).await {
            tracing::error!(%error, "executor drain did not finish");
        }
    }

    fn state(&self, method: &MethodKey) -> Result<Arc<MethodState>, ConfigError> {
        if let Some(state) = self.inner.methods.load().get(method) {
            return Ok(state.clone());
        }

        let _creating = self.inner.creating.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.inner.methods.load();
        if let Some(state) = current.get(method) {
            return Ok(state.clone());
        }

        let config = self.inner.resolver.resolve(method).unwrap_or_else(|| {
            tracing::warn!(method = %method, "no policies resolved; running unguarded");
            PolicyConfig::default()
        });
        let metrics = MethodMetrics::new(self.inner.sink.clone(), &self.inner.namespace, method);
        let state =
            Arc::new(MethodState::build(method.clone(), config, &metrics, self.inner.clock.clone())?);
        tracing::debug!(method = %state.key(), "method policies cached");

        let mut next = HashMap::clone(&current);
        next.insert(method.clone(), state.clone());
        self.inner.methods.store(Arc::new(next));
        Ok(state)
    }

    fn rejected<E>(&self, method: &MethodKey, error: ConfigError) -> FaultError<E> {
        tracing::error!(method = %method, %error, "invalid policy configuration");
        FaultError::Aborted { reason: format!("invalid policy configuration for {method}: {error}") }
    }
}

impl std::fmt::Debug for Safeguard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safeguard")
            .field("namespace", &self.inner.namespace)
            .field("methods", &self.inner.methods.load().len())
            .field("sink", &self.inner.sink)
            .field("executor", &self.inner.executor)
            .finish()
    }
}

/// Builder for [`Safeguard`]. Every collaborator has a default.
pub struct SafeguardBuilder {
    resolver: Arc<dyn PolicyResolver>,
    sink: Arc<dyn MetricsSink>,
    namespace: String,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    executor: Arc<dyn Executor>,
    fallbacks: HashMap<MethodKey, RegisteredFallback>,
}

impl Default for SafeguardBuilder {
    fn default() -> Self {
        Self {
            resolver: Arc::new(StaticPolicyResolver::new()),
            sink: Arc::new(NoMetrics),
            namespace: DEFAULT_NAMESPACE.to_string(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            executor: Arc::new(TokioExecutor::new()),
            fallbacks: HashMap::new(),
        }
    }
}

impl SafeguardBuilder {
    pub fn resolver<R: PolicyResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn shared_resolver(mut self, resolver: Arc<dyn PolicyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn metrics<M: MetricsSink + 'static>(mut self, sink: M) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Prefix of every metric name (`ft` by default).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Clock driving circuit breaker delays.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper used between retries.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn executor<X: Executor + 'static>(mut self, executor: X) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Recover failed calls to `method` with `fallback`.
    ///
    /// Applies to calls whose result and error types are `T` and `E`; calls with other types
    /// run without it. A later registration for the same method replaces an earlier one.
    pub fn fallback<T, E>(mut self, method: &MethodKey, fallback: FallbackPolicy<T, E>) -> Self
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        self.fallbacks.insert(method.clone(), Arc::new(fallback));
        self
    }

    pub fn build(self) -> Safeguard {
        Safeguard {
            inner: Arc::new(Inner {
                resolver: self.resolver,
                sink: self.sink,
                namespace: self.namespace,
                clock: self.clock,
                sleeper: self.sleeper,
                executor: self.executor,
                fallbacks: self.fallbacks,
                methods: ArcSwap::from_pointee(HashMap::new()),
                creating: Mutex::new(()),
            }),
        }
    }
}
