//! The unit of work handed to an execution plan.
//!
//! An [`InvocationContext`] bundles three things: the identity of the guarded method (selects the
//! shared breaker/bulkhead state and metrics), the operation itself (re-invocable, since retries
//! run it again), and a per-call [`Attributes`] side channel that policies use to share what
//! happened during this one invocation.

use crate::FaultError;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Stable identity of a guarded method, shared by every call to it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    owner: Arc<str>,
    name: Arc<str>,
    qualified: Arc<str>,
}

impl MethodKey {
    /// Key for `name` declared on `owner` (a type or module path).
    pub fn new(owner: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        let owner = owner.as_ref();
        let name = name.as_ref();
        let qualified = if owner.is_empty() { name.to_string() } else { format!("{owner}.{name}") };
        Self { owner: Arc::from(owner), name: Arc::from(name), qualified: Arc::from(qualified) }
    }

    /// Split `a.b.Owner.method` at the last dot.
    pub fn parse(qualified: &str) -> Self {
        match qualified.rsplit_once('.') {
            Some((owner, name)) => Self::new(owner, name),
            None => Self::new("", qualified),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `owner.name`, used in metric names and logs.
    pub fn qualified(&self) -> &str {
        &self.qualified
    }

    pub(crate) fn qualified_arc(&self) -> Arc<str> {
        self.qualified.clone()
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified)
    }
}

impl fmt::Debug for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodKey").field(&self.qualified).finish()
    }
}

#[derive(Debug, Default)]
struct AttributesInner {
    attempts: AtomicU32,
    cancelled: AtomicBool,
    elapsed: Mutex<Option<Duration>>,
    last_failure: Mutex<Option<String>>,
    values: Mutex<HashMap<String, String>>,
}

/// Per-call side channel shared by the policies of one invocation.
///
/// Clones observe the same call. Never shared between invocations.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    inner: Arc<AttributesInner>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started so far (1 after the initial attempt).
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        self.inner.cancelled.store(false, Ordering::Release);
        self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the in-flight attempt has been abandoned by its deadline.
    ///
    /// Blocking work can poll this to stop early; async work is simply dropped.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Wall time the whole invocation took, set once the plan finishes.
    pub fn elapsed(&self) -> Option<Duration> {
        *self.inner.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_elapsed(&self, elapsed: Duration) {
        *self.inner.elapsed.lock().unwrap_or_else(PoisonError::into_inner) = Some(elapsed);
    }

    /// Rendered message of the most recent failed attempt.
    pub fn last_failure(&self) -> Option<String> {
        self.inner.last_failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_last_failure(&self, failure: String) {
        *self.inner.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }

    /// Attach a free-form value for later policies (e.g. a fallback handler).
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.values.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }
}

/// Re-invocable guarded operation. Each call yields a fresh attempt future.
pub type Operation<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, FaultError<E>>> + Send + Sync>;

/// How the caller wants the plan to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Run in the caller's task.
    #[default]
    Inline,
    /// Run on the plan's executor; the caller only awaits the handle.
    Async,
}

/// A single guarded call: method identity, work, and per-call attributes.
///
/// Created fresh per call and consumed by exactly one plan execution.
pub struct InvocationContext<T, E> {
    method: MethodKey,
    operation: Operation<T, E>,
    attributes: Attributes,
    arguments: Option<Arc<dyn Any + Send + Sync>>,
    dispatch: Dispatch,
}

impl<T, E> InvocationContext<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wrap an async operation returning the method's own error type.
    ///
    /// The closure must be lazy: all work belongs in the returned future.
    pub fn new<F, Fut>(method: MethodKey, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_operation(
            method,
            Arc::new(move || {
                let attempt = operation();
                Box::pin(async move { attempt.await.map_err(FaultError::Inner) })
            }),
        )
    }

    /// Wrap an operation that already speaks `FaultError` (e.g. a nested plan).
    pub fn fallible<F, Fut>(method: MethodKey, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FaultError<E>>> + Send + 'static,
    {
        Self::from_operation(method, Arc::new(move || Box::pin(operation())))
    }

    /// Wrap blocking work. Each attempt runs on tokio's blocking pool, so a deadline can
    /// abandon it without stalling the caller; a late result is discarded.
    pub fn blocking<F>(method: MethodKey, operation: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);
        Self::from_operation(
            method,
            Arc::new(move || {
                let operation = operation.clone();
                Box::pin(async move {
                    match tokio::task::spawn_blocking(move || operation()).await {
                        Ok(result) => result.map_err(FaultError::Inner),
                        Err(join) => Err(FaultError::Aborted { reason: join.to_string() }),
                    }
                })
            }),
        )
    }

    fn from_operation(method: MethodKey, operation: Operation<T, E>) -> Self {
        Self {
            method,
            operation,
            attributes: Attributes::new(),
            arguments: None,
            dispatch: Dispatch::Inline,
        }
    }

    /// Attach the call's arguments, opaque to the engine but visible to fallback handlers.
    pub fn with_arguments<A: Any + Send + Sync>(mut self, arguments: A) -> Self {
        self.arguments = Some(Arc::new(arguments));
        self
    }

    /// Request asynchronous dispatch for this call.
    pub fn asynchronous(mut self) -> Self {
        self.dispatch = Dispatch::Async;
        self
    }
}

impl<T, E> InvocationContext<T, E> {
    pub fn method(&self) -> &MethodKey {
        &self.method
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_asynchronous(&self) -> bool {
        self.dispatch == Dispatch::Async
    }

    pub(crate) fn into_parts(self) -> InvocationParts<T, E> {
        InvocationParts {
            method: self.method,
            operation: self.operation,
            attributes: self.attributes,
            arguments: self.arguments,
        }
    }
}

impl<T, E> fmt::Debug for InvocationContext<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("method", &self.method)
            .field("attributes", &self.attributes)
            .field("dispatch", &self.dispatch)
            .field("arguments", &self.arguments.is_some())
            .finish()
    }
}

pub(crate) struct InvocationParts<T, E> {
    pub(crate) method: MethodKey,
    pub(crate) operation: Operation<T, E>,
    pub(crate) attributes: Attributes,
    pub(crate) arguments: Option<Arc<dyn Any + Send + Sync>>,
}
