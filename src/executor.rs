//! Where asynchronously dispatched invocations run.
//!
//! [`TokioExecutor`] spawns onto the ambient runtime and is the default. [`DedicatedExecutor`]
//! owns its own multi-thread runtime so guarded work cannot starve the host's tasks, and can be
//! drained with [`Executor::shutdown`] or, from async code, [`Safeguard::drain`]. Callers get an
//! [`AsyncHandle`] either way.
//!
//! [`Safeguard::drain`]: crate::Safeguard::drain

use crate::FaultError;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;

/// Runs dispatched pipelines. Injectable by the host.
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Start `task`. An executor that cannot run it drops it, which the caller's handle reports
    /// as [`FaultError::Aborted`].
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Stop accepting work and wait up to `timeout` for running tasks.
    ///
    /// May block the calling thread for up to `timeout`. Async callers should go through
    /// [`Safeguard::drain`](crate::Safeguard::drain).
    fn shutdown(&self, _timeout: Duration) {}
}

/// Spawns onto a tokio runtime: the one given, or the caller's.
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always spawn onto `handle`, whatever runtime the caller is on.
    pub fn with_handle(handle: Handle) -> Self {
        Self { handle: Some(handle) }
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    tracing::warn!("no tokio runtime available; dropping dispatched invocation");
                    return;
                }
            },
        };
        handle.spawn(task);
    }
}

/// Executor owning a dedicated multi-thread runtime.
pub struct DedicatedExecutor {
    runtime: Mutex<Option<Runtime>>,
}

impl DedicatedExecutor {
    /// Build a runtime with `worker_threads` workers (at least one).
    pub fn new(worker_threads: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("safeguard-worker")
            .enable_all()
            .build()?;
        Ok(Self { runtime: Mutex::new(Some(runtime)) })
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl Executor for DedicatedExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        match self.runtime.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(runtime) => {
                runtime.spawn(task);
            }
            None => tracing::warn!("executor is shut down; dropping dispatched invocation"),
        }
    }

    fn shutdown(&self, timeout: Duration) {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(runtime) = runtime else { return };
        // a runtime cannot be torn down from inside async code
        let joined = std::thread::Builder::new()
            .name("safeguard-shutdown".into())
            .spawn(move || runtime.shutdown_timeout(timeout))
            .map(|thread| thread.join());
        match joined {
            Ok(Ok(())) => tracing::debug!(?timeout, "dedicated executor drained"),
            Ok(Err(_)) => tracing::error!("dedicated executor shutdown panicked"),
            Err(error) => tracing::error!(%error, "could not start executor shutdown thread"),
        }
    }
}

impl Drop for DedicatedExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for DedicatedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedExecutor").field("shut_down", &self.is_shut_down()).finish()
    }
}

/// Pending result of a dispatched invocation.
///
/// Resolves once the whole pipeline, retries included, has finished. A task that never
/// reports back (panicked, dropped, executor gone) resolves to [`FaultError::Aborted`].
#[must_use = "dropping the handle discards the result, the invocation still runs"]
pub struct AsyncHandle<T, E> {
    receiver: oneshot::Receiver<Result<T, FaultError<E>>>,
}

impl<T, E> AsyncHandle<T, E> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, FaultError<E>>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }
}

impl<T, E> Future for AsyncHandle<T, E> {
    type Output = Result<T, FaultError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FaultError::Aborted {
                reason: "dispatched invocation ended without a result".into(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> std::fmt::Debug for AsyncHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle").finish_non_exhaustive()
    }
}
