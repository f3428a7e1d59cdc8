//! Bulkhead implementation for concurrency limiting
//!
//! Two admission modes share one semaphore:
//! - [`BulkheadPolicy::try_admit`] never waits: a full bulkhead rejects immediately. Used for
//!   calls awaited inline by their caller.
//! - [`BulkheadPolicy::admit`] lets up to `max_queue` callers wait for a slot. Used for
//!   asynchronously dispatched calls, where waiting does not hold up the caller.
//!
//! Every admission hands out a [`BulkheadPermit`]; dropping it is the only way to release the
//! slot, so release happens exactly once on success, failure, panic and cancellation alike.

use crate::metrics::{nanos, BulkheadMetrics, Histogram, MethodMetrics};
use crate::{BulkheadRejection, ConfigError, FaultError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
struct Shared {
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    admitted: AtomicU64,
    released: AtomicU64,
}

/// Concurrency gate for one guarded method. Clones share the same slots.
#[derive(Clone)]
pub struct BulkheadPolicy {
    shared: Arc<Shared>,
    max_concurrent: usize,
    max_queue: usize,
    metrics: BulkheadMetrics,
}

impl BulkheadPolicy {
    /// Semaphore bulkhead with no waiting queue.
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 || max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::out_of_range(
                "bulkhead",
                "max_concurrent",
                "within [1, Semaphore::MAX_PERMITS]",
                max_concurrent,
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
            max_concurrent,
            max_queue: 0,
            metrics: BulkheadMetrics::noop(),
        })
    }

    /// Allow up to `max_queue` callers of [`admit`](Self::admit) to wait for a slot.
    pub fn with_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn with_metrics(mut self, metrics: BulkheadMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Expose occupancy as gauges. Suppliers hold a weak reference, so a replaced bulkhead
    /// reads as empty instead of being kept alive by the sink.
    pub fn register_gauges(&self, metrics: &MethodMetrics) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        metrics.gauge(
            "bulkhead.concurrentExecutions",
            "Calls currently holding a bulkhead slot",
            "calls",
            Arc::new(move || {
                shared.upgrade().map_or(0, |s| s.in_flight.load(Ordering::Acquire) as u64)
            }),
        );
        if self.max_queue > 0 {
            let shared = Arc::downgrade(&self.shared);
            metrics.gauge(
                "bulkhead.waitingQueue.population",
                "Calls waiting for a bulkhead slot",
                "calls",
                Arc::new(move || {
                    shared.upgrade().map_or(0, |s| s.queued.load(Ordering::Acquire) as u64)
                }),
            );
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Total admissions since creation.
    pub fn admitted(&self) -> u64 {
        self.shared.admitted.load(Ordering::Acquire)
    }

    /// Total releases since creation. Equals [`admitted`](Self::admitted) once idle.
    pub fn released(&self) -> u64 {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Take a slot if one is free, otherwise reject without waiting.
    pub fn try_admit(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        match self.shared.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.on_admitted(permit)),
            Err(_) => Err(self.reject()),
        }
    }

    /// Take a slot, waiting in the bounded queue when none is free.
    ///
    /// Rejects when both the slots and the queue are full. A caller dropped while queued gives
    /// its queue position back.
    pub async fn admit(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        if let Ok(permit) = self.shared.semaphore.clone().try_acquire_owned() {
            return Ok(self.on_admitted(permit));
        }

        let mut queued = self.shared.queued.load(Ordering::Acquire);
        loop {
            if queued >= self.max_queue {
                return Err(self.reject());
            }
            match self.shared.queued.compare_exchange_weak(
                queued,
                queued + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => queued = actual,
            }
        }

        let slot = QueueSlot(&self.shared.queued);
        let waiting_since = Instant::now();
        let acquired = self.shared.semaphore.clone().acquire_owned().await;
        drop(slot);
        self.metrics.waiting.record(nanos(waiting_since.elapsed()));

        match acquired {
            Ok(permit) => Ok(self.on_admitted(permit)),
            // The semaphore is never closed while a policy references it.
            Err(_) => Err(self.reject()),
        }
    }

    /// Run `operation` inside a slot, rejecting immediately when full.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.try_admit()?;
        let result = operation().await;
        drop(permit);
        result
    }

    fn on_admitted(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.admitted.fetch_add(1, Ordering::AcqRel);
        self.metrics.accepted.inc();
        tracing::trace!(in_flight, max = self.max_concurrent, "bulkhead admitted call");
        BulkheadPermit {
            shared: self.shared.clone(),
            execution: self.metrics.execution.clone(),
            admitted_at: Instant::now(),
            _permit: permit,
        }
    }

    fn reject(&self) -> BulkheadRejection {
        let rejection = BulkheadRejection {
            in_flight: self.in_flight(),
            max: self.max_concurrent,
            queued: self.queued(),
        };
        self.metrics.rejected.inc();
        tracing::debug!(
            in_flight = rejection.in_flight,
            max = rejection.max,
            queued = rejection.queued,
            "bulkhead rejected call"
        );
        rejection
    }
}

impl std::fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPolicy")
            .field("max_concurrent", &self.max_concurrent)
            .field("max_queue", &self.max_queue)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A held bulkhead slot, released on drop.
pub struct BulkheadPermit {
    shared: Arc<Shared>,
    execution: Arc<dyn Histogram>,
    admitted_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        // Counters move before the semaphore permit (a later field) is returned.
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.shared.released.fetch_add(1, Ordering::AcqRel);
        self.execution.record(nanos(self.admitted_at.elapsed()));
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit").field("admitted_at", &self.admitted_at).finish()
    }
}
