//! Metrics recording interface and the per-method metric groups built on it.
//!
//! The engine only consumes [`MetricsSink`]; a backend supplies counters, gauges and
//! histograms by name. Metric names are `<namespace>.<owner>.<method>.<suffix>`, e.g.
//! `ft.acme.Inventory.reserve.invocations.total`.
//!
//! Sinks provided here:
//! - [`NoMetrics`]: default; every instrument is a no-op.
//! - [`InMemoryMetrics`]: keeps everything in process and can be queried by name, which is what
//!   the tests and small deployments use.

use hdrhistogram::Histogram as Hdr;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::MethodKey;

/// Default metric namespace.
pub const DEFAULT_NAMESPACE: &str = "ft";

/// Monotonic counter.
pub trait Counter: Send + Sync {
    fn inc(&self);
    fn count(&self) -> u64;
}

/// Distribution of recorded values (durations are recorded in nanoseconds).
pub trait Histogram: Send + Sync {
    fn record(&self, value: u64);
}

/// Read-on-demand gauge value.
pub type GaugeSupplier = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Backend that creates named instruments.
///
/// `counter` and `histogram` are get-or-create: asking twice for the same name returns the
/// same instrument. `gauge` registers a supplier the backend reads when it reports.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn counter(&self, name: &str, description: &str) -> Arc<dyn Counter>;
    fn gauge(&self, name: &str, description: &str, unit: &str, supplier: GaugeSupplier);
    fn histogram(&self, name: &str, description: &str, unit: &str) -> Arc<dyn Histogram>;
}

#[derive(Debug, Default, Clone, Copy)]
struct NoopCounter;

impl Counter for NoopCounter {
    fn inc(&self) {}
    fn count(&self) -> u64 {
        0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NoopHistogram;

impl Histogram for NoopHistogram {
    fn record(&self, _value: u64) {}
}

fn noop_counter() -> Arc<dyn Counter> {
    Arc::new(NoopCounter)
}

fn noop_histogram() -> Arc<dyn Histogram> {
    Arc::new(NoopHistogram)
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn counter(&self, _name: &str, _description: &str) -> Arc<dyn Counter> {
        noop_counter()
    }

    fn gauge(&self, _name: &str, _description: &str, _unit: &str, _supplier: GaugeSupplier) {}

    fn histogram(&self, _name: &str, _description: &str, _unit: &str) -> Arc<dyn Histogram> {
        noop_histogram()
    }
}

#[derive(Debug, Default)]
struct AtomicCounter(AtomicU64);

impl Counter for AtomicCounter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

struct HdrRecorder(Mutex<Hdr<u64>>);

impl Histogram for HdrRecorder {
    fn record(&self, value: u64) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).saturating_record(value);
    }
}

/// Snapshot of an in-memory histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p99: u64,
}

/// In-process sink, queryable by metric name.
#[derive(Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<RwLock<HashMap<String, Arc<AtomicCounter>>>>,
    gauges: Arc<RwLock<HashMap<String, GaugeSupplier>>>,
    histograms: Arc<RwLock<HashMap<String, Arc<HdrRecorder>>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, `None` if it was never created.
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        self.counters.read().unwrap_or_else(PoisonError::into_inner).get(name).map(|c| c.count())
    }

    /// Read a gauge through its supplier.
    pub fn gauge_value(&self, name: &str) -> Option<u64> {
        let supplier =
            self.gauges.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()?;
        Some(supplier())
    }

    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        let recorder =
            self.histograms.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()?;
        let hist = recorder.0.lock().unwrap_or_else(PoisonError::into_inner);
        Some(HistogramSummary {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p99: hist.value_at_quantile(0.99),
        })
    }

    /// Every registered metric name starting with `prefix`, sorted.
    pub fn names(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        names.extend(
            self.counters.read().unwrap_or_else(PoisonError::into_inner).keys().cloned(),
        );
        names.extend(self.gauges.read().unwrap_or_else(PoisonError::into_inner).keys().cloned());
        names.extend(
            self.histograms.read().unwrap_or_else(PoisonError::into_inner).keys().cloned(),
        );
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        names.dedup();
        names
    }
}

impl fmt::Debug for InMemoryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetrics").field("metrics", &self.names("").len()).finish()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, _description: &str) -> Arc<dyn Counter> {
        if let Some(existing) = self.counters.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return existing.clone();
        }
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string()).or_default().clone()
    }

    fn gauge(&self, name: &str, _description: &str, _unit: &str, supplier: GaugeSupplier) {
        let mut map = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        if map.insert(name.to_string(), supplier).is_some() {
            tracing::warn!(gauge = name, "gauge supplier replaced");
        }
    }

    fn histogram(&self, name: &str, _description: &str, _unit: &str) -> Arc<dyn Histogram> {
        if let Some(existing) =
            self.histograms.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return existing.clone();
        }
        let mut map = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        match Hdr::<u64>::new(3) {
            Ok(hist) => {
                let recorder = Arc::new(HdrRecorder(Mutex::new(hist)));
                map.insert(name.to_string(), recorder.clone());
                recorder as Arc<dyn Histogram>
            }
            Err(e) => {
                tracing::warn!(histogram = name, error = %e, "histogram unavailable");
                noop_histogram()
            }
        }
    }
}

pub(crate) fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Builds the metric names of one guarded method against a sink.
#[derive(Clone)]
pub struct MethodMetrics {
    sink: Arc<dyn MetricsSink>,
    prefix: String,
}

impl MethodMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>, namespace: &str, method: &MethodKey) -> Self {
        let prefix = if namespace.is_empty() {
            method.qualified().to_string()
        } else {
            format!("{namespace}.{}", method.qualified())
        };
        Self { sink, prefix }
    }

    /// Instruments for a method nobody observes.
    pub fn noop(method: &MethodKey) -> Self {
        Self::new(Arc::new(NoMetrics), DEFAULT_NAMESPACE, method)
    }

    /// Full metric name for `suffix`.
    pub fn name(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    fn counter(&self, suffix: &str, description: &str) -> Arc<dyn Counter> {
        self.sink.counter(&self.name(suffix), description)
    }

    fn histogram(&self, suffix: &str, description: &str) -> Arc<dyn Histogram> {
        self.sink.histogram(&self.name(suffix), description, "nanoseconds")
    }

    pub(crate) fn gauge(&self, suffix: &str, description: &str, unit: &str, supplier: GaugeSupplier) {
        self.sink.gauge(&self.name(suffix), description, unit, supplier);
    }

    pub fn invocations(&self) -> InvocationMetrics {
        InvocationMetrics {
            total: self.counter("invocations.total", "Invocations of the guarded method"),
            failed: self.counter(
                "invocations.failed.total",
                "Invocations whose final outcome was a failure",
            ),
        }
    }

    pub fn retry(&self) -> RetryMetrics {
        RetryMetrics {
            succeeded_not_retried: self.counter(
                "retry.callsSucceededNotRetried.total",
                "Calls that succeeded on the first attempt",
            ),
            succeeded_retried: self.counter(
                "retry.callsSucceededRetried.total",
                "Calls that succeeded after at least one retry",
            ),
            failed: self.counter("retry.callsFailed.total", "Calls that failed after retrying"),
            retries: self.counter("retry.retries.total", "Re-attempts performed"),
        }
    }

    pub fn timeout(&self) -> TimeoutMetrics {
        TimeoutMetrics {
            timed_out: self.counter("timeout.callsTimedOut.total", "Attempts that timed out"),
            not_timed_out: self.counter(
                "timeout.callsNotTimedOut.total",
                "Attempts that completed within the deadline",
            ),
            duration: self.histogram("timeout.executionDuration", "Attempt duration"),
        }
    }

    pub fn circuit_breaker(&self) -> BreakerMetrics {
        BreakerMetrics {
            succeeded: self.counter(
                "circuitbreaker.callsSucceeded.total",
                "Calls that ran and were recorded as successes",
            ),
            failed: self.counter(
                "circuitbreaker.callsFailed.total",
                "Calls that ran and were recorded as failures",
            ),
            prevented: self.counter(
                "circuitbreaker.callsPrevented.total",
                "Calls rejected by the breaker",
            ),
            opened: self.counter("circuitbreaker.opened.total", "Transitions into open"),
        }
    }

    pub fn bulkhead(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            accepted: self.counter("bulkhead.callsAccepted.total", "Calls admitted"),
            rejected: self.counter("bulkhead.callsRejected.total", "Calls rejected"),
            execution: self.histogram("bulkhead.executionDuration", "Time holding a slot"),
            waiting: self.histogram("bulkhead.waiting.duration", "Time spent queued"),
        }
    }

    pub fn fallback(&self) -> FallbackMetrics {
        FallbackMetrics { calls: self.counter("fallback.calls.total", "Fallback invocations") }
    }
}

impl fmt::Debug for MethodMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMetrics").field("prefix", &self.prefix).finish()
    }
}

#[derive(Clone)]
pub struct InvocationMetrics {
    pub total: Arc<dyn Counter>,
    pub failed: Arc<dyn Counter>,
}

#[derive(Clone)]
pub struct RetryMetrics {
    pub succeeded_not_retried: Arc<dyn Counter>,
    pub succeeded_retried: Arc<dyn Counter>,
    pub failed: Arc<dyn Counter>,
    pub retries: Arc<dyn Counter>,
}

impl RetryMetrics {
    pub fn noop() -> Self {
        Self {
            succeeded_not_retried: noop_counter(),
            succeeded_retried: noop_counter(),
            failed: noop_counter(),
            retries: noop_counter(),
        }
    }
}

#[derive(Clone)]
pub struct TimeoutMetrics {
    pub timed_out: Arc<dyn Counter>,
    pub not_timed_out: Arc<dyn Counter>,
    pub duration: Arc<dyn Histogram>,
}

impl TimeoutMetrics {
    pub fn noop() -> Self {
        Self { timed_out: noop_counter(), not_timed_out: noop_counter(), duration: noop_histogram() }
    }
}

#[derive(Clone)]
pub struct BreakerMetrics {
    pub succeeded: Arc<dyn Counter>,
    pub failed: Arc<dyn Counter>,
    pub prevented: Arc<dyn Counter>,
    pub opened: Arc<dyn Counter>,
}

impl BreakerMetrics {
    pub fn noop() -> Self {
        Self {
            succeeded: noop_counter(),
            failed: noop_counter(),
            prevented: noop_counter(),
            opened: noop_counter(),
        }
    }
}

#[derive(Clone)]
pub struct BulkheadMetrics {
    pub accepted: Arc<dyn Counter>,
    pub rejected: Arc<dyn Counter>,
    pub execution: Arc<dyn Histogram>,
    pub waiting: Arc<dyn Histogram>,
}

impl BulkheadMetrics {
    pub fn noop() -> Self {
        Self {
            accepted: noop_counter(),
            rejected: noop_counter(),
            execution: noop_histogram(),
            waiting: noop_histogram(),
        }
    }
}

#[derive(Clone)]
pub struct FallbackMetrics {
    pub calls: Arc<dyn Counter>,
}

impl FallbackMetrics {
    pub fn noop() -> Self {
        Self { calls: noop_counter() }
    }
}
