//! Prometheus metrics sink for `safeguard`.
//! Bring your own `prometheus::Registry`; instruments are registered on first use.
//!
//! Metric names are sanitized for Prometheus: every character outside `[a-zA-Z0-9_:]` becomes
//! `_`, so `ft.billing.charge.invocations.total` is exported as
//! `ft_billing_charge_invocations_total`. Histograms recorded in nanoseconds are exported in
//! seconds with a `_seconds` suffix. Gauges are read from their suppliers on [`PrometheusMetrics::gather`].

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use safeguard::metrics::{Counter, GaugeSupplier, Histogram};
use safeguard::MetricsSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Buckets for attempt and slot durations, in seconds.
const DURATION_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

struct PromCounter(IntCounter);

impl Counter for PromCounter {
    fn inc(&self) {
        self.0.inc();
    }

    fn count(&self) -> u64 {
        self.0.get()
    }
}

struct PromHistogram {
    histogram: prometheus::Histogram,
    scale: f64,
}

impl Histogram for PromHistogram {
    fn record(&self, value: u64) {
        self.histogram.observe(value as f64 / self.scale);
    }
}

struct SuppliedGauge {
    gauge: IntGauge,
    supplier: GaugeSupplier,
}

#[derive(Default)]
struct Instruments {
    counters: HashMap<String, Arc<PromCounter>>,
    histograms: HashMap<String, Arc<PromHistogram>>,
    gauges: HashMap<String, SuppliedGauge>,
}

/// [`MetricsSink`] registering into a Prometheus registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    instruments: Arc<Mutex<Instruments>>,
}

impl PrometheusMetrics {
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Self {
        Self { registry: registry.into(), instruments: Arc::default() }
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Refresh gauges from their suppliers, then gather every registered family.
    pub fn gather(&self) -> Vec<MetricFamily> {
        {
            let instruments = self.lock();
            for gauge in instruments.gauges.values() {
                gauge.gauge.set(i64::try_from((gauge.supplier)()).unwrap_or(i64::MAX));
            }
        }
        self.registry.gather()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instruments> {
        self.instruments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<C: Collector + Clone + 'static>(&self, name: &str, collector: &C) {
        if let Err(error) = self.registry.register(Box::new(collector.clone())) {
            tracing::warn!(metric = name, %error, "metric not exported");
        }
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instruments = self.lock();
        f.debug_struct("PrometheusMetrics")
            .field("counters", &instruments.counters.len())
            .field("gauges", &instruments.gauges.len())
            .field("histograms", &instruments.histograms.len())
            .finish()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn counter(&self, name: &str, description: &str) -> Arc<dyn Counter> {
        let name = sanitize(name);
        let mut instruments = self.lock();
        if let Some(existing) = instruments.counters.get(&name) {
            return existing.clone();
        }
        let counter = match IntCounter::with_opts(Opts::new(name.clone(), help(description))) {
            Ok(counter) => counter,
            Err(error) => {
                tracing::warn!(metric = %name, %error, "invalid counter");
                return Arc::new(NoopInstrument);
            }
        };
        self.register(&name, &counter);
        let counter = Arc::new(PromCounter(counter));
        instruments.counters.insert(name, counter.clone());
        counter
    }

    fn gauge(&self, name: &str, description: &str, _unit: &str, supplier: GaugeSupplier) {
        let name = sanitize(name);
        let mut instruments = self.lock();
        if let Some(existing) = instruments.gauges.get_mut(&name) {
            tracing::warn!(metric = %name, "gauge supplier replaced");
            existing.supplier = supplier;
            return;
        }
        match IntGauge::with_opts(Opts::new(name.clone(), help(description))) {
            Ok(gauge) => {
                self.register(&name, &gauge);
                instruments.gauges.insert(name, SuppliedGauge { gauge, supplier });
            }
            Err(error) => tracing::warn!(metric = %name, %error, "invalid gauge"),
        }
    }

    fn histogram(&self, name: &str, description: &str, unit: &str) -> Arc<dyn Histogram> {
        let (name, scale) = match unit {
            "nanoseconds" => (format!("{}_seconds", sanitize(name)), NANOS_PER_SECOND),
            _ => (sanitize(name), 1.0),
        };
        let mut instruments = self.lock();
        if let Some(existing) = instruments.histograms.get(&name) {
            return existing.clone();
        }
        let opts = HistogramOpts::new(name.clone(), help(description)).buckets(DURATION_BUCKETS.to_vec());
        let histogram = match prometheus::Histogram::with_opts(opts) {
            Ok(histogram) => histogram,
            Err(error) => {
                tracing::warn!(metric = %name, %error, "invalid histogram");
                return Arc::new(NoopInstrument);
            }
        };
        self.register(&name, &histogram);
        let histogram = Arc::new(PromHistogram { histogram, scale });
        instruments.histograms.insert(name, histogram.clone());
        histogram
    }
}

struct NoopInstrument;

impl Counter for NoopInstrument {
    fn inc(&self) {}

    fn count(&self) -> u64 {
        0
    }
}

impl Histogram for NoopInstrument {
    fn record(&self, _value: u64) {}
}

/// Map a dotted metric name onto the Prometheus name alphabet.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn help(description: &str) -> String {
    if description.is_empty() {
        "safeguard metric".to_string()
    } else {
        description.to_string()
    }
}
