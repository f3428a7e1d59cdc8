#![allow(dead_code)]

use safeguard::config::PolicyConfig;
use safeguard::{InMemoryMetrics, InstantSleeper, ManualClock, MethodKey, Safeguard, StaticPolicyResolver};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Engine guarding `key` with `policies`, recording into `metrics`, never sleeping between retries.
pub fn engine(key: &MethodKey, policies: PolicyConfig, metrics: &InMemoryMetrics) -> Safeguard {
    Safeguard::builder()
        .resolver(StaticPolicyResolver::new().method(key, policies))
        .metrics(metrics.clone())
        .sleeper(InstantSleeper)
        .build()
}

/// Same as [`engine`] with breaker time driven by `clock`.
pub fn engine_with_clock(
    key: &MethodKey,
    policies: PolicyConfig,
    metrics: &InMemoryMetrics,
    clock: &ManualClock,
) -> Safeguard {
    Safeguard::builder()
        .resolver(StaticPolicyResolver::new().method(key, policies))
        .metrics(metrics.clone())
        .sleeper(InstantSleeper)
        .clock(clock.clone())
        .build()
}

pub fn counter(metrics: &InMemoryMetrics, key: &MethodKey, suffix: &str) -> u64 {
    metrics.counter_value(&format!("ft.{}.{suffix}", key.qualified())).unwrap_or(0)
}

/// In-memory log sink for `tracing_subscriber::fmt`.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
