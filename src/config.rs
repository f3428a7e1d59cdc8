//! Per-method policy configuration and the resolver that supplies it.
//!
//! A [`PolicyConfig`] is plain data: one optional section per policy. It is resolved once per
//! guarded method through a [`PolicyResolver`] and cached by the engine, so resolvers are never
//! consulted on the hot path.
//!
//! Defaults match the usual fault-tolerance annotations:
//!
//! | policy          | defaults |
//! |-----------------|----------|
//! | retry           | 3 retries, 0ms delay, 180s max duration, 200ms jitter |
//! | circuit breaker | volume 20, ratio 0.5, 5s delay, 1 success to close |
//! | bulkhead        | 10 concurrent, 10 waiting |
//! | timeout         | 1000ms |
//!
//! ```
//! use safeguard::config::{PolicyConfig, RetryConfig, TimeoutConfig};
//! use std::time::Duration;
//!
//! let cfg = PolicyConfig::new()
//!     .with_retry(RetryConfig::default().max_retries(1).jitter(Duration::ZERO))
//!     .with_timeout(TimeoutConfig::new(Duration::from_millis(250)));
//! assert!(cfg.validate().is_ok());
//! ```

use crate::{ConfigError, FailureCategory, MethodKey};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[cfg(feature = "serde")]
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Retry section. `max_retries = -1` means unbounded (bounded only by `max_duration`);
/// `max_duration = 0` means no duration bound.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RetryConfig {
    pub max_retries: i32,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub delay: Duration,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub max_duration: Duration,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub jitter: Duration,
    pub retry_on: Vec<FailureCategory>,
    pub abort_on: Vec<FailureCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::ZERO,
            max_duration: Duration::from_secs(180),
            jitter: Duration::from_millis(200),
            retry_on: vec![FailureCategory::Application, FailureCategory::Timeout],
            abort_on: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on(mut self, categories: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.retry_on = categories.into_iter().collect();
        self
    }

    pub fn abort_on(mut self, categories: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.abort_on = categories.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < -1 {
            return Err(ConfigError::out_of_range("retry", "max_retries", ">= -1", self.max_retries));
        }
        if self.max_retries == -1 && self.max_duration.is_zero() {
            return Err(ConfigError::out_of_range(
                "retry",
                "max_duration",
                "> 0 when max_retries is unbounded",
                format!("{:?}", self.max_duration),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker section.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct CircuitBreakerConfig {
    /// Size of the rolling window; no decision is made before it fills.
    pub request_volume_threshold: usize,
    /// Failure share of the window, in `[0, 1]`, at which the breaker opens.
    pub failure_ratio: f64,
    /// Time spent open before a half-open trial is allowed.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub delay: Duration,
    /// Consecutive half-open successes needed to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            delay: Duration::from_secs(5),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn request_volume_threshold(mut self, n: usize) -> Self {
        self.request_volume_threshold = n;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_volume_threshold == 0 {
            return Err(ConfigError::out_of_range(
                "circuit_breaker",
                "request_volume_threshold",
                ">= 1",
                self.request_volume_threshold,
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(ConfigError::out_of_range(
                "circuit_breaker",
                "failure_ratio",
                "within [0, 1]",
                self.failure_ratio,
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::out_of_range(
                "circuit_breaker",
                "success_threshold",
                ">= 1",
                self.success_threshold,
            ));
        }
        Ok(())
    }
}

/// Bulkhead section. `waiting_task_queue` only applies to asynchronously dispatched calls.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub waiting_task_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, waiting_task_queue: 10 }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent, ..Self::default() }
    }

    pub fn waiting_task_queue(mut self, queue: usize) -> Self {
        self.waiting_task_queue = queue;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::out_of_range(
                "bulkhead",
                "max_concurrent",
                ">= 1",
                self.max_concurrent,
            ));
        }
        Ok(())
    }
}

/// Timeout section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimeoutConfig {
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { duration: Duration::from_millis(1000) }
    }
}

impl TimeoutConfig {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::out_of_range("timeout", "duration", "> 0", "0ms"));
        }
        Ok(())
    }
}

/// What a declared timeout bounds when retry is declared alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TimeoutScope {
    /// Each attempt gets its own deadline.
    #[default]
    PerAttempt,
    /// One deadline covers every attempt and the delays between them.
    WholeBudget,
}

/// All policies declared for one guarded method.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct PolicyConfig {
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub timeout: Option<TimeoutConfig>,
    /// Dispatch every call on the executor.
    pub asynchronous: bool,
    pub timeout_scope: TimeoutScope,
}

impl PolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn timeout_scope(mut self, scope: TimeoutScope) -> Self {
        self.timeout_scope = scope;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        Ok(())
    }
}

/// Supplies the policies in effect for a guarded method.
pub trait PolicyResolver: Send + Sync {
    /// `None` means the method is unguarded: it runs with invocation metrics only.
    fn resolve(&self, method: &MethodKey) -> Option<PolicyConfig>;
}

impl<F> PolicyResolver for F
where
    F: Fn(&MethodKey) -> Option<PolicyConfig> + Send + Sync,
{
    fn resolve(&self, method: &MethodKey) -> Option<PolicyConfig> {
        self(method)
    }
}

/// In-memory resolver keyed by qualified method name, falling back to the owner's entry.
#[derive(Debug, Default)]
pub struct StaticPolicyResolver {
    entries: RwLock<HashMap<String, PolicyConfig>>,
}

impl StaticPolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policies for one method.
    pub fn method(self, method: &MethodKey, config: PolicyConfig) -> Self {
        self.insert(method.qualified(), config);
        self
    }

    /// Policies for every method of `owner` without a method-level entry.
    pub fn owner(self, owner: &str, config: PolicyConfig) -> Self {
        self.insert(owner, config);
        self
    }

    /// Add or replace an entry. Engines that already cached the method keep the old policies
    /// until `Safeguard::reconfigure` is called for it.
    pub fn insert(&self, name: impl Into<String>, config: PolicyConfig) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(name.into(), config);
    }

    /// Load a JSON object mapping qualified method (or owner) names to policy documents.
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let entries: HashMap<String, PolicyConfig> =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        for config in entries.values() {
            config.validate()?;
        }
        Ok(Self { entries: RwLock::new(entries) })
    }
}

impl PolicyResolver for StaticPolicyResolver {
    fn resolve(&self, method: &MethodKey) -> Option<PolicyConfig> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(method.qualified()).or_else(|| entries.get(method.owner())).cloned()
    }
}
