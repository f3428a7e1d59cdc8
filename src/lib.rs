#![forbid(unsafe_code)]
#![cfg_attr(not(test), warn(clippy::all))]

//! # safeguard
//!
//! Fault-tolerance execution engine for async Rust. Each guarded method gets one execution plan
//! composing the policies declared for it:
//!
//! - **Bulkhead**: bounded concurrency, with an optional waiting queue for dispatched calls
//! - **Circuit breaker**: rolling failure ratio, timed open state, single half-open trial
//! - **Timeout**: per attempt or over the whole retry budget
//! - **Retry**: bounded by count and duration, with backoff, jitter and failure classification
//! - **Fallback**: a substitute result once everything else has failed
//! - **Asynchronous dispatch** onto an injectable executor
//!
//! Policy state is shared per method and every boundary reports counters, gauges and
//! histograms named `ft.<owner>.<method>.*` into a pluggable [`MetricsSink`].
//!
//! ## Quick Start
//!
//! ```rust
//! use safeguard::config::{CircuitBreakerConfig, PolicyConfig, RetryConfig, StaticPolicyResolver, TimeoutConfig};
//! use safeguard::{InvocationContext, MethodKey, Safeguard};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let key = MethodKey::new("catalog", "price");
//!     let policies = PolicyConfig::new()
//!         .with_retry(RetryConfig::default().max_retries(2))
//!         .with_timeout(TimeoutConfig::new(Duration::from_millis(250)))
//!         .with_circuit_breaker(CircuitBreakerConfig::default());
//!     let engine = Safeguard::new(StaticPolicyResolver::new().method(&key, policies));
//!
//!     let price = engine
//!         .execute(InvocationContext::new(key, || async { Ok::<_, std::io::Error>(1299) }))
//!         .await;
//!     assert_eq!(price.unwrap(), 1299);
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod jitter;
pub mod metrics;
pub mod plan;
pub mod retry;
pub mod service;
pub mod time;
pub mod timeout;

// Re-exports
pub use backoff::Backoff;
pub use bulkhead::{BulkheadPermit, BulkheadPolicy};
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitState};
pub use config::{PolicyConfig, PolicyResolver, StaticPolicyResolver, TimeoutScope};
pub use context::{Attributes, Dispatch, InvocationContext, MethodKey};
pub use engine::{Safeguard, SafeguardBuilder};
pub use error::{BulkheadRejection, CircuitOpenRejection, ConfigError, FailureCategory, FaultError};
pub use executor::{AsyncHandle, DedicatedExecutor, Executor, TokioExecutor};
pub use fallback::{FallbackContext, FallbackHandler, FallbackPolicy};
pub use jitter::Jitter;
pub use metrics::{InMemoryMetrics, MethodMetrics, MetricsSink, NoMetrics};
pub use plan::ExecutionPlan;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use service::{GuardLayer, GuardedService};
pub use time::{
    Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper,
};
pub use timeout::{Deadline, TimeoutPolicy};
