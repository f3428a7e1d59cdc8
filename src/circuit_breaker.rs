//! Circuit breaker over a rolling window of call outcomes.
//!
//! One breaker exists per guarded method and is shared by every caller. All state lives behind
//! a single short-held mutex: each check-then-act step (admit, record outcome, transition) is
//! one critical section and no lock is held across an `.await`.
//!
//! - **Closed**: calls pass. Outcomes fill a window of the last `request_volume_threshold`
//!   calls; once full, a failure share `>= failure_ratio` opens the breaker.
//! - **Open**: calls are rejected without running. The first caller after `delay` becomes the
//!   half-open trial.
//! - **HalfOpen**: one trial at a time. `success_threshold` consecutive successes close the
//!   breaker; any failure reopens it.
//!
//! Admission returns a [`BreakerPermit`] stamped with the breaker's generation. Outcomes from a
//! permit issued before the latest transition are ignored, so a slow call admitted while closed
//! cannot move a breaker that has since opened.

use crate::config::CircuitBreakerConfig;
use crate::metrics::{BreakerMetrics, MethodMetrics};
use crate::time::{Clock, MonotonicClock};
use crate::{CircuitOpenRejection, ConfigError, FaultError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the delay elapses.
    Open,
    /// Probe mode: a single trial call tests recovery.
    HalfOpen,
}

impl CircuitState {
    fn index(self) -> usize {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    /// `true` marks a failure. Never longer than `request_volume_threshold`.
    window: VecDeque<bool>,
    failures: usize,
    opened_at: u64,
    entered_at: u64,
    half_open_successes: u32,
    trial_in_flight: bool,
    generation: u64,
    time_in_state: [u64; 3],
}

impl BreakerState {
    fn new(now: u64, capacity: usize) -> Self {
        Self {
            phase: CircuitState::Closed,
            window: VecDeque::with_capacity(capacity),
            failures: 0,
            opened_at: 0,
            entered_at: now,
            half_open_successes: 0,
            trial_in_flight: false,
            generation: 0,
            time_in_state: [0; 3],
        }
    }

    fn millis_in(&self, phase: CircuitState, now: u64) -> u64 {
        let mut total = self.time_in_state[phase.index()];
        if self.phase == phase {
            total = total.saturating_add(now.saturating_sub(self.entered_at));
        }
        total
    }
}

/// Per-method circuit breaker. Clones share the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<BreakerState>>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    metrics: BreakerMetrics,
    method: Arc<str>,
}

impl CircuitBreaker {
    /// Validate `config` and build a closed breaker.
    ///
    /// # Examples
    /// ```
    /// use safeguard::config::CircuitBreakerConfig;
    /// use safeguard::CircuitBreaker;
    /// use std::time::Duration;
    ///
    /// let breaker = CircuitBreaker::new(
    ///     CircuitBreakerConfig::default().request_volume_threshold(4).delay(Duration::from_secs(1)),
    /// )
    /// .unwrap();
    /// assert_eq!(breaker.state(), safeguard::CircuitState::Closed);
    /// ```
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            state: Arc::new(Mutex::new(BreakerState::new(
                clock.now_millis(),
                config.request_volume_threshold,
            ))),
            config: Arc::new(config),
            clock,
            metrics: BreakerMetrics::noop(),
            method: Arc::from("anonymous"),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        self.lock().entered_at = now;
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: BreakerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Name reported in rejections and logs.
    pub fn named(mut self, method: impl Into<Arc<str>>) -> Self {
        self.method = method.into();
        self
    }

    /// Expose nanoseconds spent in each state as gauges.
    pub fn register_gauges(&self, metrics: &MethodMetrics) {
        for (suffix, phase) in [
            ("circuitbreaker.open.total", CircuitState::Open),
            ("circuitbreaker.halfOpen.total", CircuitState::HalfOpen),
            ("circuitbreaker.closed.total", CircuitState::Closed),
        ] {
            let state: Weak<Mutex<BreakerState>> = Arc::downgrade(&self.state);
            let clock = self.clock.clone();
            metrics.gauge(
                suffix,
                "Time the breaker has spent in this state",
                "nanoseconds",
                Arc::new(move || {
                    state.upgrade().map_or(0, |s| {
                        let guard = s.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.millis_in(phase, clock.now_millis()).saturating_mul(1_000_000)
                    })
                }),
            );
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().phase
    }

    /// Force the breaker closed and forget the recorded window.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        if st.phase != CircuitState::Closed {
            self.transition(&mut st, CircuitState::Closed, now);
        } else {
            st.window.clear();
            st.failures = 0;
        }
    }

    /// Reject now if the breaker would certainly refuse the call, without claiming the trial.
    ///
    /// Lets callers fail fast before consuming other resources; [`acquire`](Self::acquire)
    /// remains the authoritative admission.
    pub fn precheck(&self) -> Result<(), CircuitOpenRejection> {
        let now = self.clock.now_millis();
        let st = self.lock();
        let refuse = match st.phase {
            CircuitState::Closed => false,
            CircuitState::Open => now.saturating_sub(st.opened_at) < self.delay_millis(),
            CircuitState::HalfOpen => st.trial_in_flight,
        };
        if refuse {
            return Err(self.reject(&st, now));
        }
        Ok(())
    }

    /// Admit a call, claiming the half-open trial slot when the delay has elapsed.
    ///
    /// The open→half-open transition and the trial claim happen under one lock, so exactly one
    /// of several racing callers becomes the trial.
    pub fn acquire(&self) -> Result<BreakerPermit, CircuitOpenRejection> {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        let phase = st.phase;
        let trial = match phase {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if now.saturating_sub(st.opened_at) < self.delay_millis() {
                    return Err(self.reject(&st, now));
                }
                self.transition(&mut st, CircuitState::HalfOpen, now);
                st.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    return Err(self.reject(&st, now));
                }
                st.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit { breaker: self.clone(), generation: st.generation, trial, settled: false })
    }

    /// Run `operation` if the breaker admits it and record its outcome.
    ///
    /// # Errors
    /// Returns `FaultError::CircuitOpen` without running the operation when the breaker is
    /// open or its trial slot is taken; otherwise returns the operation's own result.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FaultError<E>>
    where
        Fut: Future<Output = Result<T, FaultError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    fn record(&self, generation: u64, trial: bool, failed: bool) {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        if st.generation != generation {
            tracing::trace!(method = %self.method, "outcome from a previous breaker state ignored");
            return;
        }
        if failed {
            self.metrics.failed.inc();
        } else {
            self.metrics.succeeded.inc();
        }
        let phase = st.phase;
        match phase {
            CircuitState::Closed => {
                let threshold = self.config.request_volume_threshold;
                st.window.push_back(failed);
                if failed {
                    st.failures += 1;
                }
                while st.window.len() > threshold {
                    if st.window.pop_front() == Some(true) {
                        st.failures -= 1;
                    }
                }
                if st.window.len() >= threshold && st.failures > 0 {
                    let ratio = st.failures as f64 / threshold as f64;
                    if ratio >= self.config.failure_ratio {
                        tracing::error!(
                            method = %self.method,
                            failures = st.failures,
                            window = threshold,
                            ratio,
                            "circuit breaker opened"
                        );
                        self.transition(&mut st, CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen if trial => {
                st.trial_in_flight = false;
                if failed {
                    tracing::warn!(method = %self.method, "half-open trial failed, circuit reopened");
                    self.transition(&mut st, CircuitState::Open, now);
                } else {
                    st.half_open_successes += 1;
                    if st.half_open_successes >= self.config.success_threshold {
                        tracing::info!(method = %self.method, "circuit breaker closed");
                        self.transition(&mut st, CircuitState::Closed, now);
                    }
                }
            }
            _ => {}
        }
    }

    fn abandon_trial(&self, generation: u64) {
        let mut st = self.lock();
        if st.generation == generation && st.phase == CircuitState::HalfOpen {
            st.trial_in_flight = false;
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState, now: u64) {
        let from = st.phase;
        st.time_in_state[from.index()] =
            st.time_in_state[from.index()].saturating_add(now.saturating_sub(st.entered_at));
        st.phase = to;
        st.entered_at = now;
        st.generation += 1;
        st.half_open_successes = 0;
        st.trial_in_flight = false;
        match to {
            CircuitState::Open => {
                st.opened_at = now;
                self.metrics.opened.inc();
            }
            CircuitState::Closed => {
                st.window.clear();
                st.failures = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!(method = %self.method, "circuit breaker half-open");
            }
        }
    }

    fn reject(&self, st: &BreakerState, now: u64) -> CircuitOpenRejection {
        self.metrics.prevented.inc();
        tracing::debug!(method = %self.method, state = ?st.phase, "circuit breaker prevented call");
        CircuitOpenRejection {
            method: self.method.clone(),
            open_for: Duration::from_millis(now.saturating_sub(st.opened_at)),
        }
    }

    fn delay_millis(&self) -> u64 {
        u64::try_from(self.config.delay.as_millis()).unwrap_or(u64::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("method", &self.method)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

/// Admission ticket for one call. Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure); a trial permit dropped without an outcome frees the trial slot.
#[must_use = "report the call outcome or the breaker learns nothing"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, false);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, self.trial, true);
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial(self.generation);
        }
    }
}

impl std::fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .finish()
    }
}
