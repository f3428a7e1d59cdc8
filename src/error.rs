//! Failure taxonomy for guarded invocations.
//!
//! Every guarded call resolves to `Result<T, FaultError<E>>`, whether it ran inline or was
//! dispatched to an executor. Protective policies surface their own variants; the guarded
//! operation's own failure travels unmodified inside `Inner`.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Coarse classification of a failure, used by retry `retry_on` / `abort_on` sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailureCategory {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The circuit breaker refused the call.
    CircuitOpen,
    /// The bulkhead had no capacity.
    BulkheadRejected,
    /// The guarded operation itself failed.
    Application,
    /// The work was lost (panic, dropped executor task, misconfiguration).
    Aborted,
}

/// Unified error type for guarded invocations.
#[derive(Debug, Clone)]
pub enum FaultError<E> {
    /// The attempt exceeded the timeout duration.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open (or its half-open trial slot is taken).
    CircuitOpen { method: Arc<str>, open_for: Duration },
    /// The bulkhead rejected the call due to capacity.
    BulkheadRejected { in_flight: usize, max: usize, queued: usize },
    /// The retry budget ran out; `last` is the failure of the final attempt.
    RetriesExhausted { attempts: u32, elapsed: Duration, last: Box<FaultError<E>> },
    /// The work never produced an outcome (panic or dropped task).
    Aborted { reason: String },
    /// The guarded operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for FaultError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { method, open_for } => {
                write!(f, "circuit breaker for '{}' is open (open for {:?})", method, open_for)
            }
            Self::BulkheadRejected { in_flight, max, queued } => write!(
                f,
                "bulkhead rejected call ({} in-flight, max {}, {} queued)",
                in_flight, max, queued
            ),
            Self::RetriesExhausted { attempts, elapsed, last } => write!(
                f,
                "retries exhausted after {} attempts in {:?}; last error: {}",
                attempts, elapsed, last
            ),
            Self::Aborted { reason } => write!(f, "invocation aborted: {}", reason),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FaultError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl<E> FaultError<E> {
    /// Category used by retry classification. `RetriesExhausted` reports its last failure's.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Timeout { .. } => FailureCategory::Timeout,
            Self::CircuitOpen { .. } => FailureCategory::CircuitOpen,
            Self::BulkheadRejected { .. } => FailureCategory::BulkheadRejected,
            Self::RetriesExhausted { last, .. } => last.category(),
            Self::Aborted { .. } => FailureCategory::Aborted,
            Self::Inner(_) => FailureCategory::Application,
        }
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to the circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Check if the work was aborted before producing an outcome
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The failure that ended a retry loop, if this is `RetriesExhausted`.
    pub fn last_failure(&self) -> Option<&FaultError<E>> {
        match self {
            Self::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Follow `RetriesExhausted` wrappers down to the failure that actually occurred.
    pub fn root(&self) -> &FaultError<E> {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Number of attempts for `RetriesExhausted`.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Access bulkhead capacity info as (in_flight, max).
    pub fn bulkhead_capacity(&self) -> Option<(usize, usize)> {
        match self {
            Self::BulkheadRejected { in_flight, max, .. } => Some((*in_flight, *max)),
            _ => None,
        }
    }
}

/// A bulkhead refused admission. Converted into [`FaultError::BulkheadRejected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejection {
    /// Calls executing when the rejection happened.
    pub in_flight: usize,
    /// Configured concurrency limit.
    pub max: usize,
    /// Callers waiting in the queue when the rejection happened.
    pub queued: usize,
}

impl<E> From<BulkheadRejection> for FaultError<E> {
    fn from(r: BulkheadRejection) -> Self {
        FaultError::BulkheadRejected { in_flight: r.in_flight, max: r.max, queued: r.queued }
    }
}

/// A circuit breaker refused the call. Converted into [`FaultError::CircuitOpen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenRejection {
    pub method: Arc<str>,
    pub open_for: Duration,
}

impl<E> From<CircuitOpenRejection> for FaultError<E> {
    fn from(r: CircuitOpenRejection) -> Self {
        FaultError::CircuitOpen { method: r.method, open_for: r.open_for }
    }
}

/// Invalid policy configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A numeric field is outside its allowed range.
    #[error("{policy}.{field} must be {expected} (got {provided})")]
    OutOfRange {
        policy: &'static str,
        field: &'static str,
        expected: &'static str,
        provided: String,
    },
    /// The policy document could not be parsed.
    #[error("invalid policy document: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(
        policy: &'static str,
        field: &'static str,
        expected: &'static str,
        provided: impl fmt::Display,
    ) -> Self {
        ConfigError::OutOfRange { policy, field, expected, provided: provided.to_string() }
    }
}
