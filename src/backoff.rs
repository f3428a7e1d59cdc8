//! Delay growth between retries.
//!
//! `retry` is the 1-based retry number: `delay(1)` is the wait before the first re-attempt.
//! Computations that would overflow saturate to [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use safeguard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use crate::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Base delay between attempts, before jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Constant(Duration),
    /// `base * retry`, optionally capped.
    Linear { base: Duration, max: Option<Duration> },
    /// `base * 2^(retry - 1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Constant(Duration::ZERO)
    }
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant(delay)
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: None }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap a growing backoff. Rejected for `Constant`, a zero cap, or a cap below the base.
    pub fn with_max(self, cap: Duration) -> Result<Self, ConfigError> {
        if cap.is_zero() {
            return Err(ConfigError::out_of_range("backoff", "max", "> 0", "0ms"));
        }
        match self {
            Backoff::Constant(_) => Err(ConfigError::out_of_range(
                "backoff",
                "max",
                "unset for constant backoff",
                format!("{:?}", cap),
            )),
            Backoff::Linear { base, .. } | Backoff::Exponential { base, .. } if cap < base => {
                Err(ConfigError::out_of_range("backoff", "max", ">= base", format!("{:?}", cap)))
            }
            Backoff::Linear { base, .. } => Ok(Backoff::Linear { base, max: Some(cap) }),
            Backoff::Exponential { base, .. } => Ok(Backoff::Exponential { base, max: Some(cap) }),
        }
    }

    /// Delay before retry number `retry` (1-based). `delay(0)` is zero.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let (raw, max) = match *self {
            Backoff::Constant(d) => (d, None),
            Backoff::Linear { base, max } => (base.checked_mul(retry).unwrap_or(MAX_BACKOFF), max),
            Backoff::Exponential { base, max } => {
                let multiplier = 2u128.saturating_pow(retry - 1);
                let nanos = base.as_nanos().saturating_mul(multiplier).min(MAX_BACKOFF.as_nanos());
                (Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)), max)
            }
        };
        max.map_or(raw, |m| raw.min(m)).min(MAX_BACKOFF)
    }
}
