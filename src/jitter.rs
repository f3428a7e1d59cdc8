//! Jitter strategies to prevent thundering herd
//!
//! - `None`: deterministic retries for tests or tightly controlled workflows.
//! - `Bounded(j)`: delay shifted uniformly within `[-j, +j]`, floored at zero. This is what a
//!   retry configuration's `jitter` value means.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//!
//! Uses `rand`'s thread-local RNG; deterministic RNGs can be injected via `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Uniform offset in `[-j, +j]`, never below zero
    Bounded(Duration),
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
}

impl Jitter {
    /// `Bounded(j)`, or `None` when `j` is zero.
    pub fn bounded(jitter: Duration) -> Self {
        if jitter.is_zero() {
            Jitter::None
        } else {
            Jitter::Bounded(jitter)
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            Jitter::Bounded(spread) => {
                let spread = as_millis_saturated(*spread);
                if spread == 0 {
                    return delay;
                }
                let offset = rng.random_range(0..=spread.saturating_mul(2));
                Duration::from_millis(millis.saturating_add(offset).saturating_sub(spread))
            }
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
