//! Pacing between optimistic-lock retries.
//!
//! A lost compare-and-swap means another request for the same key committed first. The default
//! retries at once; hot keys can opt into a constant or exponential pause with optional jitter.
//!
//! Attempt semantics: attempt `0` is the first try and never waits; the pause before retry `n`
//! is `delay(n)`. Delays saturate at [`MAX_CONTENTION_DELAY`].
//!
//! ```rust
//! use std::time::Duration;
//! use keyquota::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(5))
//!     .with_max(Duration::from_millis(40));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(5));
//! assert_eq!(backoff.delay(2), Duration::from_millis(10));
//! assert_eq!(backoff.delay(9), Duration::from_millis(40));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Upper bound on any single contention pause.
pub const MAX_CONTENTION_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Immediate,
    Constant(Duration),
    Exponential { base: Duration, max: Duration },
}

/// Delay schedule for retrying after a lost optimistic-lock race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
    full_jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::immediate()
    }
}

impl Backoff {
    /// Retry without pausing.
    pub fn immediate() -> Self {
        Self { kind: BackoffKind::Immediate, full_jitter: false }
    }

    /// Pause for the same `delay` before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant(delay.min(MAX_CONTENTION_DELAY)), full_jitter: false }
    }

    /// Double the pause on each retry, starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential {
                base: base.min(MAX_CONTENTION_DELAY),
                max: MAX_CONTENTION_DELAY,
            },
            full_jitter: false,
        }
    }

    /// Cap exponential growth at `max` (clamped to at least the base). No effect on other kinds.
    pub fn with_max(mut self, max: Duration) -> Self {
        if let BackoffKind::Exponential { base, max: existing } = &mut self.kind {
            *existing = max.max(*base).min(MAX_CONTENTION_DELAY);
        }
        self
    }

    /// Draw each pause uniformly from `[0, delay]`.
    pub fn with_full_jitter(mut self) -> Self {
        self.full_jitter = true;
        self
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, BackoffKind::Immediate)
    }

    /// Deterministic pause before retry `attempt` (no jitter applied).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.kind {
            BackoffKind::Immediate => Duration::ZERO,
            BackoffKind::Constant(delay) => delay,
            BackoffKind::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier).min(max.as_nanos());
                Duration::from_nanos(nanos as u64)
            }
        }
    }

    /// Pause before retry `attempt`, with jitter applied when enabled.
    pub fn pause(&self, attempt: usize) -> Duration {
        let delay = self.delay(attempt);
        if !self.full_jitter {
            return delay;
        }
        self.jitter_with(delay, &mut rng())
    }

    fn jitter_with<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        if micros == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rng.random_range(0..=micros))
    }
}
