//! Retry budget for transient observation failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CapError, Result};

/// Caps and backoff shape for one step's polling loop.
///
/// Both caps apply at once: polling stops at `max_attempts` observations or
/// when `max_elapsed` has passed since the step entered polling, whichever
/// comes first. Only transient fetch failures consume retries; verdict
/// failures never do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Observation attempts per step, at least 1.
    pub max_attempts: u32,
    /// Pause after the first failed attempt.
    pub initial_backoff: Duration,
    /// Growth factor per further attempt.
    pub backoff_multiplier: f64,
    /// Ceiling for a single pause.
    pub max_backoff: Duration,
    /// Random spread applied to each pause, `0.0..=1.0`.
    pub jitter_fraction: f64,
    /// Wall-clock budget per step.
    pub max_elapsed: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(60),
            jitter_fraction: 0.1,
            max_elapsed: Duration::from_secs(600),
        }
    }
}

impl PollPolicy {
    /// Reject budgets that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CapError::invalid_config("polling.max_attempts must be > 0"));
        }
        if self.initial_backoff.is_zero() {
            return Err(CapError::invalid_config(
                "polling.initial_backoff must be > 0",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CapError::invalid_config(format!(
                "polling.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(CapError::invalid_config(
                "polling.max_backoff must be >= initial_backoff",
            ));
        }
        if !self.jitter_fraction.is_finite()
            || !(0.0..=1.0).contains(&self.jitter_fraction)
        {
            return Err(CapError::invalid_config(format!(
                "polling.jitter_fraction must be in [0.0, 1.0], got {}",
                self.jitter_fraction
            )));
        }
        if self.max_elapsed.is_zero() {
            return Err(CapError::invalid_config("polling.max_elapsed must be > 0"));
        }
        Ok(())
    }

    /// Pause before retrying after failed attempt number `attempt` (1-based).
    ///
    /// Exponential growth capped at `max_backoff`, then jittered by up to
    /// `jitter_fraction` in either direction. Zero jitter is deterministic.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter_fraction > 0.0 {
            use rand::Rng;
            let spread = capped * self.jitter_fraction;
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
