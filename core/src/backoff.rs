//! Capped exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `base * multiplier^(attempt - 1)`, capped at `max_delay_ms`, then optionally jittered.
///
/// Jitter only ever shortens a delay: with factor `j` the result lies in
/// `[delay * (1 - j), delay]`, which keeps the cap a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000, 30_000)
    }
}

impl Backoff {
    /// Doubling backoff without jitter.
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 waits nothing.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64) as u64
        } else {
            self.max_delay_ms
        };

        if self.jitter_factor <= 0.0 || capped == 0 {
            return Duration::from_millis(capped);
        }

        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: capped,
            multiplier: 1.0,
            max_delay_ms: capped,
        };
        let jittered = policy.calculate_delay(1, self.jitter_factor.min(1.0));
        Duration::from_millis(jittered as u64)
    }
}
