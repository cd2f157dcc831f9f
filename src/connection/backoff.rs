//! Delay schedule between dial attempts

use lsp_bridge_shared::defaults;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::{Duration, Instant};

/// How a failed dial is followed up
///
/// Delays double from `initial_delay` up to `max_delay`. With `jitter` on,
/// each delay is drawn from `[d/2, d]` so several bridges restarted together
/// do not dial in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Dial again after a failure at all
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Total dial attempts allowed per activation; `None` means unbounded
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(defaults::INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(defaults::MAX_BACKOFF_MS),
            jitter: true,
            max_attempts: Some(defaults::MAX_DIAL_ATTEMPTS),
        }
    }
}

impl RetryPolicy {
    /// Dial exactly once
    pub fn once() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the next dial, given how many attempts have been made
    ///
    /// Returns `None` when no further attempt is allowed.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return None;
            }
        }

        let base = self.base_delay(attempts);
        if self.jitter {
            let half = base / 2;
            Some(half + half.mul_f64(unit_random()))
        } else {
            Some(base)
        }
    }

    fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Uniform value in `[0, 1)`
fn unit_random() -> f64 {
    // Each RandomState is freshly keyed, so hashing the clock gives a new
    // value per call
    let bits = RandomState::new().hash_one(Instant::now());
    (bits >> 11) as f64 / (1u64 << 53) as f64
}
