//! Reconnect pacing.
//!
//! A credential rotation tears a device session down on purpose; the
//! reconnect attempts that follow are spaced exponentially from the
//! configured refresh wait and capped in both count and per-wait length.

use backoff::ExponentialBackoff;
use std::time::Duration;

/// No single wait grows past this, however many attempts it takes.
const WAIT_CEILING: Duration = Duration::from_secs(5 * 60);

/// Attempt-capped exponential reconnect schedule.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectSchedule {
    /// Total connection attempts before giving up; never zero.
    pub max_attempts: u32,
    /// First wait; later waits double, with light jitter.
    pub base: Duration,
    /// Per-wait ceiling.
    pub ceiling: Duration,
}

impl ReconnectSchedule {
    pub fn new(max_attempts: u32, base_ms: u64) -> Self {
        let base = Duration::from_millis(base_ms.max(1));
        Self {
            max_attempts: max_attempts.max(1),
            base,
            ceiling: WAIT_CEILING.max(base),
        }
    }

    /// Whether another attempt is allowed after `made` tries.
    pub fn allows_attempt(&self, made: u32) -> bool {
        made < self.max_attempts
    }

    /// A fresh wait source for one reconnect episode.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.base,
            max_interval: self.ceiling,
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}
