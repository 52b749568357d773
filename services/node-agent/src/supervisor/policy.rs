//! Restart and timing policy for managed processes.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    ///
    /// The result never exceeds `max`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max.as_millis() as f64;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            delay * (1.0 + rand::rng().random_range(-jitter..=jitter))
        } else {
            delay
        };

        Duration::from_millis(delay.clamp(0.0, max) as u64)
    }
}

/// Everything the supervisor needs to decide when to check, restart and kill.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    /// Relaunches allowed after a crash or failed launch before an entry
    /// stays `Failed`. START resets the count.
    pub max_restarts: u32,

    pub backoff: BackoffPolicy,

    /// Upper bound on the liveness check period of a running entry.
    pub health_interval: Duration,

    /// Period of the supervisor loop.
    pub tick_interval: Duration,

    /// FINISH PROCESSING grace is the entry timeout times this.
    pub finish_grace_multiplier: u32,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff: BackoffPolicy::default(),
            health_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            finish_grace_multiplier: 4,
        }
    }
}

impl SupervisorPolicy {
    /// Liveness check period for an entry with the given stop timeout.
    pub fn check_interval(&self, timeout: Duration) -> Duration {
        self.health_interval.min(timeout)
    }
}
