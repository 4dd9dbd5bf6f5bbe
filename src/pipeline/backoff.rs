use std::time::Duration;

use rand::Rng;

use crate::config::ConfigPipeline;

/// Exponential retry delay with a cap and symmetric random jitter
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(cfg: &ConfigPipeline) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_cap_ms),
            cfg.backoff_jitter,
        )
    }

    /// Delay before retrying after `attempt` failed attempts (the first retry waits `base`)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let capped = self.base.saturating_mul(1u32 << exponent).min(self.cap);
        if self.jitter == 0.0 || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_secs_f64() * self.jitter;
        let offset = rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
    }
}
