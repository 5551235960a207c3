use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and full jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    full_jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            full_jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.full_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.delay_ceiling(attempt);
        if self.full_jitter && capped > Duration::ZERO {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=capped.as_secs_f64()))
        } else {
            capped
        }
    }

    /// Delay without jitter applied; the ceiling callers can assert on.
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(30) as i32);
        Duration::from_secs_f64((self.base.as_secs_f64() * factor).min(self.max.as_secs_f64()))
    }
}
