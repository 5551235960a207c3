//! Polite request pacing shared by every outbound call: an aggregate
//! token bucket, per-phase concurrency caps, and adaptive backoff fed by
//! caller-reported throttling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backoff::ExponentialBackoff;
use crate::config::ThrottleConfig;
use crate::control::CrawlControl;
use crate::error::{CrawlError, Result};

/// Which request family a permit is for. Concurrency caps are per-phase;
/// the rate bound is global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Person,
    Relationship,
}

const MIN_RATE_FACTOR: f64 = 0.125;

struct PacingState {
    tokens: f64,
    last_refill: Instant,
    /// Multiplier on the configured rps; halved per reported failure,
    /// doubled (toward 1.0) per reported success.
    rate_factor: f64,
    consecutive_failures: u32,
    /// Floor on the next backoff sleep, from a Retry-After header.
    retry_after_floor: Option<Duration>,
}

/// One shared instance per run. Acquiring a permit blocks until a phase
/// slot and a bucket token are both available; while paused it parks, and
/// once stop is requested it returns `Cancelled`.
///
/// No FIFO fairness between waiters is guaranteed, only the aggregate rate
/// bound and the per-phase concurrency bounds.
pub struct Throttle {
    config: ThrottleConfig,
    capacity: f64,
    person_permits: Arc<Semaphore>,
    relationship_permits: Arc<Semaphore>,
    state: Mutex<PacingState>,
    backoff: ExponentialBackoff,
    control: Arc<CrawlControl>,
}

/// Held for the duration of one HTTP request; dropping it frees the
/// phase slot.
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    pub fn new(config: ThrottleConfig, control: Arc<CrawlControl>) -> Self {
        let capacity = config.requests_per_second.ceil().max(1.0);
        let backoff = ExponentialBackoff::new(
            Duration::from_secs_f64(config.backoff_base_seconds),
            config.backoff_multiplier,
            Duration::from_secs_f64(config.backoff_max_seconds),
        );
        Self {
            person_permits: Arc::new(Semaphore::new(config.max_concurrent_person_requests)),
            relationship_permits: Arc::new(Semaphore::new(
                config.max_concurrent_relationship_requests,
            )),
            state: Mutex::new(PacingState {
                tokens: capacity,
                last_refill: Instant::now(),
                rate_factor: 1.0,
                consecutive_failures: 0,
                retry_after_floor: None,
            }),
            capacity,
            backoff,
            control,
            config,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Block until the caller may issue one request in `phase`.
    pub async fn acquire(&self, phase: Phase) -> Result<RequestPermit> {
        self.control.wait_if_paused().await?;

        let semaphore = match phase {
            Phase::Person => Arc::clone(&self.person_permits),
            Phase::Relationship => Arc::clone(&self.relationship_permits),
        };
        let permit = tokio::select! {
            _ = self.control.stop_token().cancelled() => return Err(CrawlError::Cancelled),
            acquired = semaphore.acquire_owned() => {
                acquired.map_err(|_| CrawlError::Cancelled)?
            }
        };

        if let Some(delay) = self.penalty_delay() {
            tokio::select! {
                _ = self.control.stop_token().cancelled() => return Err(CrawlError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.take_token().await?;
        // A pause may have arrived while waiting on the bucket.
        self.control.wait_if_paused().await?;
        Ok(RequestPermit { _permit: permit })
    }

    /// Report a successful request: backoff clears and the effective rate
    /// recovers geometrically toward the configured rps.
    pub fn report_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.retry_after_floor = None;
        state.rate_factor = (state.rate_factor * 2.0).min(1.0);
    }

    /// Report a throttled or failed request (429/5xx/transport): the
    /// effective rate halves and subsequent acquisitions pay a backoff
    /// sleep.
    pub fn report_failure(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.rate_factor = (state.rate_factor / 2.0).max(MIN_RATE_FACTOR);
        if let Some(floor) = retry_after {
            state.retry_after_floor = Some(match state.retry_after_floor {
                Some(current) => current.max(floor),
                None => floor,
            });
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// The backoff sleep the next acquisition will pay: the deterministic
    /// exponential floor plus a full-jitter share of it, never less than a
    /// pending Retry-After.
    fn penalty_delay(&self) -> Option<Duration> {
        let (failures, floor) = {
            let state = self.state.lock();
            (state.consecutive_failures, state.retry_after_floor)
        };
        if failures == 0 {
            return floor;
        }
        let base = self.backoff.delay_ceiling(failures - 1);
        let jitter = Duration::from_secs_f64(
            rand::thread_rng().gen_range(0.0..=base.as_secs_f64().max(f64::EPSILON)),
        );
        let delay = base + jitter;
        Some(match floor {
            Some(f) => delay.max(f),
            None => delay,
        })
    }

    /// Deterministic floor of the next backoff sleep; what tests assert on.
    pub fn penalty_floor(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.consecutive_failures == 0 {
            return state.retry_after_floor;
        }
        let base = self.backoff.delay_ceiling(state.consecutive_failures - 1);
        Some(match state.retry_after_floor {
            Some(f) => base.max(f),
            None => base,
        })
    }

    async fn take_token(&self) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let rate =
                    (self.config.requests_per_second * state.rate_factor).max(f64::EPSILON);
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.last_refill = Instant::now();
                state.tokens = (state.tokens + elapsed * rate).min(self.capacity);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };
            tokio::select! {
                _ = self.control.stop_token().cancelled() => return Err(CrawlError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle_with(rps: f64) -> Throttle {
        let config = ThrottleConfig {
            requests_per_second: rps,
            max_concurrent_person_requests: 4,
            max_concurrent_relationship_requests: 2,
            backoff_base_seconds: 1.0,
            ..ThrottleConfig::default()
        };
        Throttle::new(config, Arc::new(CrawlControl::new()))
    }

    #[tokio::test]
    async fn test_acquire_grants_burst_then_paces() {
        let throttle = throttle_with(50.0);
        let start = Instant::now();
        // Burst capacity covers the first 50; the next two must wait.
        for _ in 0..52 {
            throttle.acquire(Phase::Person).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_phase_concurrency_is_bounded() {
        let throttle = Arc::new(throttle_with(1000.0));
        let p1 = throttle.acquire(Phase::Relationship).await.unwrap();
        let _p2 = throttle.acquire(Phase::Relationship).await.unwrap();

        // Cap of 2 is exhausted; a third acquire parks until one permit drops.
        let contender = Arc::clone(&throttle);
        let handle =
            tokio::spawn(async move { contender.acquire(Phase::Relationship).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(p1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_floor_after_reported_failure() {
        let throttle = throttle_with(1000.0);
        assert_eq!(throttle.penalty_floor(), None);

        throttle.report_failure(None);
        // Property: after a synthetic 429 the next request waits at least
        // backoff_base seconds.
        assert!(throttle.penalty_floor().unwrap() >= Duration::from_secs(1));

        throttle.report_failure(None);
        assert!(throttle.penalty_floor().unwrap() >= Duration::from_secs(2));

        throttle.report_success();
        assert_eq!(throttle.penalty_floor(), None);
    }

    #[tokio::test]
    async fn test_retry_after_floor_is_honored() {
        let throttle = throttle_with(1000.0);
        throttle.report_failure(Some(Duration::from_secs(7)));
        assert!(throttle.penalty_floor().unwrap() >= Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_acquire_cancelled_on_stop() {
        let control = Arc::new(CrawlControl::new());
        let throttle = Throttle::new(
            ThrottleConfig {
                requests_per_second: 0.001, // bucket effectively never refills
                ..ThrottleConfig::default()
            },
            Arc::clone(&control),
        );
        // Drain the single burst token.
        throttle.acquire(Phase::Person).await.unwrap();

        control.request_stop("test");
        let result = throttle.acquire(Phase::Person).await;
        assert!(matches!(result, Err(CrawlError::Cancelled)));
    }

    #[tokio::test]
    async fn test_rate_factor_recovers_on_success() {
        let throttle = throttle_with(100.0);
        throttle.report_failure(None);
        throttle.report_failure(None);
        assert_eq!(throttle.consecutive_failures(), 2);
        throttle.report_success();
        assert_eq!(throttle.consecutive_failures(), 0);
    }
}
