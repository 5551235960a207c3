use serde::{Deserialize, Serialize};

/// Compile-time limits shared across modules.
pub struct Consts;

impl Consts {
    pub const PAUSE_FILE_POLL_MS: u64 = 1_000;
    pub const CONTROL_CHECK_INTERVAL_MS: u64 = 250;
    pub const POOL_IDLE_PER_HOST: usize = 16;
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
}

/// Outbound pacing profile. Persisted into JOB_METADATA so a resumed run
/// reports the profile it was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Aggregate cap across person and relationship calls.
    pub requests_per_second: f64,
    pub max_concurrent_person_requests: usize,
    pub max_concurrent_relationship_requests: usize,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    pub backoff_max_seconds: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            max_concurrent_person_requests: 20,
            max_concurrent_relationship_requests: 10,
            max_retries: 5,
            backoff_base_seconds: 1.0,
            backoff_multiplier: 2.0,
            backoff_max_seconds: 60.0,
        }
    }
}

/// Full crawl configuration assembled by the CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// BFS levels to expand from the seed set.
    pub max_hopcount: u32,
    /// Ids per `persons` request.
    pub persons_per_request: usize,
    /// Frontier entries promoted into one iteration.
    pub drain_limit: usize,
    /// Politeness floor between batch dispatches, in addition to the
    /// token bucket.
    pub inter_batch_delay_seconds: f64,
    /// Mid-iteration commit checkpoint after this many processed payloads.
    pub payload_checkpoint_every: usize,
    /// Forced checkpoint cadence while a hop is idle.
    pub checkpoint_interval_seconds: u64,
    /// Bound on cooperative stop before in-flight work is abandoned.
    pub shutdown_grace_seconds: u64,
    /// Per-request timeout.
    pub request_timeout_seconds: u64,
    pub throttle: ThrottleConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_hopcount: 4,
            persons_per_request: 200,
            drain_limit: 10_000,
            inter_batch_delay_seconds: 0.0,
            payload_checkpoint_every: 8,
            checkpoint_interval_seconds: 60,
            shutdown_grace_seconds: 30,
            request_timeout_seconds: 30,
            throttle: ThrottleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CrawlConfig::default();
        assert_eq!(config.persons_per_request, 200);
        assert_eq!(config.payload_checkpoint_every, 8);
        assert_eq!(config.shutdown_grace_seconds, 30);
        assert!(config.throttle.requests_per_second > 0.0);
    }

    #[test]
    fn test_throttle_config_round_trips_as_json() {
        let throttle = ThrottleConfig::default();
        let json = serde_json::to_string(&throttle).unwrap();
        let back: ThrottleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, throttle);
    }
}
