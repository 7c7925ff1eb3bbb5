//! Harness timings
//!
//! Clusters run with timeouts far shorter than production so elections settle
//! in tens of milliseconds. Slow machines (CI under load, sanitizers) can
//! stretch every timing with the `RAFT_TEST_LATENCY` multiplier.

use crate::engine::Config;
use std::time::Duration;

/// Environment variable holding the latency multiplier
pub const LATENCY_ENV: &str = "RAFT_TEST_LATENCY";

/// Engine timeouts applied to every node of a test cluster
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TestTimings {
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub leader_lease_timeout: Duration,
    pub commit_timeout: Duration,
}

impl Default for TestTimings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(10),
            election_timeout: Duration::from_millis(10),
            leader_lease_timeout: Duration::from_millis(10),
            commit_timeout: Duration::from_millis(5),
        }
    }
}

impl TestTimings {
    /// Default timings scaled by the environment's latency multiplier
    pub fn from_env() -> Self {
        Self::default().with_latency(latency())
    }

    /// Scale every timing by `factor`
    pub fn with_latency(self, factor: f64) -> Self {
        Self {
            heartbeat_timeout: scale(self.heartbeat_timeout, factor),
            election_timeout: scale(self.election_timeout, factor),
            leader_lease_timeout: scale(self.leader_lease_timeout, factor),
            commit_timeout: scale(self.commit_timeout, factor),
        }
    }

    /// Install these timings into an engine configuration
    pub fn apply(&self, config: &mut Config) {
        config.heartbeat_timeout = self.heartbeat_timeout;
        config.election_timeout = self.election_timeout;
        config.leader_lease_timeout = self.leader_lease_timeout;
        config.commit_timeout = self.commit_timeout;
    }
}

/// Latency multiplier read from `RAFT_TEST_LATENCY`.
///
/// Unset, unparseable or non-positive values mean 1.0.
pub fn latency() -> f64 {
    parse_latency(std::env::var(LATENCY_ENV).ok().as_deref())
}

/// Scale a duration by the latency multiplier
pub fn duration(d: Duration) -> Duration {
    scale(d, latency())
}

fn parse_latency(raw: Option<&str>) -> f64 {
    match raw.map(|value| value.trim().parse::<f64>()) {
        Some(Ok(factor)) if factor.is_finite() && factor > 0.0 => factor,
        _ => 1.0,
    }
}

fn scale(d: Duration, factor: f64) -> Duration {
    d.mul_f64(factor)
}
