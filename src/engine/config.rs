//! Engine configuration
//!
//! Timeouts are expressed in wall-clock terms and translated into raft-rs
//! ticks when a node is constructed.

use crate::engine::errors::ConfigError;
use slog::Logger;
use std::time::Duration;
use tokio::sync::mpsc;

const MIN_TIMEOUT: Duration = Duration::from_millis(5);
const MIN_COMMIT_TIMEOUT: Duration = Duration::from_millis(1);
const MIN_TICK: Duration = Duration::from_millis(1);

/// Configuration for a single `Raft` instance
#[derive(Clone, Debug)]
pub struct Config {
    /// This node's ID (must be non-zero)
    pub local_id: u64,

    /// Time a follower goes without leader contact before campaigning
    pub heartbeat_timeout: Duration,

    /// Time a candidate waits before restarting a failed election
    pub election_timeout: Duration,

    /// Time a leader may go without quorum contact before stepping down
    pub leader_lease_timeout: Duration,

    /// Interval at which an idle leader broadcasts its commit index
    pub commit_timeout: Duration,

    /// Receives `true` when this node becomes leader and `false` when it
    /// stops being leader. Delivery never blocks the node.
    pub notify: Option<mpsc::Sender<bool>>,

    /// Logger
    pub logger: Logger,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: 0,
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1000),
            leader_lease_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(50),
            notify: None,
            logger: Logger::root(slog::Discard, slog::o!()),
        }
    }
}

impl Config {
    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_id == 0 {
            return Err(ConfigError::InvalidLocalId);
        }
        check_min("heartbeat timeout", self.heartbeat_timeout, MIN_TIMEOUT)?;
        check_min("election timeout", self.election_timeout, MIN_TIMEOUT)?;
        check_min("leader lease timeout", self.leader_lease_timeout, MIN_TIMEOUT)?;
        check_min("commit timeout", self.commit_timeout, MIN_COMMIT_TIMEOUT)?;
        if self.leader_lease_timeout > self.heartbeat_timeout {
            return Err(ConfigError::LeaseExceedsHeartbeat);
        }
        if self.election_timeout < self.heartbeat_timeout {
            return Err(ConfigError::ElectionBelowHeartbeat);
        }
        Ok(())
    }

    /// Duration of one raft-rs logical tick
    pub fn tick_interval(&self) -> Duration {
        (self.heartbeat_timeout.min(self.election_timeout) / 10).max(MIN_TICK)
    }

    /// Translate into raft-rs configuration
    pub fn to_raft_config(&self, applied: u64) -> raft::Config {
        let tick = self.tick_interval().as_micros().max(1);
        let election_tick = ticks(self.heartbeat_timeout, tick).max(2);
        let election_spread = ticks(self.election_timeout, tick).max(1);

        raft::Config {
            id: self.local_id,
            election_tick,
            heartbeat_tick: 1,
            min_election_tick: election_tick,
            max_election_tick: election_tick + election_spread,
            applied,
            check_quorum: true,
            pre_vote: true,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            ..Default::default()
        }
    }
}

fn check_min(name: &'static str, value: Duration, minimum: Duration) -> Result<(), ConfigError> {
    if value < minimum {
        return Err(ConfigError::TooLow { name, value, minimum });
    }
    Ok(())
}

fn ticks(timeout: Duration, tick_micros: u128) -> usize {
    (timeout.as_micros() / tick_micros) as usize
}
