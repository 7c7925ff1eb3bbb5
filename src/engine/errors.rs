//! Error types for the in-memory Raft engine

use thiserror::Error;

/// Errors reported by `Config::validate`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// raft-rs reserves id 0 as "no node"
    #[error("local id must be non-zero")]
    InvalidLocalId,

    /// A timeout is below the minimum the engine can honour
    #[error("{name} is too low: {value:?} (minimum {minimum:?})")]
    TooLow {
        name: &'static str,
        value: std::time::Duration,
        minimum: std::time::Duration,
    },

    /// Leader lease must fit inside the heartbeat timeout
    #[error("leader lease timeout cannot be larger than heartbeat timeout")]
    LeaseExceedsHeartbeat,

    /// Candidates must not give up before followers do
    #[error("election timeout must be equal or greater than heartbeat timeout")]
    ElectionBelowHeartbeat,
}

/// Errors that can occur in log, stable or snapshot stores
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Requested log entry does not exist
    #[error("log entry {index} not found")]
    LogNotFound { index: u64 },

    /// A stored value could not be decoded
    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Failed to encode a value for storage
    #[error("failed to encode value: {0}")]
    Encode(String),
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Peer address not known to this transport
    #[error("peer {address} not connected")]
    PeerNotFound { address: String },

    /// Peer is known but its consumer is gone (node shut down)
    #[error("peer {address} is no longer receiving")]
    Disconnected { address: String },

    /// The consumer side of a transport can only be taken once
    #[error("transport consumer for {address} already taken")]
    ConsumerTaken { address: String },
}

/// Errors returned by `bootstrap_cluster`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("bootstrap only works on new clusters")]
    CantBootstrap,

    #[error("bootstrap configuration has no servers")]
    EmptyConfiguration,

    #[error("bootstrap configuration contains invalid server id 0")]
    InvalidServerId,

    #[error("found duplicate server id in configuration: {0}")]
    DuplicateId(u64),

    #[error("found duplicate server address in configuration: {0}")]
    DuplicateAddress(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by a running `Raft` instance
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Failure inside raft-rs
    #[error("raft: {0}")]
    Raft(#[from] raft::Error),

    /// The state machine rejected a command or snapshot
    #[error("fsm: {0}")]
    Fsm(String),

    /// Command submitted to a node that is not the leader
    #[error("node is not the leader")]
    NotLeader,

    /// Leadership changed before the command committed
    #[error("leadership lost while committing command")]
    LeadershipLost,

    /// Node has been shut down
    #[error("raft is already shutdown")]
    Shutdown,

    /// Nothing has been applied since the last snapshot
    #[error("nothing new to snapshot")]
    NothingNewToSnapshot,

    /// Operation did not complete in time
    #[error("timed out enqueuing operation")]
    Timeout,

    /// The driver task panicked or was cancelled
    #[error("raft driver task failed: {0}")]
    Driver(String),
}
