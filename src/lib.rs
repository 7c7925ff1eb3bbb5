//! In-process Raft clusters for tests
//!
//! Builds clusters of raft-rs nodes wired together through in-memory stores
//! and transports, so code that depends on consensus can be tested quickly
//! and deterministically.
//!
//! ```no_run
//! use rafttest::{cluster, fsms, notify, PanicReporter};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let reporter = PanicReporter::shared();
//! let leadership = notify();
//! let (rafts, control) = cluster(&reporter, fsms(3), &[&leadership]);
//!
//! let leader = leadership.next_acquired(Duration::from_secs(1)).await;
//! assert!(leader < rafts.len());
//!
//! control.close().await;
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod harness;
pub mod logging;

pub use config::{duration, latency, TestTimings, LATENCY_ENV};
pub use engine::{Config, KvCommand, KvStateMachine, NodeState, Raft, RaftError};
pub use harness::{
    cluster, fsms, notify, other, servers, shutdown, wait_leader, wait_until, Cluster, Control, Knob,
    LeadershipChange, NodeDeps, Notify, PanicReporter, TestReporter,
};
pub use logging::test_logger;
