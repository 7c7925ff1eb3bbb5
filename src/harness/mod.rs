//! Test cluster harness
//!
//! `cluster` builds N in-memory nodes, `Knob`s customize them before and
//! after they start, and the wait helpers bound every assertion in time.

pub mod cluster;
pub mod knobs;
pub mod notify;
pub mod reporter;
pub mod wait;

pub use cluster::{cluster, fsms, other, shutdown, Cluster, Control, Knob, NodeDeps};
pub use knobs::{servers, Servers};
pub use notify::{notify, LeadershipChange, Notify};
pub use reporter::{PanicReporter, TestReporter};
pub use wait::{wait_leader, wait_until, POLL_INTERVAL};
