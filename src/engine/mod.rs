//! In-memory Raft engine
//!
//! A thin tokio driver around raft-rs with pluggable stores and transport:
//! - Stores: log, stable (metadata) and snapshot storage, stitched into `raft::Storage`
//! - Transport: in-process message delivery between explicitly connected peers
//! - Node: the `Raft` handle and its driver task
//! - Bootstrap: writes the founding membership before first start

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use bootstrap::{bootstrap_cluster, Configuration, Server};
pub use config::Config;
pub use errors::{BootstrapError, ConfigError, RaftError, StoreError, TransportError};
pub use node::{NodeState, Raft, ShutdownFuture};
pub use state_machine::{Fsm, FsmError, KvCommand, KvStateMachine};
pub use storage::{InmemSnapshotStore, InmemStore, LogStore, NodeStorage, SnapshotStore, StableStore};
pub use transport::{InmemTransport, Transport, WithPeers};
