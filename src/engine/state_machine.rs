//! Finite state machine interface
//!
//! Committed log entries are handed to the FSM in index order. The FSM is
//! owned by the node's driver task, so implementations that tests want to
//! inspect should share their state (see `KvStateMachine`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Error type returned by state machines
pub type FsmError = Box<dyn std::error::Error + Send + Sync>;

/// Replicated state machine
pub trait Fsm: Send + 'static {
    /// Apply a committed command
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), FsmError>;

    /// Serialize the current state
    fn snapshot(&self) -> Result<Vec<u8>, FsmError>;

    /// Replace the current state with a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), FsmError>;
}

impl Fsm for Box<dyn Fsm> {
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), FsmError> {
        (**self).apply(index, data)
    }

    fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        (**self).snapshot()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), FsmError> {
        (**self).restore(snapshot)
    }
}

/// Commands understood by `KvStateMachine`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    /// Encode for `Raft::apply`
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    store: HashMap<String, String>,
    last_index: u64,
}

/// Simple key-value state machine for tests.
///
/// Clones share the same underlying map, so a test can keep a clone and
/// observe what the node applied.
#[derive(Clone, Debug, Default)]
pub struct KvStateMachine {
    state: Arc<RwLock<KvState>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.store.get(key).cloned()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = state.store.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Index of the last applied command
    pub fn last_index(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).last_index
    }
}

impl Fsm for KvStateMachine {
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), FsmError> {
        let command: KvCommand = serde_json::from_slice(data)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match command {
            KvCommand::Set { key, value } => {
                state.store.insert(key, value);
            }
            KvCommand::Delete { key } => {
                state.store.remove(&key);
            }
        }
        state.last_index = index;
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(serde_json::to_vec(&*state)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), FsmError> {
        let restored: KvState = serde_json::from_slice(snapshot)?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }
}
