//! In-memory log, stable and snapshot stores, and the adapter that presents
//! them to raft-rs as a single `raft::Storage`.
//!
//! raft-rs models persistence as one trait. The harness wants to swap each
//! piece independently (a knob may replace only the snapshot store), so the
//! three concerns are separate traits here and `NodeStorage` stitches them
//! back together.

use crate::engine::bootstrap::Configuration;
use crate::engine::errors::StoreError;
use raft::prelude::*;
use raft::{GetEntriesContext, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Stable store key holding the current term
pub const KEY_CURRENT_TERM: &[u8] = b"CurrentTerm";
/// Stable store key holding the id voted for in the current term
pub const KEY_LAST_VOTE: &[u8] = b"LastVoteCand";
/// Stable store key holding the last known commit index
pub const KEY_COMMIT_INDEX: &[u8] = b"CommitIndex";
/// Stable store key holding the JSON encoded membership `Configuration`
pub const KEY_CONFIGURATION: &[u8] = b"Configuration";

/// Ordered storage for raft log entries
pub trait LogStore: Send + Sync {
    /// Index of the first entry, or 0 if the log is empty
    fn first_index(&self) -> Result<u64, StoreError>;

    /// Index of the last entry, or 0 if the log is empty
    fn last_index(&self) -> Result<u64, StoreError>;

    /// Fetch a single entry
    fn get_log(&self, index: u64) -> Result<Entry, StoreError>;

    /// Store a batch of entries, replacing any with the same index
    fn store_logs(&self, entries: &[Entry]) -> Result<(), StoreError>;

    /// Delete entries in the inclusive range `[min, max]`
    fn delete_range(&self, min: u64, max: u64) -> Result<(), StoreError>;
}

/// Key/value storage for raft metadata that must survive restarts
pub trait StableStore: Send + Sync {
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns `None` if the key was never set
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set_u64(&self, key: &[u8], value: u64) -> Result<(), StoreError> {
        self.set(key, value.to_be_bytes().to_vec())
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: format!("expected 8 bytes, found {}", bytes.len()),
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
        }
    }
}

/// Storage for state machine snapshots
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, superseding older ones
    fn create(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Most recent snapshot, if any
    fn latest(&self) -> Result<Option<Snapshot>, StoreError>;
}

#[derive(Default)]
struct InmemState {
    logs: BTreeMap<u64, Entry>,
    kv: HashMap<Vec<u8>, Vec<u8>>,
}

/// In-memory `LogStore` and `StableStore`
#[derive(Default)]
pub struct InmemStore {
    state: RwLock<InmemState>,
}

impl InmemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for InmemStore {
    fn first_index(&self) -> Result<u64, StoreError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.logs.keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64, StoreError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.logs.keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: u64) -> Result<Entry, StoreError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .logs
            .get(&index)
            .cloned()
            .ok_or(StoreError::LogNotFound { index })
    }

    fn store_logs(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            state.logs.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<(), StoreError> {
        if min > max {
            return Ok(());
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<u64> = state.logs.range(min..=max).map(|(index, _)| *index).collect();
        for index in doomed {
            state.logs.remove(&index);
        }
        Ok(())
    }
}

impl StableStore for InmemStore {
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.kv.insert(key.to_vec(), value);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.kv.get(key).cloned())
    }
}

/// In-memory `SnapshotStore` retaining only the latest snapshot
#[derive(Default)]
pub struct InmemSnapshotStore {
    latest: RwLock<Option<Snapshot>>,
}

impl InmemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InmemSnapshotStore {
    fn create(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        Ok(())
    }

    fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.latest.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Read the bootstrap membership from a stable store
pub fn load_configuration(stable: &dyn StableStore) -> Result<Option<Configuration>, StoreError> {
    match stable.get(KEY_CONFIGURATION)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| StoreError::Corrupt {
            key: String::from_utf8_lossy(KEY_CONFIGURATION).into_owned(),
            reason: e.to_string(),
        }),
    }
}

/// Write the bootstrap membership to a stable store
pub fn store_configuration(stable: &dyn StableStore, configuration: &Configuration) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(configuration).map_err(|e| StoreError::Encode(e.to_string()))?;
    stable.set(KEY_CONFIGURATION, bytes)
}

/// `raft::Storage` backed by a separate log, stable and snapshot store.
///
/// Cloning shares the underlying stores.
#[derive(Clone)]
pub struct NodeStorage {
    logs: Arc<dyn LogStore>,
    stable: Arc<dyn StableStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl NodeStorage {
    pub fn new(logs: Arc<dyn LogStore>, stable: Arc<dyn StableStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { logs, stable, snapshots }
    }

    /// Whether any of the stores already holds raft state
    pub fn has_state(&self) -> Result<bool, StoreError> {
        Ok(self.logs.last_index()? > 0
            || self.stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0) > 0
            || self.snapshots.latest()?.is_some())
    }

    /// Latest snapshot metadata, or the zero snapshot if none exists
    fn snapshot_metadata(&self) -> Result<SnapshotMetadata, StoreError> {
        Ok(self
            .snapshots
            .latest()?
            .map(|snapshot| snapshot.get_metadata().clone())
            .unwrap_or_default())
    }

    /// Append entries from a `Ready`, truncating any conflicting suffix
    pub fn append(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let last = self.logs.last_index()?;
        if last >= first.index {
            self.logs.delete_range(first.index, last)?;
        }
        self.logs.store_logs(entries)
    }

    /// Persist the hard state fields raft-rs needs on restart
    pub fn set_hard_state(&self, hs: &HardState) -> Result<(), StoreError> {
        self.stable.set_u64(KEY_CURRENT_TERM, hs.term)?;
        self.stable.set_u64(KEY_LAST_VOTE, hs.vote)?;
        self.stable.set_u64(KEY_COMMIT_INDEX, hs.commit)
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), StoreError> {
        self.stable.set_u64(KEY_COMMIT_INDEX, commit)
    }

    /// Install a snapshot received from the leader. All entries it covers
    /// are dropped from the log.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let first = self.logs.first_index()?;
        let last = self.logs.last_index()?;
        if last > 0 {
            self.logs.delete_range(first, last)?;
        }
        let meta = snapshot.get_metadata();
        if self.stable.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0) < meta.term {
            self.stable.set_u64(KEY_CURRENT_TERM, meta.term)?;
        }
        if self.stable.get_u64(KEY_COMMIT_INDEX)?.unwrap_or(0) < meta.index {
            self.stable.set_u64(KEY_COMMIT_INDEX, meta.index)?;
        }
        self.snapshots.create(snapshot)
    }

    /// Save a locally taken snapshot and compact the log up to its index
    pub fn compact(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let index = snapshot.get_metadata().index;
        let first = self.logs.first_index()?;
        self.snapshots.create(snapshot)?;
        if first > 0 && first <= index {
            self.logs.delete_range(first, index)?;
        }
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        self.snapshots.latest()
    }

    pub fn configuration(&self) -> Result<Option<Configuration>, StoreError> {
        load_configuration(self.stable.as_ref())
    }

    fn first(&self) -> Result<u64, StoreError> {
        match self.logs.first_index()? {
            0 => Ok(self.snapshot_metadata()?.index + 1),
            index => Ok(index),
        }
    }

    fn last(&self) -> Result<u64, StoreError> {
        match self.logs.last_index()? {
            0 => Ok(self.snapshot_metadata()?.index),
            index => Ok(index),
        }
    }
}

fn store_err(err: StoreError) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(err)))
}

impl Storage for NodeStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let mut hard_state = HardState::default();
        hard_state.term = self.stable.get_u64(KEY_CURRENT_TERM).map_err(store_err)?.unwrap_or(0);
        hard_state.vote = self.stable.get_u64(KEY_LAST_VOTE).map_err(store_err)?.unwrap_or(0);
        hard_state.commit = self.stable.get_u64(KEY_COMMIT_INDEX).map_err(store_err)?.unwrap_or(0);

        let conf_state = match self.configuration().map_err(store_err)? {
            Some(configuration) => configuration.conf_state(),
            None => self.snapshot_metadata().map_err(store_err)?.take_conf_state(),
        };

        Ok(RaftState::new(hard_state, conf_state))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let first = self.first().map_err(store_err)?;
        if low < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        let last = self.last().map_err(store_err)?;
        if high > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let mut entries = Vec::with_capacity((high - low) as usize);
        for index in low..high {
            entries.push(self.logs.get_log(index).map_err(store_err)?);
        }
        raft::util::limit_size(&mut entries, max_size.into());
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let meta = self.snapshot_metadata().map_err(store_err)?;
        if idx == meta.index {
            return Ok(meta.term);
        }
        if idx < self.first().map_err(store_err)? {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > self.last().map_err(store_err)? {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(self.logs.get_log(idx).map_err(store_err)?.term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.first().map_err(store_err)
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.last().map_err(store_err)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.snapshots.latest().map_err(store_err)? {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            _ => Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bootstrap::Server;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    fn storage() -> NodeStorage {
        NodeStorage::new(
            Arc::new(InmemStore::new()),
            Arc::new(InmemStore::new()),
            Arc::new(InmemSnapshotStore::new()),
        )
    }

    fn snapshot(index: u64, term: u64) -> Snapshot {
        let mut s = Snapshot::default();
        s.mut_metadata().index = index;
        s.mut_metadata().term = term;
        s.set_data(bytes::Bytes::from_static(b"state"));
        s
    }

    #[test]
    fn test_inmem_log_store_ranges() {
        let store = InmemStore::new();
        assert_eq!(store.first_index().unwrap(), 0);
        assert_eq!(store.last_index().unwrap(), 0);

        store.store_logs(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.get_log(3).unwrap().term, 2);

        store.delete_range(1, 2).unwrap();
        assert_eq!(store.first_index().unwrap(), 3);
        assert_eq!(store.get_log(1), Err(StoreError::LogNotFound { index: 1 }));
    }

    #[test]
    fn test_stable_store_u64() {
        let store = InmemStore::new();
        assert_eq!(store.get_u64(KEY_CURRENT_TERM).unwrap(), None);
        store.set_u64(KEY_CURRENT_TERM, 7).unwrap();
        assert_eq!(store.get_u64(KEY_CURRENT_TERM).unwrap(), Some(7));

        store.set(KEY_LAST_VOTE, vec![1, 2]).unwrap();
        assert!(matches!(store.get_u64(KEY_LAST_VOTE), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_empty_storage_initial_state() {
        let storage = storage();
        assert!(!storage.has_state().unwrap());
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 0);
        assert_eq!(storage.term(0).unwrap(), 0);

        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state, HardState::default());
        assert!(state.conf_state.voters.is_empty());
    }

    #[test]
    fn test_initial_state_reads_configuration() {
        let storage = storage();
        let configuration = Configuration {
            servers: vec![
                Server { id: 1, address: "node-0".to_string() },
                Server { id: 2, address: "node-1".to_string() },
            ],
        };
        store_configuration(storage.stable.as_ref(), &configuration).unwrap();

        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1, 2]);
        assert_eq!(storage.configuration().unwrap(), Some(configuration));
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let storage = storage();
        storage.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        storage.append(&[entry(2, 2)]).unwrap();

        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 2);
        assert!(storage.has_state().unwrap());
    }

    #[test]
    fn test_entries_bounds() {
        let storage = storage();
        storage.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();

        let entries = storage.entries(1, 4, None, GetEntriesContext::empty(false)).unwrap();
        assert_eq!(entries.len(), 3);

        assert!(matches!(
            storage.entries(1, 5, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Unavailable))
        ));
    }

    #[test]
    fn test_compact_moves_first_index() {
        let storage = storage();
        storage.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        storage.compact(snapshot(2, 1)).unwrap();

        assert_eq!(storage.first_index().unwrap(), 3);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(2).unwrap(), 1);
        assert!(matches!(
            storage.term(1),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        assert_eq!(storage.snapshot(2, 0).unwrap().get_metadata().index, 2);
        assert!(storage.snapshot(3, 0).is_err());
    }

    #[test]
    fn test_install_snapshot_replaces_log() {
        let storage = storage();
        storage.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        storage.install_snapshot(snapshot(5, 3)).unwrap();

        assert_eq!(storage.first_index().unwrap(), 6);
        assert_eq!(storage.last_index().unwrap(), 5);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 3);
        assert_eq!(state.hard_state.commit, 5);
    }
}
