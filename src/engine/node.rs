//! Raft node
//!
//! `Raft` is a cheap handle to a node whose raft-rs `RawNode` lives in a
//! dedicated driver task. The driver owns the FSM and the storage adapter and
//! reacts to four event sources:
//! - the logical clock (`RawNode::tick`)
//! - the commit broadcast timer (`RawNode::ping`, leader only)
//! - peer messages delivered by the transport
//! - commands from the handle (apply, snapshot, shutdown)

use crate::engine::config::Config;
use crate::engine::errors::{RaftError, TransportError};
use crate::engine::state_machine::Fsm;
use crate::engine::storage::{LogStore, NodeStorage, SnapshotStore, StableStore};
use crate::engine::transport::Transport;
use raft::prelude::*;
use raft::{StateRole, Storage};
use slog::{debug, error, info, warn, Logger};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Observable state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    /// Campaigning, including the pre-vote phase
    Candidate,
    Leader,
    /// The driver has exited
    Shutdown,
}

enum Command {
    Apply {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    Shutdown,
}

/// Handle to a running Raft node
pub struct Raft {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NodeState>,
    leader: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
    driver: Mutex<Option<JoinHandle<Result<(), RaftError>>>>,
    logger: Logger,
}

impl Raft {
    /// Start a node on top of the given stores and transport.
    ///
    /// The stores must either hold state from a previous run or have been
    /// prepared with `bootstrap_cluster`; a node with neither starts without
    /// membership and never campaigns. Must be called inside a tokio runtime.
    pub fn new<F: Fsm>(
        config: Config,
        fsm: F,
        logs: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        snapshots: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Raft, RaftError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| RaftError::Driver(e.to_string()))?;
        let inbound = transport.take_consumer().ok_or_else(|| TransportError::ConsumerTaken {
            address: transport.local_addr(),
        })?;

        let logger = config.logger.clone();
        let storage = NodeStorage::new(logs, stable, snapshots);

        let peers: HashMap<u64, String> = storage
            .configuration()?
            .map(|configuration| {
                configuration
                    .servers
                    .into_iter()
                    .filter(|server| server.id != config.local_id)
                    .map(|server| (server.id, server.address))
                    .collect()
            })
            .unwrap_or_default();

        let mut fsm: Box<dyn Fsm> = Box::new(fsm);
        let mut applied = 0;
        if let Some(snapshot) = storage.latest_snapshot()? {
            fsm.restore(snapshot.get_data()).map_err(|e| RaftError::Fsm(e.to_string()))?;
            applied = snapshot.get_metadata().index;
            info!(logger, "Restored state machine from snapshot"; "index" => applied);
        }

        let conf_state = storage.initial_state()?.conf_state;
        let raw_node = RawNode::new(&config.to_raft_config(applied), storage, &logger)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NodeState::Follower);
        let leader = Arc::new(AtomicU64::new(0));
        let applied_shared = Arc::new(AtomicU64::new(applied));

        info!(logger, "Starting raft node";
            "address" => transport.local_addr(),
            "peers" => peers.len(),
            "tick" => format!("{:?}", config.tick_interval())
        );

        let driver = Driver {
            raw_node,
            fsm,
            transport,
            peers,
            inbound,
            commands: command_rx,
            notify: config.notify.clone(),
            state_tx,
            leader: leader.clone(),
            applied: applied_shared.clone(),
            applied_index: applied,
            conf_state,
            pending: BTreeMap::new(),
            is_leader: false,
            tick_interval: config.tick_interval(),
            commit_timeout: config.commit_timeout,
            logger: logger.clone(),
        };
        let handle = runtime.spawn(driver.run());

        Ok(Raft {
            id: config.local_id,
            commands: command_tx,
            state: state_rx,
            leader,
            applied: applied_shared,
            driver: Mutex::new(Some(handle)),
            logger,
        })
    }

    /// Raft node id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Id of the current leader as known by this node
    pub fn leader(&self) -> Option<u64> {
        match self.leader.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Index of the last entry handed to the FSM
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Replicate a command and wait until it has been applied locally.
    ///
    /// Returns the log index of the command. Only the leader accepts
    /// commands.
    pub async fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<u64, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Apply { data, reply })
            .map_err(|_| RaftError::Shutdown)?;
        match time::timeout(timeout, rx).await {
            Err(_) => Err(RaftError::Timeout),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    /// Snapshot the FSM at the applied index and compact the log.
    ///
    /// Returns the index the snapshot covers.
    pub async fn snapshot(&self) -> Result<u64, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Ask the node to stop.
    ///
    /// The returned future resolves once the driver has exited. Only the
    /// first call observes the driver's outcome; later calls resolve `Ok`.
    pub fn shutdown(&self) -> ShutdownFuture {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        debug!(self.logger, "Shutdown requested"; "first" => handle.is_some());
        ShutdownFuture { handle }
    }
}

/// Completion of `Raft::shutdown`
pub struct ShutdownFuture {
    handle: Option<JoinHandle<Result<(), RaftError>>>,
}

impl ShutdownFuture {
    /// Wait for the driver to exit and return its error, if any
    pub async fn error(self) -> Result<(), RaftError> {
        match self.handle {
            None => Ok(()),
            Some(handle) => handle.await.map_err(|e| RaftError::Driver(e.to_string()))?,
        }
    }
}

struct Pending {
    term: u64,
    reply: oneshot::Sender<Result<u64, RaftError>>,
}

struct Driver {
    raw_node: RawNode<NodeStorage>,
    fsm: Box<dyn Fsm>,
    transport: Arc<dyn Transport>,

    /// Peer id → transport address
    peers: HashMap<u64, String>,

    inbound: mpsc::UnboundedReceiver<Message>,
    commands: mpsc::UnboundedReceiver<Command>,
    notify: Option<mpsc::Sender<bool>>,

    state_tx: watch::Sender<NodeState>,
    leader: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
    applied_index: u64,
    conf_state: ConfState,

    /// Proposals awaiting application, keyed by log index
    pending: BTreeMap<u64, Pending>,
    is_leader: bool,

    tick_interval: Duration,
    commit_timeout: Duration,
    logger: Logger,
}

impl Driver {
    async fn run(mut self) -> Result<(), RaftError> {
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!(self.logger, "Raft driver failed"; "error" => %e);
        }
        self.finish();
        result
    }

    async fn event_loop(&mut self) -> Result<(), RaftError> {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit_timer = time::interval(self.commit_timeout);
        commit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raw_node.tick();
                }

                _ = commit_timer.tick() => {
                    if self.is_leader {
                        self.raw_node.ping();
                    }
                }

                msg = self.inbound.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.raw_node.step(msg) {
                                debug!(self.logger, "Ignoring message"; "error" => %e);
                            }
                        }
                        None => {
                            info!(self.logger, "Transport closed, shutting down");
                            return Ok(());
                        }
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Apply { data, reply }) => self.propose(data, reply),
                        Some(Command::Snapshot { reply }) => {
                            let _ = reply.send(self.take_snapshot());
                        }
                        Some(Command::Shutdown) | None => return Ok(()),
                    }
                }
            }

            self.on_ready()?;
        }
    }

    /// Process a `Ready` from raft-rs
    fn on_ready(&mut self) -> Result<(), RaftError> {
        if !self.raw_node.has_ready() {
            return Ok(());
        }

        let store = self.raw_node.raft.raft_log.store.clone();
        let mut ready = self.raw_node.ready();

        if let Some(ss) = ready.ss() {
            let (role, leader_id) = (ss.raft_state, ss.leader_id);
            self.on_role(role, leader_id);
        }

        // Messages that don't depend on persistence go out first
        for msg in ready.take_messages() {
            self.send(msg);
        }

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.restore(&store, snapshot)?;
        }

        self.apply_entries(ready.take_committed_entries());

        if !ready.entries().is_empty() {
            store.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            store.set_hard_state(hs)?;
        }

        for msg in ready.take_persisted_messages() {
            self.send(msg);
        }

        let mut light_rd = self.raw_node.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            store.set_commit(commit)?;
        }
        for msg in light_rd.take_messages() {
            self.send(msg);
        }
        self.apply_entries(light_rd.take_committed_entries());
        self.raw_node.advance_apply();

        Ok(())
    }

    fn on_role(&mut self, role: StateRole, leader_id: u64) {
        let state = match role {
            StateRole::Leader => NodeState::Leader,
            StateRole::Candidate | StateRole::PreCandidate => NodeState::Candidate,
            StateRole::Follower => NodeState::Follower,
        };
        self.leader.store(leader_id, Ordering::Release);
        self.state_tx.send_replace(state);

        let leading = role == StateRole::Leader;
        if leading == self.is_leader {
            return;
        }
        self.is_leader = leading;
        info!(self.logger, "Role changed";
            "role" => format!("{:?}", role),
            "term" => self.raw_node.raft.term,
            "leader" => leader_id
        );
        self.signal(leading);
        if !leading {
            self.fail_pending(|| RaftError::LeadershipLost);
        }
    }

    /// Report a leadership change without ever blocking the driver
    fn signal(&self, leader: bool) {
        let Some(notify) = &self.notify else {
            return;
        };
        match notify.try_send(leader) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                debug!(self.logger, "Dropped leadership notification"; "leader" => leader);
            }
        }
    }

    fn send(&self, msg: Message) {
        let Some(address) = self.peers.get(&msg.to) else {
            debug!(self.logger, "Dropping message for unknown peer"; "to" => msg.to);
            return;
        };
        if let Err(e) = self.transport.send(address, msg) {
            debug!(self.logger, "Failed to send message"; "error" => %e);
        }
    }

    fn propose(&mut self, data: Vec<u8>, reply: oneshot::Sender<Result<u64, RaftError>>) {
        if !self.is_leader {
            let _ = reply.send(Err(RaftError::NotLeader));
            return;
        }
        match self.raw_node.propose(vec![], data) {
            Ok(()) => {
                let index = self.raw_node.raft.raft_log.last_index();
                let term = self.raw_node.raft.term;
                self.pending.insert(index, Pending { term, reply });
            }
            Err(raft::Error::ProposalDropped) => {
                let _ = reply.send(Err(RaftError::NotLeader));
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.index <= self.applied_index {
                continue;
            }
            let outcome = match entry.get_entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => Ok(()),
                EntryType::EntryNormal => self.fsm.apply(entry.index, &entry.data).map_err(|e| {
                    error!(self.logger, "FSM failed to apply entry"; "index" => entry.index, "error" => %e);
                    e.to_string()
                }),
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    warn!(self.logger, "Ignoring membership change"; "index" => entry.index);
                    Ok(())
                }
            };
            self.applied_index = entry.index;
            self.applied.store(entry.index, Ordering::Release);
            self.resolve(entry.index, entry.term, outcome);
        }
    }

    /// Answer every proposal at or below `index`. Only an exact index and
    /// term match is the proposal that was applied.
    fn resolve(&mut self, index: u64, term: u64, outcome: Result<(), String>) {
        while let Some(pending) = self.pending.first_entry() {
            if *pending.key() > index {
                break;
            }
            let (at, pending) = pending.remove_entry();
            let result = if at == index && pending.term == term {
                outcome.clone().map(|()| index).map_err(RaftError::Fsm)
            } else {
                Err(RaftError::LeadershipLost)
            };
            let _ = pending.reply.send(result);
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(err()));
        }
    }

    fn restore(&mut self, store: &NodeStorage, snapshot: Snapshot) -> Result<(), RaftError> {
        let meta = snapshot.get_metadata().clone();
        self.fsm
            .restore(snapshot.get_data())
            .map_err(|e| RaftError::Fsm(e.to_string()))?;
        store.install_snapshot(snapshot)?;
        self.conf_state = meta.get_conf_state().clone();
        self.applied_index = meta.index;
        self.applied.store(meta.index, Ordering::Release);
        info!(self.logger, "Installed snapshot from leader"; "index" => meta.index, "term" => meta.term);
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<u64, RaftError> {
        let index = self.applied_index;
        let store = self.raw_node.raft.raft_log.store.clone();
        let latest = store
            .latest_snapshot()?
            .map(|snapshot| snapshot.get_metadata().index)
            .unwrap_or(0);
        if index == 0 || index <= latest {
            return Err(RaftError::NothingNewToSnapshot);
        }

        let data = self.fsm.snapshot().map_err(|e| RaftError::Fsm(e.to_string()))?;
        let term = self.raw_node.raft.raft_log.term(index)?;

        let mut snapshot = Snapshot::default();
        snapshot.set_data(data.into());
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(self.conf_state.clone());

        store.compact(snapshot)?;
        info!(self.logger, "Snapshot taken"; "index" => index, "term" => term);
        Ok(index)
    }

    fn finish(&mut self) {
        self.state_tx.send_replace(NodeState::Shutdown);
        self.leader.store(0, Ordering::Release);
        if self.is_leader {
            self.is_leader = false;
            self.signal(false);
        }
        self.fail_pending(|| RaftError::Shutdown);
        self.notify = None;
        info!(self.logger, "Raft node stopped"; "applied" => self.applied_index);
    }
}
