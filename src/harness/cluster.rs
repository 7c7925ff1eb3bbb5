//! Cluster construction and teardown

use crate::config::TestTimings;
use crate::engine::{
    bootstrap_cluster, Config, Configuration, Fsm, InmemSnapshotStore, InmemStore, InmemTransport, KvStateMachine,
    LogStore, Raft, Server, SnapshotStore, StableStore, Transport,
};
use crate::harness::reporter::TestReporter;
use crate::logging::test_logger;
use slog::{o, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

/// Upper bound on tearing a whole cluster down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start one node.
///
/// Knobs may replace or tweak any of it during their `pre` phase.
pub struct NodeDeps {
    pub config: Config,
    pub logs: Arc<dyn LogStore>,
    pub stable: Arc<dyn StableStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn Transport>,

    /// Membership written to this node's stores at bootstrap
    pub configuration: Option<Configuration>,

    /// Whether the node founds the cluster. Nodes that don't start without
    /// membership or peers.
    pub bootstrap: bool,
}

impl NodeDeps {
    fn new(index: usize, timings: &TestTimings, logger: &Logger) -> Self {
        let address = format!("node-{}", index);
        let mut config = Config {
            local_id: index as u64 + 1,
            logger: logger.new(o!("node" => address.clone())),
            ..Default::default()
        };
        timings.apply(&mut config);

        Self {
            config,
            logs: Arc::new(InmemStore::new()),
            stable: Arc::new(InmemStore::new()),
            snapshots: Arc::new(InmemSnapshotStore::new()),
            transport: Arc::new(InmemTransport::new(address)),
            configuration: None,
            bootstrap: true,
        }
    }
}

/// Dependency sets of a cluster under construction, keyed by node index
pub struct Cluster {
    reporter: Arc<dyn TestReporter>,
    nodes: BTreeMap<usize, NodeDeps>,
}

impl Cluster {
    fn new(reporter: Arc<dyn TestReporter>, n: usize, timings: TestTimings) -> Self {
        let logger = test_logger();
        let nodes = (0..n).map(|i| (i, NodeDeps::new(i, &timings, &logger))).collect();
        Self { reporter, nodes }
    }

    pub fn reporter(&self) -> &Arc<dyn TestReporter> {
        &self.reporter
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&NodeDeps> {
        self.nodes.get(&index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut NodeDeps> {
        self.nodes.get_mut(&index)
    }

    /// Dependency sets in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &NodeDeps)> {
        self.nodes.iter().map(|(i, deps)| (*i, deps))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut NodeDeps)> {
        self.nodes.iter_mut().map(|(i, deps)| (*i, deps))
    }

    /// Connect the founding nodes to each other and write the shared
    /// membership to each of them
    fn bootstrap(&mut self) {
        let founders: Vec<usize> = self.iter().filter(|(_, deps)| deps.bootstrap).map(|(i, _)| i).collect();
        if founders.is_empty() {
            return;
        }

        let mut servers = Vec::with_capacity(founders.len());
        for &i in &founders {
            let node = &self.nodes[&i];
            servers.push(Server {
                id: node.config.local_id,
                address: node.transport.local_addr(),
            });

            let Some(peers) = node.transport.with_peers() else {
                self.reporter
                    .fatal(&format!("transport of node {} does not support connecting peers", i));
            };
            for &j in founders.iter().filter(|&&j| j != i) {
                let other = &self.nodes[&j].transport;
                peers.connect(other.local_addr(), other.clone());
            }
        }

        let configuration = Configuration { servers };
        for &i in &founders {
            let Some(node) = self.nodes.get_mut(&i) else {
                continue;
            };
            if let Err(e) = bootstrap_cluster(
                &node.config,
                node.logs.clone(),
                node.stable.clone(),
                node.snapshots.clone(),
                &configuration,
            ) {
                self.reporter.fatal(&format!("failed to bootstrap node {}: {}", i, e));
            }
            node.configuration = Some(configuration.clone());
        }
    }

    /// Construct one node per dependency set
    fn start<F: Fsm>(&self, fsms: Vec<F>) -> Vec<Arc<Raft>> {
        let mut rafts: Vec<Arc<Raft>> = Vec::with_capacity(fsms.len());
        for ((i, node), fsm) in self.iter().zip(fsms) {
            match Raft::new(
                node.config.clone(),
                fsm,
                node.logs.clone(),
                node.stable.clone(),
                node.snapshots.clone(),
                node.transport.clone(),
            ) {
                Ok(raft) => rafts.push(Arc::new(raft)),
                Err(e) => {
                    for raft in &rafts {
                        drop(raft.shutdown());
                    }
                    self.reporter
                        .fatal(&format!("failed to start test raft node {}: {}", i, e));
                }
            }
        }
        rafts
    }
}

/// Two-phase hook for customizing a test cluster.
///
/// Each phase runs for every knob, in the order the knobs were given, before
/// the next phase starts.
pub trait Knob: Send + Sync {
    /// Called before any node exists; may change any dependency set
    fn pre(&self, cluster: &mut Cluster);

    /// Called once every node has been started
    fn post(&self, rafts: &[Arc<Raft>]);
}

/// Start an in-memory cluster with one node per FSM.
///
/// Nodes are indexed in FSM order. Node `i` has raft id `i + 1` and transport
/// address `node-i`. Every failure is reported through `reporter`. Must be
/// called inside a tokio runtime.
pub fn cluster<F: Fsm>(
    reporter: &Arc<dyn TestReporter>,
    fsms: Vec<F>,
    knobs: &[&dyn Knob],
) -> (Vec<Arc<Raft>>, Control) {
    if fsms.is_empty() {
        reporter.fatal("a cluster needs at least one node");
    }

    let mut cluster = Cluster::new(reporter.clone(), fsms.len(), TestTimings::from_env());
    for knob in knobs {
        knob.pre(&mut cluster);
    }

    cluster.bootstrap();
    let rafts = cluster.start(fsms);

    for knob in knobs {
        knob.post(&rafts);
    }

    let control = Control {
        reporter: reporter.clone(),
        rafts: rafts.clone(),
    };
    (rafts, control)
}

/// Teardown handle returned by `cluster`
pub struct Control {
    reporter: Arc<dyn TestReporter>,
    rafts: Vec<Arc<Raft>>,
}

impl Control {
    /// Shut every node down. Safe to call more than once, and after some
    /// nodes have already been shut down individually.
    pub async fn close(&self) {
        shutdown(&self.reporter, &self.rafts).await;
    }

    pub fn rafts(&self) -> &[Arc<Raft>] {
        &self.rafts
    }
}

/// Shut down the given nodes concurrently.
///
/// Fatal if any node reports an error or the nodes together take longer
/// than 5 seconds.
pub async fn shutdown(reporter: &Arc<dyn TestReporter>, rafts: &[Arc<Raft>]) {
    let (done_tx, mut done_rx) = mpsc::channel(rafts.len().max(1));
    for (i, raft) in rafts.iter().enumerate() {
        let future = raft.shutdown();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let _ = done_tx.send((i, future.error().await)).await;
        });
    }
    drop(done_tx);

    let timeout = time::sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);

    for _ in rafts {
        tokio::select! {
            _ = &mut timeout => {
                reporter.fatal(&format!("cluster did not shutdown within {} seconds", SHUTDOWN_TIMEOUT.as_secs()));
            }
            done = done_rx.recv() => match done {
                Some((_, Ok(()))) => {}
                Some((i, Err(e))) => reporter.fatal(&format!("failed to shutdown raft node {}: {}", i, e)),
                None => reporter.fatal("shutdown task exited without reporting"),
            }
        }
    }
}

/// Index of the first node not listed in `excluded`
pub fn other(rafts: &[Arc<Raft>], excluded: &[usize]) -> Option<usize> {
    (0..rafts.len()).find(|i| !excluded.contains(i))
}

/// `n` independent test FSMs
pub fn fsms(n: usize) -> Vec<KvStateMachine> {
    (0..n).map(|_| KvStateMachine::new()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::reporter::PanicReporter;
    use raft::prelude::Message;
    use std::sync::Mutex;

    /// Records every phase it sees into a log shared with other recorders
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Knob for Recorder {
        fn pre(&self, cluster: &mut Cluster) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:pre:{}", self.name, cluster.len()));
        }

        fn post(&self, rafts: &[Arc<Raft>]) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:post:{}", self.name, rafts.len()));
        }
    }

    #[test]
    fn test_other_without_nodes() {
        assert_eq!(other(&[], &[]), None);
    }

    #[test]
    fn test_fsms_are_independent() {
        let mut machines = fsms(2);
        machines[0]
            .apply(
                1,
                &crate::engine::KvCommand::Set {
                    key: "k".to_string(),
                    value: "v".to_string(),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        assert_eq!(machines[0].get("k"), Some("v".to_string()));
        assert_eq!(machines[1].get("k"), None);
    }

    #[tokio::test]
    async fn test_knob_phases_run_in_order() {
        let reporter = PanicReporter::shared();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Recorder { name: "a", log: log.clone() };
        let second = Recorder { name: "b", log: log.clone() };

        let (rafts, control) = cluster(&reporter, fsms(2), &[&first, &second]);
        assert_eq!(rafts.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:pre:2", "b:pre:2", "a:post:2", "b:post:2"]);

        control.close().await;
    }

    #[test]
    fn test_node_identity_and_mesh() {
        let reporter = PanicReporter::shared();
        let mut cluster = Cluster::new(reporter, 3, TestTimings::default());
        cluster.bootstrap();

        for (i, node) in cluster.iter() {
            assert_eq!(node.config.local_id, i as u64 + 1);
            assert_eq!(node.transport.local_addr(), format!("node-{}", i));
            let configuration = node.configuration.as_ref().unwrap();
            assert_eq!(configuration.servers.len(), 3);
            assert_eq!(configuration.address_of(i as u64 + 1), Some(format!("node-{}", i).as_str()));
        }

        for (i, node) in cluster.iter() {
            for j in (0..3).filter(|&j| j != i) {
                assert!(node.transport.send(&format!("node-{}", j), Message::default()).is_ok());
            }
            assert!(node.transport.send("node-9", Message::default()).is_err());
        }
    }

    #[test]
    #[should_panic(expected = "does not support connecting peers")]
    fn test_transport_without_peers_is_fatal() {
        struct Isolated(InmemTransport);

        impl Transport for Isolated {
            fn local_addr(&self) -> String {
                self.0.local_addr()
            }

            fn send(&self, target: &str, message: Message) -> Result<(), crate::engine::TransportError> {
                self.0.send(target, message)
            }

            fn receive(&self, message: Message) -> Result<(), crate::engine::TransportError> {
                self.0.receive(message)
            }

            fn take_consumer(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
                self.0.take_consumer()
            }
        }

        let mut cluster = Cluster::new(PanicReporter::shared(), 2, TestTimings::default());
        if let Some(node) = cluster.node_mut(1) {
            node.transport = Arc::new(Isolated(InmemTransport::new("node-1")));
        }
        cluster.bootstrap();
    }

    #[test]
    #[should_panic(expected = "at least one node")]
    fn test_empty_cluster_is_fatal() {
        let reporter = PanicReporter::shared();
        let _ = cluster(&reporter, fsms(0), &[]);
    }
}
