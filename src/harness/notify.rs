//! Leadership notifications
//!
//! The `notify` knob gives every node its own leadership channel and merges
//! them into a single ordered stream of `LeadershipChange`s. Nodes drop out
//! of the merge as they shut down and close their channel.

use crate::engine::{NodeState, Raft};
use crate::harness::cluster::{Cluster, Knob};
use crate::harness::reporter::TestReporter;
use crate::harness::wait::{wait_leader, wait_until, POLL_INTERVAL};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

/// Capacity of each node's leadership channel, large enough that a node
/// never has to drop a notification during a test
const NODE_CHANNEL_CAPACITY: usize = 1000;

/// A node acquired or lost leadership
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeadershipChange {
    /// Index of the node in the cluster
    pub node: usize,
    pub acquired: bool,
}

/// Create a `Notify` knob
pub fn notify() -> Notify {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    Notify {
        reporter: OnceLock::new(),
        events_tx: Mutex::new(Some(events_tx)),
        events_rx: tokio::sync::Mutex::new(events_rx),
        rafts: OnceLock::new(),
    }
}

/// Knob exposing waits on leadership changes across the cluster
pub struct Notify {
    reporter: OnceLock<Arc<dyn TestReporter>>,

    /// Handed to the merge task by `pre`
    events_tx: Mutex<Option<mpsc::UnboundedSender<LeadershipChange>>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LeadershipChange>>,

    rafts: OnceLock<Vec<Arc<Raft>>>,
}

impl Notify {
    /// Wait for a node to acquire leadership and return its index.
    ///
    /// Loss events received meanwhile are discarded. The node's state is
    /// confirmed before returning; failure to see a matching, confirmed
    /// event within `timeout` is fatal.
    pub async fn next_acquired(&self, timeout: Duration) -> usize {
        self.next_matching(timeout, true).await
    }

    /// Wait for a node to lose leadership and return its index.
    ///
    /// Acquisition events received meanwhile are discarded.
    pub async fn next_lost(&self, timeout: Duration) -> usize {
        self.next_matching(timeout, false).await
    }

    async fn next_matching(&self, timeout: Duration, acquired: bool) -> usize {
        let (reporter, rafts) = self.attached();
        let deadline = Instant::now() + timeout;

        let change = loop {
            let change = self.next(reporter.as_ref(), timeout, deadline).await;
            if change.acquired == acquired {
                break change;
            }
        };

        let raft = &rafts[change.node];
        let remaining = deadline.saturating_duration_since(Instant::now());
        let verb = if acquired {
            wait_leader(reporter.as_ref(), raft, remaining).await;
            "acquired"
        } else {
            wait_until(
                reporter.as_ref(),
                || raft.state() != NodeState::Leader,
                remaining,
                POLL_INTERVAL,
                "leader state not lost",
            )
            .await;
            "lost"
        };
        reporter.log(&format!("node {} {} leadership", change.node, verb));
        change.node
    }

    async fn next(&self, reporter: &dyn TestReporter, timeout: Duration, deadline: Instant) -> LeadershipChange {
        let mut events = self.events_rx.lock().await;
        match time::timeout_at(deadline, events.recv()).await {
            Ok(Some(change)) => change,
            Ok(None) => reporter.fatal("leadership notifications stopped: every node has shut down"),
            Err(_) => reporter.fatal(&format!("no notification received within {:?}", timeout)),
        }
    }

    fn attached(&self) -> (&Arc<dyn TestReporter>, &[Arc<Raft>]) {
        match (self.reporter.get(), self.rafts.get()) {
            (Some(reporter), Some(rafts)) => (reporter, rafts.as_slice()),
            (Some(reporter), None) => reporter.fatal("notify knob used before the cluster was started"),
            (None, _) => panic!("notify knob was not passed to cluster"),
        }
    }
}

impl Knob for Notify {
    fn pre(&self, cluster: &mut Cluster) {
        let reporter = self.reporter.get_or_init(|| cluster.reporter().clone());
        let Some(events_tx) = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            reporter.fatal("notify knob can only be used with one cluster");
        };

        let mut channels = StreamMap::new();
        for (index, deps) in cluster.iter_mut() {
            let (tx, rx) = mpsc::channel(NODE_CHANNEL_CAPACITY);
            deps.config.notify = Some(tx);
            channels.insert(index, ReceiverStream::new(rx));
        }
        tokio::spawn(watch(channels, events_tx));
    }

    fn post(&self, rafts: &[Arc<Raft>]) {
        let _ = self.rafts.set(rafts.to_vec());
    }
}

/// Forward every node's leadership signals until all nodes have closed
/// their channel
async fn watch(
    mut channels: StreamMap<usize, ReceiverStream<bool>>,
    events: mpsc::UnboundedSender<LeadershipChange>,
) {
    while let Some((node, acquired)) = channels.next().await {
        if events.send(LeadershipChange { node, acquired }).is_err() {
            // Knob dropped, nobody is listening
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::reporter::PanicReporter;

    #[tokio::test]
    async fn test_watch_merges_and_ends_when_all_closed() {
        let (tx0, rx0) = mpsc::channel(10);
        let (tx1, rx1) = mpsc::channel(10);
        let mut channels = StreamMap::new();
        channels.insert(0, ReceiverStream::new(rx0));
        channels.insert(1, ReceiverStream::new(rx1));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watch(channels, events_tx));

        tx1.send(true).await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(LeadershipChange { node: 1, acquired: true })
        );

        // A closed channel produces no event and leaves the others running
        drop(tx0);
        tx1.send(false).await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(LeadershipChange { node: 1, acquired: false })
        );

        drop(tx1);
        task.await.unwrap();
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_watch_preserves_per_node_order() {
        let (tx, rx) = mpsc::channel(10);
        let mut channels = StreamMap::new();
        channels.insert(2, ReceiverStream::new(rx));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch(channels, events_tx));

        for acquired in [true, false, true] {
            tx.send(acquired).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(change) = events_rx.recv().await {
            assert_eq!(change.node, 2);
            seen.push(change.acquired);
        }
        assert_eq!(seen, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_discarded_events_count_against_timeout() {
        let knob = Arc::new(notify());
        let _ = knob.reporter.set(PanicReporter::shared());
        let _ = knob.rafts.set(Vec::new());
        let events = knob.events_tx.lock().unwrap().take().unwrap();

        // Keeps delivering acquisitions well past the timeout
        let feeder = tokio::spawn(async move {
            for _ in 0..50 {
                if events.send(LeadershipChange { node: 0, acquired: true }).is_err() {
                    return;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        });

        let start = Instant::now();
        let waiter = knob.clone();
        let err = tokio::spawn(async move { waiter.next_lost(Duration::from_millis(100)).await })
            .await
            .expect_err("next_lost should have failed");
        let elapsed = start.elapsed();
        feeder.abort();

        let message = err.into_panic().downcast::<String>().unwrap();
        assert!(message.contains("no notification received within 100ms"), "{}", message);
        assert!(elapsed >= Duration::from_millis(100), "failed too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(300), "failed too late: {:?}", elapsed);
    }

    #[test]
    #[should_panic(expected = "notify knob was not passed to cluster")]
    fn test_unattached_knob_panics() {
        let knob = notify();
        let _ = knob.attached();
    }
}
