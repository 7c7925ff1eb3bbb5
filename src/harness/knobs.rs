//! General purpose knobs

use crate::engine::Raft;
use crate::harness::cluster::{Cluster, Knob};
use std::sync::Arc;

/// Limit bootstrap to the nodes at `indices`.
///
/// The remaining nodes start without membership and without peers, so they
/// stay followers and never campaign.
pub fn servers(indices: &[usize]) -> Servers {
    Servers {
        indices: indices.to_vec(),
    }
}

/// Knob returned by `servers`
pub struct Servers {
    indices: Vec<usize>,
}

impl Knob for Servers {
    fn pre(&self, cluster: &mut Cluster) {
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= cluster.len()) {
            let message = format!("servers knob: no node with index {} in a cluster of {}", bad, cluster.len());
            cluster.reporter().fatal(&message);
        }
        for (i, deps) in cluster.iter_mut() {
            deps.bootstrap = self.indices.contains(&i);
        }
    }

    fn post(&self, _rafts: &[Arc<Raft>]) {}
}
