//! Initial cluster membership

use crate::engine::config::Config;
use crate::engine::errors::BootstrapError;
use crate::engine::storage::{store_configuration, LogStore, NodeStorage, SnapshotStore, StableStore};
use raft::prelude::ConfState;
use serde::{Deserialize, Serialize};
use slog::info;
use std::collections::HashSet;
use std::sync::Arc;

/// A voting member of the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Raft node id
    pub id: u64,

    /// Transport address the other members reach this node at
    pub address: String,
}

/// Cluster membership
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    /// raft-rs view of the membership (everyone votes)
    pub fn conf_state(&self) -> ConfState {
        ConfState::from((self.servers.iter().map(|s| s.id).collect::<Vec<_>>(), vec![]))
    }

    /// Address of the server with the given id
    pub fn address_of(&self, id: u64) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.address.as_str())
    }

    /// Reject empty memberships, id 0, and duplicate ids or addresses
    pub fn check(&self) -> Result<(), BootstrapError> {
        if self.servers.is_empty() {
            return Err(BootstrapError::EmptyConfiguration);
        }
        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for server in &self.servers {
            if server.id == 0 {
                return Err(BootstrapError::InvalidServerId);
            }
            if !ids.insert(server.id) {
                return Err(BootstrapError::DuplicateId(server.id));
            }
            if !addresses.insert(server.address.as_str()) {
                return Err(BootstrapError::DuplicateAddress(server.address.clone()));
            }
        }
        Ok(())
    }
}

/// Write the initial membership to a brand new node's stores.
///
/// Every founding member must be bootstrapped with an identical
/// configuration before any of them is started. Fails with
/// `CantBootstrap` if the stores already hold raft state.
pub fn bootstrap_cluster(
    config: &Config,
    logs: Arc<dyn LogStore>,
    stable: Arc<dyn StableStore>,
    snapshots: Arc<dyn SnapshotStore>,
    configuration: &Configuration,
) -> Result<(), BootstrapError> {
    config.validate()?;
    configuration.check()?;

    let storage = NodeStorage::new(logs, stable.clone(), snapshots);
    if storage.has_state()? {
        return Err(BootstrapError::CantBootstrap);
    }

    store_configuration(stable.as_ref(), configuration)?;
    info!(config.logger, "Bootstrapped cluster membership";
        "local_id" => config.local_id,
        "servers" => configuration.servers.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{load_configuration, InmemSnapshotStore, InmemStore, KEY_CURRENT_TERM};

    fn config() -> Config {
        Config {
            local_id: 1,
            ..Default::default()
        }
    }

    fn three_servers() -> Configuration {
        Configuration {
            servers: (1..=3)
                .map(|id| Server {
                    id,
                    address: format!("node-{}", id - 1),
                })
                .collect(),
        }
    }

    #[test]
    fn test_bootstrap_writes_configuration() {
        let stable = Arc::new(InmemStore::new());
        bootstrap_cluster(
            &config(),
            Arc::new(InmemStore::new()),
            stable.clone(),
            Arc::new(InmemSnapshotStore::new()),
            &three_servers(),
        )
        .unwrap();

        let stored = load_configuration(stable.as_ref()).unwrap();
        assert_eq!(stored, Some(three_servers()));
        assert_eq!(three_servers().conf_state().voters, vec![1, 2, 3]);
        assert_eq!(three_servers().address_of(2), Some("node-1"));
    }

    #[test]
    fn test_bootstrap_refuses_existing_state() {
        let stable = Arc::new(InmemStore::new());
        stable.set_u64(KEY_CURRENT_TERM, 3).unwrap();

        let result = bootstrap_cluster(
            &config(),
            Arc::new(InmemStore::new()),
            stable,
            Arc::new(InmemSnapshotStore::new()),
            &three_servers(),
        );
        assert_eq!(result, Err(BootstrapError::CantBootstrap));
    }

    #[test]
    fn test_configuration_check() {
        assert_eq!(Configuration::default().check(), Err(BootstrapError::EmptyConfiguration));

        let mut dup_id = three_servers();
        dup_id.servers[2].id = 1;
        assert_eq!(dup_id.check(), Err(BootstrapError::DuplicateId(1)));

        let mut dup_addr = three_servers();
        dup_addr.servers[1].address = "node-0".to_string();
        assert_eq!(
            dup_addr.check(),
            Err(BootstrapError::DuplicateAddress("node-0".to_string()))
        );

        let mut zero = three_servers();
        zero.servers[0].id = 0;
        assert_eq!(zero.check(), Err(BootstrapError::InvalidServerId));
    }

    #[test]
    fn test_bootstrap_validates_config() {
        let result = bootstrap_cluster(
            &Config::default(),
            Arc::new(InmemStore::new()),
            Arc::new(InmemStore::new()),
            Arc::new(InmemSnapshotStore::new()),
            &three_servers(),
        );
        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
