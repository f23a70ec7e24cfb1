//! Node components shared by the stages of every chain.

use crate::control::topology::{NodeId, OwnershipOracle};
use crate::core::config::{CacheMode, Config};
use crate::core::lifecycle::{ComponentStatus, StatusCell};
use crate::invocation::locks::{LockManager, PendingTransactions};
use crate::net::transport::Transport;
use crate::storage::DataContainer;
use std::sync::Arc;
use std::time::Duration;

/// Everything a stage may consult besides the context and the command.
pub struct NodeComponents {
    pub local: NodeId,
    pub config: Arc<Config>,
    pub oracle: Arc<dyn OwnershipOracle>,
    pub container: Arc<DataContainer>,
    pub locks: LockManager,
    pub transport: Arc<dyn Transport>,
    pub status: StatusCell,
    pub pending: PendingTransactions,
}

impl NodeComponents {
    pub fn new(
        config: Arc<Config>,
        oracle: Arc<dyn OwnershipOracle>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local: NodeId::new(config.node.node_id.clone()),
            container: Arc::new(DataContainer::new()),
            locks: LockManager::new(config.locking.concurrency_level),
            status: StatusCell::new(ComponentStatus::Instantiated),
            pending: PendingTransactions::new(),
            config,
            oracle,
            transport,
        }
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.config.clustering.cache_mode
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    pub fn remote_timeout(&self) -> Duration {
        self.config.remote_timeout()
    }
}

impl std::fmt::Debug for NodeComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeComponents")
            .field("local", &self.local)
            .field("cache_mode", &self.cache_mode())
            .field("status", &self.status.get())
            .field("locks", &self.locks)
            .finish()
    }
}
