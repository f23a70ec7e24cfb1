//! In-process cluster runtime.
//!
//! The runtime builds one [`CacheNode`] per configured member, all sharing
//! a [`HashRingOracle`] and a [`LocalCluster`] transport:
//! - Start order: oracle → transport → nodes (in member order)
//! - Shutdown order: nodes (reverse member order) → transport

use crate::cache::CacheNode;
use crate::control::topology::{HashRingOracle, NodeId, OwnershipOracle};
use crate::core::config::Config;
use crate::net::local::LocalCluster;
use crate::net::transport::Transport;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Tessera runtime holding every node of the process.
pub struct Runtime {
    /// Configuration of the node the runtime was started for.
    config: Arc<Config>,

    /// Ownership oracle shared by all nodes.
    oracle: Arc<HashRingOracle>,

    /// Transport between the nodes.
    cluster: Arc<LocalCluster>,

    /// Nodes in member order.
    nodes: Vec<CacheNode>,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a runtime with one node per configured member.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let members: Vec<NodeId> = if config.node.members.is_empty() {
            vec![NodeId::new(config.node.node_id.clone())]
        } else {
            config.node.members.iter().cloned().map(NodeId::new).collect()
        };

        let oracle = Arc::new(HashRingOracle::for_mode(
            config.clustering.cache_mode,
            members.clone(),
            config.clustering.num_owners,
            config.clustering.hash_seed,
        ));
        let cluster = Arc::new(LocalCluster::new());

        let nodes = members
            .iter()
            .map(|member| {
                let mut node_config = config.clone();
                node_config.node.node_id = member.as_str().to_string();
                let node = CacheNode::new(
                    Arc::new(node_config),
                    oracle.clone() as Arc<dyn OwnershipOracle>,
                    cluster.clone() as Arc<dyn Transport>,
                );
                cluster.register(member.clone(), &node.handler());
                node
            })
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            oracle,
            cluster,
            nodes,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<HashRingOracle> {
        &self.oracle
    }

    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    pub fn nodes(&self) -> &[CacheNode] {
        &self.nodes
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&CacheNode> {
        self.nodes.iter().find(|node| node.id().as_str() == id)
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start every node.
    pub fn start(&self) {
        tracing::info!(
            node = %self.config.node.node_id,
            mode = %self.config.clustering.cache_mode,
            members = self.nodes.len(),
            topology = self.oracle.current_topology_id(),
            "starting Tessera runtime"
        );

        for node in &self.nodes {
            node.start();
        }

        self.running.store(true, Ordering::Release);
        tracing::info!("Tessera runtime started");
    }

    /// Stop every node, last member first.
    pub fn stop(&self) {
        for node in self.nodes.iter().rev() {
            node.stop();
            self.cluster.unregister(node.id());
        }
        self.running.store(false, Ordering::Release);
        tracing::info!("Tessera runtime stopped");
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until SIGINT or a shutdown request.
    pub async fn run(&self) -> Result<()> {
        self.start();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for SIGINT")?;
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = self.wait_for_shutdown() => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop();
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.nodes)
            .field("topology", &self.oracle.current_topology_id())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheMode;
    use crate::core::lifecycle::ComponentStatus;

    #[tokio::test]
    async fn test_runtime_builds_and_stops_every_member() {
        let config = Config::for_node("a", &["a", "b", "c"], CacheMode::DistSync);
        let runtime = Runtime::new(config).unwrap();
        assert_eq!(runtime.nodes().len(), 3);

        runtime.start();
        assert!(runtime.is_running());
        assert!(runtime
            .nodes()
            .iter()
            .all(|node| node.status() == ComponentStatus::Running));

        runtime.node("b").unwrap().put("k", "v").await.unwrap();
        assert_eq!(
            runtime.node("c").unwrap().get("k").await.unwrap().as_deref(),
            Some(&b"v"[..])
        );

        runtime.stop();
        assert!(runtime.node("a").unwrap().status() == ComponentStatus::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_signal_releases_waiters() {
        let runtime = Runtime::new(Config::for_node("a", &[], CacheMode::Local)).unwrap();
        runtime.shutdown();
        runtime.wait_for_shutdown().await;
        assert!(*runtime.shutdown_receiver().borrow());
    }
}
