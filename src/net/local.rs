//! In-process cluster transport.
//!
//! [`LocalCluster`] connects nodes living in the same process. Nodes are
//! held weakly so the transport never keeps a stopped node alive. A node can
//! be marked down to simulate an unreachable peer. A load hook runs before
//! every remote load is served and an invoke hook before every command is
//! delivered, which lets tests change the topology while an invocation is
//! suspended on that call.

use crate::commands::{Command, CommandResult};
use crate::control::topology::{NodeId, TopologyId};
use crate::core::error::{CacheError, CacheResult};
use crate::net::transport::{InboundHandler, Transport, TransportFuture};
use crate::storage::VersionedValue;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback run before a remote load is served: `(target, key)`.
pub type LoadHook = Arc<dyn Fn(&NodeId, &[u8]) + Send + Sync>;

/// Callback run before a command is delivered: `(target, command)`.
pub type InvokeHook = Arc<dyn Fn(&NodeId, &Command) + Send + Sync>;

/// Message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Commands delivered to a peer.
    pub invocations: u64,
    /// Remote loads served.
    pub remote_loads: u64,
    /// Calls rejected because the target was down or unknown.
    pub failures: u64,
}

/// Transport between nodes of one process.
#[derive(Default)]
pub struct LocalCluster {
    nodes: RwLock<HashMap<NodeId, Weak<dyn InboundHandler>>>,
    down: RwLock<HashSet<NodeId>>,
    load_hook: RwLock<Option<LoadHook>>,
    invoke_hook: RwLock<Option<InvokeHook>>,
    invocations: AtomicU64,
    remote_loads: AtomicU64,
    failures: AtomicU64,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's inbound handler.
    pub fn register(&self, node: NodeId, handler: &Arc<dyn InboundHandler>) {
        tracing::debug!(node = %node, "node registered with local cluster");
        self.nodes.write().insert(node, Arc::downgrade(handler));
    }

    pub fn unregister(&self, node: &NodeId) {
        self.nodes.write().remove(node);
    }

    /// Make `node` unreachable.
    pub fn set_down(&self, node: &NodeId) {
        self.down.write().insert(node.clone());
    }

    /// Make `node` reachable again.
    pub fn set_up(&self, node: &NodeId) {
        self.down.write().remove(node);
    }

    pub fn set_load_hook(&self, hook: impl Fn(&NodeId, &[u8]) + Send + Sync + 'static) {
        *self.load_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_load_hook(&self) {
        *self.load_hook.write() = None;
    }

    pub fn set_invoke_hook(&self, hook: impl Fn(&NodeId, &Command) + Send + Sync + 'static) {
        *self.invoke_hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_invoke_hook(&self) {
        *self.invoke_hook.write() = None;
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            remote_loads: self.remote_loads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn handler(&self, target: &NodeId) -> CacheResult<Arc<dyn InboundHandler>> {
        let reachable = if self.down.read().contains(target) {
            None
        } else {
            self.nodes.read().get(target).and_then(Weak::upgrade)
        };

        reachable.ok_or_else(|| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            CacheError::transport(target.as_str(), "node unreachable")
        })
    }
}

impl Transport for LocalCluster {
    fn invoke<'a>(
        &'a self,
        from: &'a NodeId,
        target: &'a NodeId,
        command: Command,
    ) -> TransportFuture<'a, CommandResult> {
        Box::pin(async move {
            let hook = self.invoke_hook.read().clone();
            if let Some(hook) = hook {
                hook(target, &command);
            }
            let handler = self.handler(target)?;
            self.invocations.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from = %from, target = %target, command = %command.tag(), "delivering command");
            handler.handle_command(from.clone(), command).await
        })
    }

    fn load<'a>(
        &'a self,
        from: &'a NodeId,
        target: &'a NodeId,
        key: &'a [u8],
        topology_id: TopologyId,
    ) -> TransportFuture<'a, Option<VersionedValue>> {
        Box::pin(async move {
            let handler = self.handler(target)?;
            let hook = self.load_hook.read().clone();
            if let Some(hook) = hook {
                hook(target, key);
            }
            // Let the reply arrive after other tasks had a chance to run.
            tokio::task::yield_now().await;

            self.remote_loads.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from = %from, target = %target, topology_id, "serving remote load");
            handler.handle_load(key, topology_id)
        })
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<_> = self.nodes.read().keys().cloned().collect();
        nodes.sort();
        f.debug_struct("LocalCluster")
            .field("nodes", &nodes)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Value;
    use std::sync::atomic::AtomicUsize;

    struct Echo {
        calls: AtomicUsize,
    }

    impl InboundHandler for Echo {
        fn handle_command<'a>(
            &'a self,
            _from: NodeId,
            _command: Command,
        ) -> TransportFuture<'a, CommandResult> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(CommandResult::Done)
            })
        }

        fn handle_load(
            &self,
            _key: &[u8],
            topology_id: TopologyId,
        ) -> CacheResult<Option<VersionedValue>> {
            Ok(Some(VersionedValue {
                value: Value::from_static(b"v"),
                version: topology_id,
            }))
        }
    }

    fn echo() -> Arc<dyn InboundHandler> {
        Arc::new(Echo {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_delivers_to_registered_node() {
        let cluster = LocalCluster::new();
        let handler = echo();
        cluster.register(NodeId::from("b"), &handler);

        let result = cluster
            .invoke(&NodeId::from("a"), &NodeId::from("b"), Command::clear())
            .await
            .unwrap();
        assert_eq!(result, CommandResult::Done);

        let loaded = cluster
            .load(&NodeId::from("a"), &NodeId::from("b"), b"k", 3)
            .await
            .unwrap();
        assert_eq!(loaded.unwrap().version, 3);
        assert_eq!(cluster.stats().invocations, 1);
        assert_eq!(cluster.stats().remote_loads, 1);
    }

    #[tokio::test]
    async fn test_down_and_dropped_nodes_are_unreachable() {
        let cluster = LocalCluster::new();
        let handler = echo();
        cluster.register(NodeId::from("b"), &handler);

        cluster.set_down(&NodeId::from("b"));
        let err = cluster
            .invoke(&NodeId::from("a"), &NodeId::from("b"), Command::clear())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Transport { .. }));

        cluster.set_up(&NodeId::from("b"));
        drop(handler);
        assert!(cluster
            .load(&NodeId::from("a"), &NodeId::from("b"), b"k", 1)
            .await
            .is_err());
        assert_eq!(cluster.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_load_hook_runs_before_serving() {
        let cluster = LocalCluster::new();
        let handler = echo();
        cluster.register(NodeId::from("b"), &handler);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        cluster.set_load_hook(move |target, key| {
            assert_eq!(target.as_str(), "b");
            assert_eq!(key, b"k");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cluster
            .load(&NodeId::from("a"), &NodeId::from("b"), b"k", 1)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invoke_hook_runs_before_delivery() {
        let cluster = Arc::new(LocalCluster::new());
        let handler = echo();
        cluster.register(NodeId::from("b"), &handler);

        // The hook may take the target down before the command reaches it.
        let hooked = cluster.clone();
        cluster.set_invoke_hook(move |target, command| {
            assert_eq!(command.tag(), crate::commands::CommandTag::Clear);
            hooked.set_down(target);
        });

        let err = cluster
            .invoke(&NodeId::from("a"), &NodeId::from("b"), Command::clear())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Transport { .. }));
        assert_eq!(cluster.stats().invocations, 0);

        cluster.clear_invoke_hook();
        cluster.set_up(&NodeId::from("b"));
        assert!(cluster
            .invoke(&NodeId::from("a"), &NodeId::from("b"), Command::clear())
            .await
            .is_ok());
    }
}
