//! Cache node.
//!
//! A [`CacheNode`] is one member's view of the cache: the public key-value
//! API, the inbound side of the transport, lifecycle control and the entry
//! point of transactions. Every operation builds a [`Command`] and hands it
//! to the node's [`Invoker`].

pub mod transaction;

pub use transaction::Transaction;

use crate::commands::{Command, CommandResult, Key, TxId, Value};
use crate::control::topology::{NodeId, OwnershipOracle, TopologyId};
use crate::core::config::Config;
use crate::core::error::{CacheError, CacheResult};
use crate::core::lifecycle::{ComponentStatus, LifecycleHooks, LifecyclePhase};
use crate::invocation::cancel::CancelHandle;
use crate::invocation::components::NodeComponents;
use crate::invocation::invoker::{InvocationReport, Invoker};
use crate::net::transport::{InboundHandler, Transport, TransportFuture};
use crate::storage::{DataContainer, VersionedValue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One member of the cache.
#[derive(Clone)]
pub struct CacheNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    invoker: Invoker,
    hooks: Mutex<LifecycleHooks>,
    tx_seq: AtomicU64,
}

impl CacheNode {
    pub fn new(
        config: Arc<Config>,
        oracle: Arc<dyn OwnershipOracle>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let components = Arc::new(NodeComponents::new(config, oracle, transport));
        Self {
            inner: Arc::new(NodeInner {
                invoker: Invoker::new(components),
                hooks: Mutex::new(LifecycleHooks::new()),
                tx_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.components().local
    }

    pub fn status(&self) -> ComponentStatus {
        self.components().status.get()
    }

    pub fn components(&self) -> &Arc<NodeComponents> {
        self.inner.invoker.components()
    }

    pub fn invoker(&self) -> &Invoker {
        &self.inner.invoker
    }

    pub fn container(&self) -> &DataContainer {
        &self.components().container
    }

    /// Register a hook fired at a lifecycle boundary.
    pub fn on_lifecycle(
        &self,
        phase: LifecyclePhase,
        name: impl Into<String>,
        hook: impl Fn() + Send + Sync + 'static,
    ) {
        self.inner.hooks.lock().on(phase, name, hook);
    }

    /// The handler peers reach this node through.
    pub fn handler(&self) -> Arc<dyn InboundHandler> {
        self.inner.clone()
    }

    /// Start accepting invocations.
    pub fn start(&self) {
        let status = &self.components().status;
        status.set(ComponentStatus::Initializing);
        self.inner.hooks.lock().fire(LifecyclePhase::InitComplete);
        status.set(ComponentStatus::Running);
        tracing::info!(
            node = %self.id(),
            mode = %self.components().cache_mode(),
            "cache node running"
        );
    }

    /// Stop accepting invocations. In-flight remote work is still served
    /// while stopping.
    pub fn stop(&self) {
        let status = &self.components().status;
        status.set(ComponentStatus::Stopping);
        self.inner.hooks.lock().fire(LifecyclePhase::ShutdownBegin);
        status.set(ComponentStatus::Terminated);
        tracing::info!(node = %self.id(), "cache node terminated");
    }

    // Key-value API

    pub async fn get(&self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        into_value(self.execute(Command::get(key)).await?)
    }

    /// Store `value`, returning the previous value.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<Option<Value>> {
        into_value(self.execute(Command::put(key, value)).await?)
    }

    /// Remove the key, returning the previous value.
    pub async fn remove(&self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        into_value(self.execute(Command::remove(key)).await?)
    }

    pub async fn put_if_absent(&self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<bool> {
        Ok(self.execute(Command::put_if_absent(key, value)).await?.is_successful())
    }

    pub async fn replace(&self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<bool> {
        Ok(self.execute(Command::replace(key, value)).await?.is_successful())
    }

    pub async fn replace_if_equals(
        &self,
        key: impl Into<Key>,
        expected: impl Into<Value>,
        value: impl Into<Value>,
    ) -> CacheResult<bool> {
        let command = Command::replace_if_equals(key, expected, value);
        Ok(self.execute(command).await?.is_successful())
    }

    pub async fn remove_if_equals(&self, key: impl Into<Key>, expected: impl Into<Value>) -> CacheResult<bool> {
        let command = Command::remove_if_equals(key, expected);
        Ok(self.execute(command).await?.is_successful())
    }

    /// Add `delta` to the counter stored at the key; an absent key counts as 0.
    pub async fn increment(&self, key: impl Into<Key>, delta: i64) -> CacheResult<i64> {
        match self.execute(Command::increment(key, delta)).await? {
            CommandResult::Counter(value) => Ok(value),
            other => Err(unexpected("increment", &other)),
        }
    }

    /// Append `suffix` to the stored value, returning the new value.
    pub async fn append(&self, key: impl Into<Key>, suffix: impl Into<Value>) -> CacheResult<Value> {
        into_value(self.execute(Command::append(key, suffix)).await?)?
            .ok_or_else(|| CacheError::internal("append produced no value"))
    }

    pub async fn invalidate(&self, keys: Vec<Key>) -> CacheResult<()> {
        self.execute(Command::invalidate(keys)).await.map(|_| ())
    }

    pub async fn clear(&self) -> CacheResult<()> {
        self.execute(Command::clear()).await.map(|_| ())
    }

    /// Number of entries held by this node.
    pub async fn size(&self) -> CacheResult<usize> {
        match self.execute(Command::size()).await? {
            CommandResult::Size(size) => Ok(size),
            other => Err(unexpected("size", &other)),
        }
    }

    pub async fn execute(&self, command: Command) -> CacheResult<CommandResult> {
        self.inner.invoker.invoke(&command).await
    }

    /// Execute and report the attempts it took.
    pub async fn execute_traced(&self, command: Command) -> InvocationReport {
        self.inner.invoker.invoke_traced(&command).await
    }

    pub async fn execute_cancellable(&self, command: Command, cancel: CancelHandle) -> CacheResult<CommandResult> {
        self.inner
            .invoker
            .invoke_cancellable(&command, cancel)
            .await
            .result
    }

    /// Begin a transaction originated on this node.
    pub fn begin(&self) -> CacheResult<Transaction> {
        if !self.components().config.transaction.enabled {
            return Err(CacheError::unsupported("transactions are disabled"));
        }
        let seq = self.inner.tx_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let tx_id = TxId {
            origin: self.id().clone(),
            seq,
        };
        tracing::debug!(tx = %tx_id, "transaction started");
        Ok(Transaction::new(self.clone(), tx_id))
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("id", self.id())
            .field("status", &self.status())
            .field("entries", &self.container().len())
            .finish()
    }
}

impl InboundHandler for NodeInner {
    fn handle_command<'a>(&'a self, from: NodeId, command: Command) -> TransportFuture<'a, CommandResult> {
        Box::pin(async move { self.invoker.invoke_remote(from, &command).await })
    }

    fn handle_load(&self, key: &[u8], topology_id: TopologyId) -> CacheResult<Option<VersionedValue>> {
        let components = self.invoker.components();
        let status = components.status.get();
        if !matches!(status, ComponentStatus::Running | ComponentStatus::Stopping) {
            return Err(CacheError::NotRunning { status });
        }
        if components.cache_mode().uses_oracle() {
            let current = components.oracle.current_topology_id();
            if current != topology_id {
                return Err(CacheError::topology_stale(current, topology_id));
            }
        }
        Ok(components.container.serve_remote(key))
    }
}

fn into_value(result: CommandResult) -> CacheResult<Option<Value>> {
    match result {
        CommandResult::Value(value) => Ok(value),
        CommandResult::Conditional { previous, .. } => Ok(previous),
        CommandResult::Skipped => Ok(None),
        other => Err(unexpected("value", &other)),
    }
}

fn unexpected(expected: &str, result: &CommandResult) -> CacheError {
    CacheError::internal(format!("expected {} result, got {:?}", expected, result))
}
