//! Per-attempt invocation state.
//!
//! An [`InvocationContext`] lives for exactly one attempt of one invocation.
//! It records where the invocation came from, the topology id captured at
//! entry, the owner sets computed under that topology, the entries loaded
//! and changed by the command, and the key locks held on its behalf.
//!
//! Restarting after a topology change always builds a new context; nothing
//! in a stale context is ever reused.

use crate::commands::{Key, ObservedVersion, Value};
use crate::control::ownership::{OwnerSet, OwnershipRole};
use crate::control::topology::{NodeId, OwnershipOracle, TopologyId};
use crate::core::config::CacheMode;
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::cancel::CancelHandle;
use crate::invocation::locks::KeyLockGuard;
use crate::storage::{DataContainer, VersionedValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Where an invocation entered this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Submitted through this node's API.
    Local,
    /// Sent by another node (forwarded, replicated or transaction control).
    Remote(NodeId),
}

/// A key's state inside one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextEntry {
    /// The load step ran for this key.
    pub loaded: bool,
    /// Previous value as loaded, with its version.
    pub previous: Option<VersionedValue>,
    /// Current value as seen by the command.
    pub value: Option<Value>,
    /// The command changed the value.
    pub changed: bool,
}

impl ContextEntry {
    /// Version observed by the load step, if it ran.
    pub fn observed(&self) -> Option<ObservedVersion> {
        if !self.loaded {
            return None;
        }
        Some(match &self.previous {
            Some(previous) => ObservedVersion::At(previous.version),
            None => ObservedVersion::Absent,
        })
    }
}

/// A write committed to the local container during this attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedWrite {
    pub key: Key,
    pub value: Option<Value>,
    pub version: u64,
}

/// State of one invocation attempt.
pub struct InvocationContext {
    node: NodeId,
    origin: Origin,
    transactional: bool,
    cache_mode: CacheMode,
    container: Arc<DataContainer>,
    topology_id: Option<TopologyId>,
    owners: HashMap<Key, OwnerSet>,
    entries: HashMap<Key, ContextEntry>,
    locks: Vec<KeyLockGuard>,
    committed: Vec<CommittedWrite>,
    cancel: CancelHandle,
    performed: bool,
}

impl InvocationContext {
    pub fn new(
        node: NodeId,
        origin: Origin,
        container: Arc<DataContainer>,
        transactional: bool,
    ) -> Self {
        Self {
            node,
            origin,
            transactional,
            cache_mode: CacheMode::Local,
            container,
            topology_id: None,
            owners: HashMap::new(),
            entries: HashMap::new(),
            locks: Vec::new(),
            committed: Vec::new(),
            cancel: CancelHandle::none(),
            performed: false,
        }
    }

    /// A context for an invocation submitted on `node`.
    pub fn local(node: NodeId, container: Arc<DataContainer>, transactional: bool) -> Self {
        Self::new(node, Origin::Local, container, transactional)
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether the invocation was submitted on this node.
    pub fn is_originator(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn container(&self) -> &DataContainer {
        &self.container
    }

    // Topology

    /// Record the topology id of this attempt; later calls are ignored.
    pub fn capture_topology(&mut self, topology_id: TopologyId) {
        if self.topology_id.is_none() {
            self.topology_id = Some(topology_id);
        }
    }

    /// Topology id captured at entry (0 before capture).
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id.unwrap_or(0)
    }

    /// Fail with `TopologyStale` if the oracle moved past the captured id.
    pub fn check_topology(&self, oracle: &dyn OwnershipOracle) -> CacheResult<()> {
        let Some(captured) = self.topology_id else {
            return Ok(());
        };
        let current = oracle.current_topology_id();
        if current != captured {
            tracing::debug!(
                node = %self.node,
                captured,
                current,
                "topology changed during invocation"
            );
            return Err(CacheError::topology_stale(current, captured));
        }
        Ok(())
    }

    pub fn cache_owners(&mut self, key: Key, owners: OwnerSet) {
        self.owners.insert(key, owners);
    }

    pub fn owners(&self, key: &[u8]) -> Option<&OwnerSet> {
        self.owners.get(key)
    }

    /// This node's role for `key` under the captured topology.
    pub fn role_of(&self, key: &[u8]) -> OwnershipRole {
        if !self.cache_mode.uses_oracle() {
            return OwnershipRole::Primary;
        }
        self.owners
            .get(key)
            .map(|owners| owners.role_of(&self.node))
            .unwrap_or(OwnershipRole::NotOwner)
    }

    /// Primary owner of `key`.
    pub fn primary_of(&self, key: &[u8]) -> CacheResult<NodeId> {
        self.owners
            .get(key)
            .and_then(|owners| owners.primary())
            .cloned()
            .ok_or_else(|| {
                CacheError::internal(format!("no owners resolved for key {}", display_key(key)))
            })
    }

    // Entries

    /// Store the result of the load step for `key`.
    pub fn record_load(&mut self, key: Key, loaded: Option<VersionedValue>) {
        let entry = self.entries.entry(key).or_default();
        entry.loaded = true;
        if !entry.changed {
            entry.value = loaded.as_ref().map(|v| v.value.clone());
        }
        entry.previous = loaded;
    }

    pub fn has_entry(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &[u8]) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    /// Value of `key` as the command sees it; absent if never loaded or set.
    pub fn current(&self, key: &[u8]) -> Option<Value> {
        self.entries.get(key).and_then(|entry| entry.value.clone())
    }

    /// Change the value of `key`; `None` removes it.
    pub fn set(&mut self, key: Key, value: Option<Value>) {
        let entry = self.entries.entry(key).or_default();
        entry.value = value;
        entry.changed = true;
    }

    /// Entries the command changed, in key order.
    pub fn changed_entries(&self) -> Vec<(Key, Option<Value>)> {
        let mut changed: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.changed)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    pub fn take_entries(&mut self) -> HashMap<Key, ContextEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Seed the context with entries carried over from earlier commands of
    /// the same transaction.
    pub fn restore_entries(&mut self, entries: HashMap<Key, ContextEntry>) {
        self.entries = entries;
    }

    pub fn record_commit(&mut self, key: Key, value: Option<Value>, version: u64) {
        self.committed.push(CommittedWrite {
            key,
            value,
            version,
        });
    }

    /// Writes committed locally during this attempt.
    pub fn committed(&self) -> &[CommittedWrite] {
        &self.committed
    }

    // Locks

    pub fn hold(&mut self, guard: KeyLockGuard) {
        self.locks.push(guard);
    }

    pub fn holds_lock(&self, key: &[u8]) -> bool {
        self.locks.iter().any(|guard| &guard.key()[..] == key)
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        self.locks.iter().map(|guard| guard.key().clone()).collect()
    }

    // Suspension and completion

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    /// Await `fut` at a suspension point, failing with `Cancelled` if the
    /// invocation is abandoned first.
    pub fn suspend<T, F>(&self, fut: F) -> impl Future<Output = CacheResult<T>>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let cancel = self.cancel.clone();
        async move { cancel.run(fut).await }
    }

    /// Note that the terminal stage is about to perform the command.
    pub fn mark_performed(&mut self) -> CacheResult<()> {
        if self.performed {
            return Err(CacheError::internal("command performed twice in one attempt"));
        }
        self.performed = true;
        Ok(())
    }

    pub fn was_performed(&self) -> bool {
        self.performed
    }

    /// Drop loaded entries and release every lock held by this attempt.
    pub fn discard(&mut self) {
        self.entries.clear();
        self.committed.clear();
        self.locks.clear();
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("node", &self.node)
            .field("origin", &self.origin)
            .field("transactional", &self.transactional)
            .field("topology_id", &self.topology_id)
            .field("entries", &self.entries.len())
            .field("locks", &self.locks.len())
            .field("performed", &self.performed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::topology::HashRingOracle;
    use crate::invocation::locks::LockManager;
    use std::time::Duration;

    fn ctx() -> InvocationContext {
        InvocationContext::local(NodeId::from("a"), Arc::new(DataContainer::new()), false)
    }

    #[test]
    fn test_topology_captured_once() {
        let mut ctx = ctx();
        ctx.capture_topology(3);
        ctx.capture_topology(5);
        assert_eq!(ctx.topology_id(), 3);
    }

    #[test]
    fn test_check_topology_detects_change() {
        let oracle = HashRingOracle::new(vec![NodeId::from("a")], 1, 0);
        let mut ctx = ctx();
        ctx.capture_topology(oracle.current_topology_id());
        assert!(ctx.check_topology(&oracle).is_ok());

        oracle.bump();
        let err = ctx.check_topology(&oracle).unwrap_err();
        assert_eq!(err, CacheError::topology_stale(2, 1));
    }

    #[test]
    fn test_perform_only_once() {
        let mut ctx = ctx();
        assert!(ctx.mark_performed().is_ok());
        assert!(ctx.mark_performed().is_err());
    }

    #[test]
    fn test_load_does_not_clobber_own_write() {
        let mut ctx = ctx();
        let key = Key::from_static(b"k");
        ctx.set(key.clone(), Some(Value::from_static(b"mine")));
        ctx.record_load(
            key.clone(),
            Some(VersionedValue {
                value: Value::from_static(b"stored"),
                version: 4,
            }),
        );

        assert_eq!(ctx.current(&key), Some(Value::from_static(b"mine")));
        assert_eq!(ctx.entry(&key).unwrap().observed(), Some(ObservedVersion::At(4)));
    }

    #[test]
    fn test_observed_absent_vs_not_loaded() {
        let mut ctx = ctx();
        ctx.record_load(Key::from_static(b"missing"), None);
        ctx.set(Key::from_static(b"blind"), Some(Value::from_static(b"v")));

        assert_eq!(
            ctx.entry(b"missing").unwrap().observed(),
            Some(ObservedVersion::Absent)
        );
        assert_eq!(ctx.entry(b"blind").unwrap().observed(), None);
    }

    #[test]
    fn test_local_modes_are_primary() {
        let ctx = ctx();
        assert_eq!(ctx.role_of(b"anything"), OwnershipRole::Primary);

        let dist = InvocationContext::local(NodeId::from("a"), Arc::new(DataContainer::new()), false)
            .with_cache_mode(CacheMode::DistSync);
        assert_eq!(dist.role_of(b"unresolved"), OwnershipRole::NotOwner);
    }

    #[tokio::test]
    async fn test_discard_releases_locks() {
        let locks = LockManager::new(4);
        let mut ctx = ctx();
        let key = Key::from_static(b"k");
        let guard = locks.acquire(&key, Duration::from_secs(1)).await.unwrap();
        ctx.hold(guard);
        ctx.set(key.clone(), Some(Value::from_static(b"v")));
        assert!(ctx.holds_lock(&key));

        ctx.discard();
        assert!(!locks.is_locked(&key));
        assert!(ctx.changed_entries().is_empty());
    }
}
