//! Optimistic transactions.
//!
//! Commands executed in a [`Transaction`] run through the transactional
//! chain of the originating node: values are loaded once per key and every
//! effect stays in the transaction's entries. Nothing is visible to other
//! invocations before [`Transaction::commit`].
//!
//! Commit is a two-phase protocol driven from the originator:
//!
//! 1. PREPARE goes to the primary owner of each written key, one primary at
//!    a time in node order. Primaries lock their keys and verify that no
//!    value the transaction read has changed since (write skew).
//! 2. COMMIT goes to every owner of each written key. Plain writes store the
//!    value computed at the originator; delta writes are recomputed by each
//!    owner from its own value.
//!
//! A failed prepare rolls back every primary and a prepare that fails with
//! `TopologyStale` is restarted against the new topology. After every
//! primary prepared the transaction is committed: a topology change during
//! COMMIT makes the originator resend it to the owners still missing it, and
//! owners apply a given transaction once.

use crate::cache::CacheNode;
use crate::commands::{Command, CommandKind, CommandResult, Flag, Key, TxId, TxWrite, Value};
use crate::control::ownership::OwnerSet;
use crate::control::topology::{NodeId, TopologyId};
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::context::{ContextEntry, Origin};
use crate::invocation::invoker::InvocationReport;
use crate::net::transport::call_with_timeout;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A transaction originated on one node.
pub struct Transaction {
    node: CacheNode,
    id: TxId,
    entries: HashMap<Key, ContextEntry>,
    writes: BTreeMap<Key, TxWrite>,
}

/// Writes grouped by the node they must reach.
type Plan = BTreeMap<NodeId, Vec<TxWrite>>;

impl Transaction {
    pub(crate) fn new(node: CacheNode, id: TxId) -> Self {
        Self {
            node,
            id,
            entries: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// Writes recorded so far, in key order.
    pub fn writes(&self) -> impl Iterator<Item = &TxWrite> {
        self.writes.values()
    }

    /// Value of `key` as this transaction sees it, without loading.
    pub fn pending_value(&self, key: &[u8]) -> Option<Value> {
        self.entries.get(key).and_then(|entry| entry.value.clone())
    }

    pub async fn get(&mut self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        match self.execute(Command::get(key)).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<Option<Value>> {
        match self.execute(Command::put(key, value)).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn remove(&mut self, key: impl Into<Key>) -> CacheResult<Option<Value>> {
        match self.execute(Command::remove(key)).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn put_if_absent(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> CacheResult<bool> {
        Ok(self.execute(Command::put_if_absent(key, value)).await?.is_successful())
    }

    pub async fn increment(&mut self, key: impl Into<Key>, delta: i64) -> CacheResult<i64> {
        match self.execute(Command::increment(key, delta)).await? {
            CommandResult::Counter(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn execute(&mut self, command: Command) -> CacheResult<CommandResult> {
        self.execute_traced(command).await.result
    }

    /// Execute a single-key command inside the transaction.
    pub async fn execute_traced(&mut self, command: Command) -> InvocationReport {
        if command.key().is_none() || matches!(command.kind(), CommandKind::ApplyValue { .. }) {
            return InvocationReport {
                result: Err(CacheError::unsupported(format!(
                    "{} inside a transaction",
                    command.tag()
                ))),
                attempts: 0,
                topologies: Vec::new(),
            };
        }

        let invoker = self.node.invoker();
        let entries = &self.entries;
        let (report, mut ctx) = invoker
            .run(&command, || {
                let mut ctx = invoker.new_context(Origin::Local, true);
                ctx.restore_entries(entries.clone());
                ctx
            })
            .await;

        if report.result.is_ok() {
            self.entries = ctx.take_entries();
            if command.is_write() {
                self.record_write(command);
            }
        }
        report
    }

    fn record_write(&mut self, command: Command) {
        let Some(key) = command.key().cloned() else {
            return;
        };
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        if !entry.changed {
            return;
        }

        let final_value = entry.value.clone();
        let observed = entry.observed();
        let write = match self.writes.remove(&key) {
            // A key written twice ships its final value as a plain write.
            Some(earlier) => TxWrite {
                command: match &final_value {
                    Some(value) => Command::put(key.clone(), value.clone()),
                    None => Command::remove(key.clone()),
                },
                observed: earlier.observed.or(observed),
                final_value,
            },
            None => TxWrite {
                command,
                observed,
                final_value,
            },
        };
        self.writes.insert(key, write);
    }

    /// Run the two-phase commit.
    ///
    /// PREPARE is restarted from scratch when the topology changes. Once
    /// every primary prepared, the outcome is decided: a topology change
    /// only makes the originator resend COMMIT, under the new topology, to
    /// the owners that have not applied it yet.
    pub async fn commit(self) -> CacheResult<()> {
        if self.writes.is_empty() {
            tracing::debug!(tx = %self.id, "read-only transaction committed");
            return Ok(());
        }

        let writes: Vec<TxWrite> = self.writes.values().cloned().collect();
        let max_restarts = self.node.components().config.invocation.max_topology_retries;
        let mut attempt = 0u32;
        let (topology_id, prepared) = loop {
            attempt += 1;
            match self.prepare_all(&writes).await {
                Ok(prepared) => break prepared,
                Err(err) if err.is_topology_stale() && attempt <= max_restarts => {
                    tracing::warn!(tx = %self.id, attempt, error = %err, "topology changed; restarting prepare");
                }
                Err(err) => {
                    tracing::debug!(tx = %self.id, attempt, error = %err, "transaction commit failed");
                    return Err(err);
                }
            }
        };

        let topology_id = self.commit_all(&writes, topology_id, &prepared).await?;
        if self.node.components().cache_mode().is_invalidation() {
            self.invalidate_peers(&writes, topology_id).await?;
        }
        tracing::debug!(tx = %self.id, attempt, writes = writes.len(), "transaction committed");
        Ok(())
    }

    /// Discard the transaction. Nothing is locked before commit, so there is
    /// nothing to release remotely.
    pub fn rollback(self) {
        tracing::debug!(tx = %self.id, writes = self.writes.len(), "transaction rolled back");
    }

    /// Prepare every primary under the current topology. On failure the
    /// primaries are rolled back.
    async fn prepare_all(&self, writes: &[TxWrite]) -> CacheResult<(TopologyId, BTreeSet<NodeId>)> {
        let topology_id = self.node.components().oracle.current_topology_id();
        let primaries = self.plan(writes, topology_id)?.0;
        let prepared: BTreeSet<NodeId> = primaries.keys().cloned().collect();

        for (primary, owned) in &primaries {
            let prepare = Command::new(CommandKind::Prepare {
                tx_id: self.id.clone(),
                writes: owned.clone(),
            })
            .stamped(topology_id);
            if let Err(err) = self.send(primary, prepare).await {
                tracing::debug!(tx = %self.id, primary = %primary, error = %err, "prepare failed");
                self.release_on(prepared.iter()).await;
                return Err(err);
            }
        }
        Ok((topology_id, prepared))
    }

    /// Deliver COMMIT to every owner, resending to the owners still missing
    /// it when the topology changes. Returns the topology it completed under.
    async fn commit_all(
        &self,
        writes: &[TxWrite],
        mut topology_id: TopologyId,
        prepared: &BTreeSet<NodeId>,
    ) -> CacheResult<TopologyId> {
        let components = self.node.components();
        let max_restarts = components.config.invocation.max_topology_retries;
        let mut applied = BTreeSet::new();
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;
            let owners = match self.plan(writes, topology_id) {
                Ok((_, owners)) => owners,
                Err(err) => break Err(err),
            };

            let mut failure = None;
            for (owner, owned) in &owners {
                if applied.contains(owner) {
                    continue;
                }
                let commit = Command::new(CommandKind::Commit {
                    tx_id: self.id.clone(),
                    writes: owned.clone(),
                })
                .stamped(topology_id);
                match self.send(owner, commit).await {
                    Ok(_) => {
                        applied.insert(owner.clone());
                    }
                    Err(err) => {
                        tracing::warn!(tx = %self.id, owner = %owner, error = %err, "commit failed on owner");
                        failure.get_or_insert(err);
                    }
                }
            }

            match failure {
                None => break Ok(topology_id),
                Some(err) if err.is_topology_stale() && attempt <= max_restarts => {
                    topology_id = components.oracle.current_topology_id();
                    tracing::warn!(
                        tx = %self.id,
                        attempt,
                        topology = topology_id,
                        applied = applied.len(),
                        "topology changed during commit; resending to remaining owners"
                    );
                }
                Some(err) => break Err(err),
            }
        };

        // Primaries that prepared but never saw COMMIT still park locks.
        self.release_on(prepared.difference(&applied)).await;
        outcome
    }

    /// Group writes by primary owner and by owner.
    fn plan(&self, writes: &[TxWrite], topology_id: TopologyId) -> CacheResult<(Plan, Plan)> {
        let components = self.node.components();
        let mut primaries = Plan::new();
        let mut owners = Plan::new();
        for write in writes {
            let Some(key) = write.key() else {
                return Err(CacheError::invalid("transaction write without a key"));
            };
            let set = OwnerSet::resolve(
                components.cache_mode(),
                &*components.oracle,
                &components.local,
                key,
                topology_id,
            )?;
            let primary = set.primary().cloned().ok_or_else(|| {
                CacheError::internal(format!("no owner for key {}", display_key(key)))
            })?;
            primaries.entry(primary).or_default().push(write.clone());
            for owner in set.owners {
                owners.entry(owner).or_default().push(write.clone());
            }
        }
        Ok((primaries, owners))
    }

    /// Release parked locks. ROLLBACK is stamped with the topology current
    /// at sending time so a primary accepts it after a topology change.
    async fn release_on<'a>(&self, primaries: impl Iterator<Item = &'a NodeId>) {
        let oracle = &self.node.components().oracle;
        for primary in primaries {
            let rollback = Command::new(CommandKind::Rollback {
                tx_id: self.id.clone(),
            })
            .stamped(oracle.current_topology_id());
            if let Err(err) = self.send(primary, rollback).await {
                tracing::warn!(tx = %self.id, primary = %primary, error = %err, "rollback failed");
            }
        }
    }

    async fn invalidate_peers(&self, writes: &[TxWrite], topology_id: TopologyId) -> CacheResult<()> {
        let components = self.node.components();
        let keys: Vec<Key> = writes.iter().filter_map(|w| w.key().cloned()).collect();
        let invalidate = Command::invalidate(keys)
            .flag(Flag::CacheModeLocal)
            .stamped(topology_id);
        for peer in components.oracle.members(topology_id)? {
            if peer != components.local {
                self.send(&peer, invalidate.clone()).await?;
            }
        }
        Ok(())
    }

    /// Deliver a command to `target`, running it in place when the target is
    /// this node. A transport failure becomes `TopologyStale` when the
    /// topology moved away from the one the command was stamped with.
    async fn send(&self, target: &NodeId, command: Command) -> CacheResult<CommandResult> {
        let components = self.node.components();
        if *target == components.local {
            return self
                .node
                .invoker()
                .invoke_remote(components.local.clone(), &command)
                .await;
        }
        let stamped = command.topology_id();
        let outcome = call_with_timeout(
            components.remote_timeout(),
            target,
            components.transport.invoke(&components.local, target, command),
        )
        .await;
        outcome.map_err(|err| match err {
            CacheError::Transport { .. } => {
                let current = components.oracle.current_topology_id();
                if current != stamped {
                    CacheError::topology_stale(current, stamped)
                } else {
                    err
                }
            }
            err => err,
        })
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

fn unexpected(result: &CommandResult) -> CacheError {
    CacheError::internal(format!("unexpected transactional result {:?}", result))
}
