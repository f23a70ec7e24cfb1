//! Transactional stages.
//!
//! [`TxEntryStage`] is the load step of commands executed inside a
//! transaction on its originator: values are read once per key, possibly
//! from a remote owner, and effects stay in the transaction's entries until
//! commit.
//!
//! [`TxCoordinationStage`] runs the owner side of the two-phase commit:
//!
//! | Phase | Owner behaviour |
//! |-------|-----------------|
//! | PREPARE | lock the keys it is primary for (in key order), verify write skew, park the locks |
//! | COMMIT | load what delta writes need, apply once per transaction, release the parked locks |
//! | ROLLBACK | release the parked locks |

use crate::commands::{
    resolve, Command, CommandKind, CommandResult, CommandTag, DispatchTable, Key, LoadQuery,
    ObservedVersion, TxWrite,
};
use crate::control::ownership::OwnershipRole;
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::InvocationContext;
use crate::invocation::stages::load_value;
use std::sync::Arc;

const TX_KEYED: [CommandTag; 9] = [
    CommandTag::Get,
    CommandTag::Put,
    CommandTag::PutIfAbsent,
    CommandTag::Replace,
    CommandTag::ReplaceIfEquals,
    CommandTag::Remove,
    CommandTag::RemoveIfEquals,
    CommandTag::Increment,
    CommandTag::Append,
];

/// Load step for commands inside a transaction, on its originator.
pub struct TxEntryStage {
    components: Arc<NodeComponents>,
    keys: DispatchTable<InvocationContext, Vec<Key>>,
}

impl TxEntryStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self {
            components,
            keys: DispatchTable::new(unloaded_none).with_all(&TX_KEYED, unloaded_key),
        }
    }
}

fn unloaded_none(_: &Command, _: &mut InvocationContext) -> Vec<Key> {
    Vec::new()
}

/// The command's key, unless an earlier command of the transaction already
/// read or wrote it.
fn unloaded_key(command: &Command, ctx: &mut InvocationContext) -> Vec<Key> {
    command
        .key()
        .filter(|key| !ctx.has_entry(key))
        .cloned()
        .into_iter()
        .collect()
}

impl Stage for TxEntryStage {
    fn name(&self) -> &'static str {
        "tx-entry"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            for key in command.accept(ctx, &self.keys) {
                let query = LoadQuery {
                    load_type: command.load_type()?,
                    cache_mode: self.components.cache_mode(),
                    transactional: true,
                    role: ctx.role_of(&key),
                    originator: true,
                };
                let decision = resolve(&query);
                tracing::debug!(
                    node = %self.components.local,
                    key = %display_key(&key),
                    command = %command.tag(),
                    role = %query.role,
                    must_load = decision.must_load,
                    source = ?decision.source,
                    "transactional load decision"
                );
                if decision.must_load {
                    let loaded = load_value(&self.components, ctx, &key, decision.source).await?;
                    ctx.record_load(key, loaded);
                }
            }

            next.invoke(ctx, command).await
        })
    }
}

/// Owner side of PREPARE, COMMIT and ROLLBACK.
pub struct TxCoordinationStage {
    components: Arc<NodeComponents>,
    phases: DispatchTable<InvocationContext, Phase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare,
    Commit,
    Rollback,
    Other,
}

impl TxCoordinationStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self {
            components,
            phases: DispatchTable::new(other_phase)
                .with(CommandTag::Prepare, prepare_phase)
                .with(CommandTag::Commit, commit_phase)
                .with(CommandTag::Rollback, rollback_phase),
        }
    }

    fn query(&self, ctx: &InvocationContext, write: &TxWrite, key: &Key) -> CacheResult<LoadQuery> {
        Ok(LoadQuery {
            load_type: write.command.load_type()?,
            cache_mode: self.components.cache_mode(),
            transactional: true,
            role: ctx.role_of(key),
            originator: false,
        })
    }

    async fn prepare(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> CacheResult<CommandResult> {
        let CommandKind::Prepare { tx_id, writes } = command.kind() else {
            return Err(CacheError::internal("prepare phase without a prepare command"));
        };

        let mut ordered: Vec<(&Key, &TxWrite)> = writes
            .iter()
            .map(|write| {
                write
                    .key()
                    .map(|key| (key, write))
                    .ok_or_else(|| CacheError::invalid("transaction write without a key"))
            })
            .collect::<CacheResult<_>>()?;
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let timeout = self.components.lock_timeout();
        let mut guards = Vec::with_capacity(ordered.len());
        for (key, write) in ordered {
            if ctx.role_of(key) == OwnershipRole::Primary {
                let guard = ctx
                    .suspend(self.components.locks.acquire(key, timeout))
                    .await?;
                guards.push(guard);
                ctx.check_topology(&*self.components.oracle)?;
            }

            let decision = resolve(&self.query(ctx, write, key)?);
            if decision.verify_write_skew && self.components.config.write_skew_enabled() {
                self.verify_write_skew(key, write.observed)?;
            }
        }

        let result = next.invoke(ctx, command).await?;
        tracing::debug!(
            node = %self.components.local,
            tx = %tx_id,
            locks = guards.len(),
            "transaction prepared"
        );
        self.components.pending.stash(tx_id.clone(), guards);
        Ok(result)
    }

    fn verify_write_skew(&self, key: &Key, observed: Option<ObservedVersion>) -> CacheResult<()> {
        let Some(observed) = observed else {
            return Ok(());
        };
        let current = self.components.container.version_of(key);
        let unchanged = match observed {
            ObservedVersion::Absent => current.is_none(),
            ObservedVersion::At(version) => current == Some(version),
        };
        if unchanged {
            return Ok(());
        }

        tracing::warn!(
            node = %self.components.local,
            key = %display_key(key),
            ?observed,
            ?current,
            "write skew detected"
        );
        Err(CacheError::write_skew(key))
    }

    async fn commit(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> CacheResult<CommandResult> {
        let CommandKind::Commit { tx_id, writes } = command.kind() else {
            return Err(CacheError::internal("commit phase without a commit command"));
        };

        if self.components.pending.is_committed(tx_id) {
            self.components.pending.release(tx_id);
            tracing::debug!(node = %self.components.local, tx = %tx_id, "transaction already committed here");
            return Ok(CommandResult::Done);
        }

        for write in writes {
            let Some(key) = write.key() else {
                return Err(CacheError::invalid("transaction write without a key"));
            };
            let decision = resolve(&self.query(ctx, write, key)?);
            if decision.must_load {
                let loaded = self.components.container.load(key);
                ctx.record_load(key.clone(), loaded);
            }
        }

        let result = next.invoke(ctx, command).await;
        if result.is_ok() {
            self.components.pending.mark_committed(tx_id);
        }
        let released = self.components.pending.release(tx_id);
        tracing::debug!(
            node = %self.components.local,
            tx = %tx_id,
            released,
            ok = result.is_ok(),
            "transaction committed"
        );
        result
    }
}

fn other_phase(_: &Command, _: &mut InvocationContext) -> Phase {
    Phase::Other
}

fn prepare_phase(_: &Command, _: &mut InvocationContext) -> Phase {
    Phase::Prepare
}

fn commit_phase(_: &Command, _: &mut InvocationContext) -> Phase {
    Phase::Commit
}

fn rollback_phase(_: &Command, _: &mut InvocationContext) -> Phase {
    Phase::Rollback
}

impl Stage for TxCoordinationStage {
    fn name(&self) -> &'static str {
        "tx-coordination"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            match command.accept(ctx, &self.phases) {
                Phase::Prepare => self.prepare(ctx, command, next).await,
                Phase::Commit => self.commit(ctx, command, next).await,
                Phase::Rollback => {
                    if let CommandKind::Rollback { tx_id } = command.kind() {
                        let released = self.components.pending.release(tx_id);
                        tracing::debug!(node = %self.components.local, tx = %tx_id, released, "transaction rolled back");
                    }
                    next.invoke(ctx, command).await
                }
                Phase::Other => next.invoke(ctx, command).await,
            }
        })
    }
}
