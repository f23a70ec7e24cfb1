//! Distribution stage.
//!
//! Decides where a command runs and who else must see its effect:
//!
//! | Route | Commands | Behaviour |
//! |-------|----------|-----------|
//! | Read | GET | forwarded to the primary when the originator owns no copy |
//! | Write | single-key writes | forwarded to the primary, or performed and replicated by it |
//! | Broadcast | INVALIDATE, CLEAR | performed locally, then sent to every other member |
//! | Local | APPLY_VALUE, SIZE | performed locally only |
//!
//! In invalidation modes every node owns what it holds, so a committed write
//! invalidates the key on the other members instead of replicating it.
//! Commands flagged `CacheModeLocal`, and every command of a local cache,
//! pass straight through.

use crate::commands::{Command, CommandResult, CommandTag, DispatchTable, Flag, Key, LoadType};
use crate::control::ownership::{OwnerSet, OwnershipRole};
use crate::control::topology::NodeId;
use crate::core::error::{display_key, CacheError, CacheResult};
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::{CommittedWrite, InvocationContext};
use crate::invocation::stages::{await_acks, detach_acks, send_all, stale_or};
use crate::net::transport::call_with_timeout;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Local,
    Read,
    Write,
    Broadcast,
}

const ROUTED_WRITES: [CommandTag; 8] = [
    CommandTag::Put,
    CommandTag::PutIfAbsent,
    CommandTag::Replace,
    CommandTag::ReplaceIfEquals,
    CommandTag::Remove,
    CommandTag::RemoveIfEquals,
    CommandTag::Increment,
    CommandTag::Append,
];

pub struct DistributionStage {
    components: Arc<NodeComponents>,
    routes: DispatchTable<InvocationContext, Route>,
}

impl DistributionStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        let routes = DispatchTable::new(local_route)
            .with(CommandTag::Get, read_route)
            .with_all(&ROUTED_WRITES, write_route)
            .with_all(&[CommandTag::Invalidate, CommandTag::Clear], broadcast_route);
        Self { components, routes }
    }

    fn is_synchronous(&self, command: &Command) -> bool {
        self.components.cache_mode().is_synchronous() || command.has_flag(Flag::ForceSynchronous)
    }

    /// Every member of the captured topology except this node.
    fn peers(&self, ctx: &InvocationContext) -> CacheResult<Vec<NodeId>> {
        let members = self.components.oracle.members(ctx.topology_id())?;
        Ok(members
            .into_iter()
            .filter(|member| *member != self.components.local)
            .collect())
    }

    /// Run the command on the key's primary owner and return its result.
    async fn forward(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        key: &Key,
    ) -> CacheResult<CommandResult> {
        let primary = ctx.primary_of(key)?;
        tracing::debug!(
            node = %self.components.local,
            primary = %primary,
            key = %display_key(key),
            command = %command.tag(),
            topology = ctx.topology_id(),
            "forwarding to primary owner"
        );

        let stamped = command.stamped(ctx.topology_id());
        let call = call_with_timeout(
            self.components.remote_timeout(),
            &primary,
            self.components
                .transport
                .invoke(&self.components.local, &primary, stamped),
        );
        match ctx.suspend(call).await {
            Ok(result) => Ok(result),
            Err(err) => Err(stale_or(&self.components, ctx, err)),
        }
    }

    /// Ship the primary's committed writes to the backup owners.
    ///
    /// The local commit has already happened, so a topology change seen here
    /// never restarts the invocation: the final value is resent under the
    /// current topology instead.
    async fn replicate(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        key: &Key,
    ) -> CacheResult<()> {
        let committed: Vec<CommittedWrite> = ctx.committed().to_vec();
        if committed.is_empty() {
            return Ok(());
        }
        let backups: Vec<NodeId> = ctx
            .owners(key)
            .map(|owners| owners.backups().to_vec())
            .unwrap_or_default();
        if backups.is_empty() {
            return Ok(());
        }

        let topology_id = ctx.topology_id();
        // Backups recompute deltas only where they apply writes in lock
        // order; asynchronous delivery ships final values.
        let delta = self.components.cache_mode().is_synchronous()
            && command.load_type()? == LoadType::Owner;
        let mut messages = Vec::with_capacity(backups.len() * committed.len());
        for write in &committed {
            for backup in &backups {
                let message = if delta {
                    command.for_backup(topology_id, Some(write.version))
                } else {
                    Command::apply_value(
                        write.key.clone(),
                        write.value.clone(),
                        topology_id,
                        Some(write.version),
                    )
                };
                messages.push((backup.clone(), message));
            }
        }

        tracing::trace!(
            node = %self.components.local,
            key = %display_key(key),
            backups = backups.len(),
            delta,
            "replicating to backups"
        );

        let handles = send_all(&self.components, messages);
        if !self.is_synchronous(command) {
            detach_acks(handles, "replication");
            return Ok(());
        }

        match ctx.suspend(await_acks(handles)).await {
            Ok(()) if ctx.check_topology(&*self.components.oracle).is_ok() => Ok(()),
            Ok(()) => self.repair(ctx, key, &backups, &committed).await,
            Err(err) => match stale_or(&self.components, ctx, err) {
                err if err.is_topology_stale() => self.repair(ctx, key, &[], &committed).await,
                err => Err(err),
            },
        }
    }

    /// The topology moved after the local commit: hand the final value to
    /// every current owner that has not acknowledged it.
    async fn repair(
        &self,
        ctx: &InvocationContext,
        key: &Key,
        acked: &[NodeId],
        committed: &[CommittedWrite],
    ) -> CacheResult<()> {
        let current = self.components.oracle.current_topology_id();
        let owners = OwnerSet::resolve(
            self.components.cache_mode(),
            &*self.components.oracle,
            &self.components.local,
            key,
            current,
        )?;
        let targets: Vec<NodeId> = owners
            .owners
            .into_iter()
            .filter(|owner| *owner != self.components.local && !acked.contains(owner))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            node = %self.components.local,
            key = %display_key(key),
            captured = ctx.topology_id(),
            current,
            targets = targets.len(),
            "topology changed during replication; sending final value to current owners"
        );

        let messages = committed
            .iter()
            .flat_map(|write| {
                targets.iter().map(move |owner| {
                    (
                        owner.clone(),
                        Command::apply_value(
                            write.key.clone(),
                            write.value.clone(),
                            current,
                            Some(write.version),
                        ),
                    )
                })
            })
            .collect();
        if let Err(err) = await_acks(send_all(&self.components, messages)).await {
            tracing::warn!(
                node = %self.components.local,
                key = %display_key(key),
                error = %err,
                "replication repair failed"
            );
        }
        Ok(())
    }

    /// Invalidate committed keys on every other member.
    async fn invalidate_peers(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> CacheResult<()> {
        let keys: Vec<Key> = ctx.committed().iter().map(|w| w.key.clone()).collect();
        if keys.is_empty() || !ctx.is_originator() {
            return Ok(());
        }
        let invalidate = Command::invalidate(keys).flag(Flag::CacheModeLocal);
        let sent = self
            .send_to_peers(ctx, command, invalidate.stamped(ctx.topology_id()), "invalidation")
            .await;
        match sent {
            Err(err) if err.is_topology_stale() => {
                // Committed here already; invalidate under the new topology.
                let current = self.components.oracle.current_topology_id();
                tracing::warn!(
                    node = %self.components.local,
                    captured = ctx.topology_id(),
                    current,
                    "topology changed during invalidation; resending"
                );
                let messages = self
                    .components
                    .oracle
                    .members(current)?
                    .into_iter()
                    .filter(|member| *member != self.components.local)
                    .map(|member| (member, invalidate.stamped(current)))
                    .collect();
                if let Err(err) = await_acks(send_all(&self.components, messages)).await {
                    tracing::warn!(node = %self.components.local, error = %err, "invalidation resend failed");
                }
                Ok(())
            }
            sent => sent,
        }
    }

    async fn send_to_peers(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        message: Command,
        what: &'static str,
    ) -> CacheResult<()> {
        let messages: Vec<_> = self
            .peers(ctx)?
            .into_iter()
            .map(|peer| (peer, message.clone()))
            .collect();
        let handles = send_all(&self.components, messages);
        if !self.is_synchronous(command) {
            detach_acks(handles, what);
            return Ok(());
        }
        match ctx.suspend(await_acks(handles)).await {
            Ok(()) => Ok(()),
            Err(err) => Err(stale_or(&self.components, ctx, err)),
        }
    }
}

impl Stage for DistributionStage {
    fn name(&self) -> &'static str {
        "distribution"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let mode = self.components.cache_mode();
            if !mode.is_clustered() || command.has_flag(Flag::CacheModeLocal) {
                return next.invoke(ctx, command).await;
            }

            match command.accept(ctx, &self.routes) {
                Route::Local => next.invoke(ctx, command).await,
                Route::Read => {
                    let key = single_key(command)?;
                    let remote = ctx.is_originator()
                        && mode.uses_oracle()
                        && ctx.role_of(&key) == OwnershipRole::NotOwner;
                    if remote {
                        self.forward(ctx, command, &key).await
                    } else {
                        next.invoke(ctx, command).await
                    }
                }
                Route::Write => {
                    let key = single_key(command)?;
                    if mode.is_invalidation() {
                        let result = next.invoke(ctx, command).await?;
                        self.invalidate_peers(ctx, command).await?;
                        return Ok(result);
                    }
                    match ctx.role_of(&key) {
                        OwnershipRole::Primary => {
                            let result = next.invoke(ctx, command).await?;
                            self.replicate(ctx, command, &key).await?;
                            Ok(result)
                        }
                        _ if ctx.is_originator() => self.forward(ctx, command, &key).await,
                        _ => next.invoke(ctx, command).await,
                    }
                }
                Route::Broadcast => {
                    let result = next.invoke(ctx, command).await?;
                    if ctx.is_originator() {
                        let message = command
                            .clone()
                            .flag(Flag::CacheModeLocal)
                            .stamped(ctx.topology_id());
                        self.send_to_peers(ctx, command, message, "broadcast").await?;
                    }
                    Ok(result)
                }
            }
        })
    }
}

fn local_route(_: &Command, _: &mut InvocationContext) -> Route {
    Route::Local
}

fn read_route(_: &Command, _: &mut InvocationContext) -> Route {
    Route::Read
}

fn write_route(_: &Command, _: &mut InvocationContext) -> Route {
    Route::Write
}

fn broadcast_route(_: &Command, _: &mut InvocationContext) -> Route {
    Route::Broadcast
}

fn single_key(command: &Command) -> CacheResult<Key> {
    command
        .key()
        .cloned()
        .ok_or_else(|| CacheError::invalid(format!("{} has no single key", command.tag())))
}
