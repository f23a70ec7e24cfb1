//! Locking stage.
//!
//! Only the primary owner serializes writes, so keys are locked only where
//! this node is the primary. Waiting for a lock is a suspension point: the
//! wait races the cancellation handle and the topology is re-checked once
//! the lock is granted. Locks live in the context and are released when the
//! attempt ends, after the entry has been committed and replicated.

use crate::commands::{Command, CommandTag, DispatchTable, Flag, Key};
use crate::control::ownership::OwnershipRole;
use crate::core::error::display_key;
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::InvocationContext;
use std::sync::Arc;

/// Writes that lock their key on the primary owner.
const LOCKED_WRITES: [CommandTag; 8] = [
    CommandTag::Put,
    CommandTag::PutIfAbsent,
    CommandTag::Replace,
    CommandTag::ReplaceIfEquals,
    CommandTag::Remove,
    CommandTag::RemoveIfEquals,
    CommandTag::Increment,
    CommandTag::Append,
];

pub struct LockingStage {
    components: Arc<NodeComponents>,
    keys: DispatchTable<InvocationContext, Vec<Key>>,
}

impl LockingStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self {
            components,
            keys: DispatchTable::new(no_keys).with_all(&LOCKED_WRITES, key_if_primary),
        }
    }
}

fn no_keys(_: &Command, _: &mut InvocationContext) -> Vec<Key> {
    Vec::new()
}

fn key_if_primary(command: &Command, ctx: &mut InvocationContext) -> Vec<Key> {
    command
        .key()
        .filter(|key| ctx.role_of(key) == OwnershipRole::Primary)
        .cloned()
        .into_iter()
        .collect()
}

impl Stage for LockingStage {
    fn name(&self) -> &'static str {
        "locking"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            if command.has_flag(Flag::SkipLocking) {
                return next.invoke(ctx, command).await;
            }

            let timeout = self.components.lock_timeout();
            for key in command.accept(ctx, &self.keys) {
                let guard = ctx
                    .suspend(self.components.locks.acquire(&key, timeout))
                    .await?;
                tracing::trace!(node = %self.components.local, key = %display_key(&key), "locked");
                ctx.hold(guard);
                ctx.check_topology(&*self.components.oracle)?;
            }

            next.invoke(ctx, command).await
        })
    }
}
