//! Entry stage: the load step and the local commit.
//!
//! Before delegating, the stage asks the load-type resolver whether this
//! node needs the previous value of the command's key and loads it into the
//! context. After the terminal stage performed the command, every changed
//! entry is committed to the container, with the version pinned by the
//! primary owner when the command carries one. A pinned write older than the
//! stored value is dropped and not reported as committed.

use crate::commands::{resolve, Command, CommandTag, DispatchTable, Key, LoadQuery};
use crate::core::error::display_key;
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::InvocationContext;
use crate::invocation::stages::load_value;
use std::sync::Arc;

/// Commands whose single key goes through the load step.
const KEYED: [CommandTag; 10] = [
    CommandTag::Get,
    CommandTag::Put,
    CommandTag::PutIfAbsent,
    CommandTag::Replace,
    CommandTag::ReplaceIfEquals,
    CommandTag::Remove,
    CommandTag::RemoveIfEquals,
    CommandTag::Increment,
    CommandTag::Append,
    CommandTag::ApplyValue,
];

pub struct EntryStage {
    components: Arc<NodeComponents>,
    keys: DispatchTable<InvocationContext, Vec<Key>>,
}

impl EntryStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self {
            components,
            keys: DispatchTable::new(no_keys).with_all(&KEYED, single_key),
        }
    }
}

fn no_keys(_: &Command, _: &mut InvocationContext) -> Vec<Key> {
    Vec::new()
}

fn single_key(command: &Command, _: &mut InvocationContext) -> Vec<Key> {
    command.key().cloned().into_iter().collect()
}

impl Stage for EntryStage {
    fn name(&self) -> &'static str {
        "entry"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let keys = command.accept(ctx, &self.keys);
            if !keys.is_empty() {
                let load_type = command.load_type()?;
                for key in keys {
                    let query = LoadQuery {
                        load_type,
                        cache_mode: self.components.cache_mode(),
                        transactional: ctx.is_transactional(),
                        role: ctx.role_of(&key),
                        originator: ctx.is_originator(),
                    };
                    let decision = resolve(&query);
                    tracing::debug!(
                        node = %self.components.local,
                        key = %display_key(&key),
                        command = %command.tag(),
                        %load_type,
                        role = %query.role,
                        must_load = decision.must_load,
                        "load decision"
                    );

                    if decision.must_load {
                        let loaded =
                            load_value(&self.components, ctx, &key, decision.source).await?;
                        ctx.record_load(key, loaded);
                    }
                }
            }

            let result = next.invoke(ctx, command).await?;

            let pinned = command.pinned_version();
            for (key, value) in ctx.changed_entries() {
                let version = self
                    .components
                    .container
                    .commit(key.clone(), value.clone(), pinned);
                if pinned.is_some_and(|pinned| version > pinned) {
                    tracing::debug!(
                        node = %self.components.local,
                        key = %display_key(&key),
                        stored = version,
                        ?pinned,
                        "late write dropped"
                    );
                    continue;
                }
                tracing::trace!(
                    node = %self.components.local,
                    key = %display_key(&key),
                    version,
                    "entry committed"
                );
                ctx.record_commit(key, value, version);
            }

            Ok(result)
        })
    }
}
