//! Topology stage.
//!
//! Captures the topology id of the attempt and resolves the owner set of
//! every key the command touches, once. Commands arriving from a peer carry
//! the sender's topology id; a mismatch with the local oracle fails the
//! attempt so the sender restarts under the new topology.

use crate::commands::Command;
use crate::control::ownership::OwnerSet;
use crate::core::error::CacheError;
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::{InvocationContext, Origin};
use std::sync::Arc;

pub struct TopologyStage {
    components: Arc<NodeComponents>,
}

impl TopologyStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self { components }
    }
}

impl Stage for TopologyStage {
    fn name(&self) -> &'static str {
        "topology"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let oracle = &*self.components.oracle;
            let cache_mode = self.components.cache_mode();
            let current = oracle.current_topology_id();

            let sender = match ctx.origin() {
                Origin::Remote(from) => Some(from.clone()),
                Origin::Local => None,
            };
            match sender {
                Some(from) if cache_mode.uses_oracle() => {
                    let stamped = command.topology_id();
                    if stamped != current {
                        tracing::debug!(
                            node = %self.components.local,
                            from = %from,
                            stamped,
                            current,
                            command = %command.tag(),
                            "rejecting command sent under another topology"
                        );
                        return Err(CacheError::topology_stale(current, stamped));
                    }
                    ctx.capture_topology(stamped);
                }
                _ => ctx.capture_topology(current),
            }

            let topology_id = ctx.topology_id();
            for key in command.keys() {
                let owners = OwnerSet::resolve(
                    cache_mode,
                    oracle,
                    &self.components.local,
                    &key,
                    topology_id,
                )?;
                ctx.cache_owners(key, owners);
            }

            next.invoke(ctx, command).await
        })
    }
}
