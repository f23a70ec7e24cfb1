//! Status gate.
//!
//! Runs first in every chain. A command whose skip predicate holds for the
//! current component status completes with [`CommandResult::Skipped`]
//! before anything is loaded or locked. Otherwise local invocations need a
//! running cache, while peers may still reach a node that is stopping.

use crate::commands::{Command, CommandResult};
use crate::core::error::CacheError;
use crate::core::lifecycle::ComponentStatus;
use crate::invocation::chain::{Next, Stage, StageFuture};
use crate::invocation::components::NodeComponents;
use crate::invocation::context::{InvocationContext, Origin};
use std::sync::Arc;

pub struct StatusStage {
    components: Arc<NodeComponents>,
}

impl StatusStage {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        Self { components }
    }
}

impl Stage for StatusStage {
    fn name(&self) -> &'static str {
        "status"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a> {
        Box::pin(async move {
            let status = self.components.status.get();
            if command.should_skip(status) {
                tracing::debug!(
                    node = %self.components.local,
                    command = %command.tag(),
                    %status,
                    "command skipped"
                );
                return Ok(CommandResult::Skipped);
            }

            let accepted = match ctx.origin() {
                Origin::Local => status.allows_invocations(),
                Origin::Remote(_) => {
                    matches!(status, ComponentStatus::Running | ComponentStatus::Stopping)
                }
            };
            if !accepted {
                return Err(CacheError::NotRunning { status });
            }

            next.invoke(ctx, command).await
        })
    }
}
