//! Invocation driver.
//!
//! The invoker builds a fresh [`InvocationContext`] per attempt, submits the
//! command to the chain selected by its category, and restarts the whole
//! invocation when an attempt fails with `TopologyStale`. Restarts are
//! immediate and bounded by `invocation.max_topology_retries`; every other
//! error is returned to the caller as is.

use crate::commands::{Command, CommandResult};
use crate::control::topology::{NodeId, TopologyId};
use crate::core::error::CacheResult;
use crate::invocation::cancel::CancelHandle;
use crate::invocation::chain::ChainSet;
use crate::invocation::components::NodeComponents;
use crate::invocation::context::{InvocationContext, Origin};
use crate::invocation::stages::standard_chains;
use std::sync::Arc;

/// Outcome of an invocation together with how it was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub result: CacheResult<CommandResult>,
    /// Attempts made, restarts included.
    pub attempts: u32,
    /// Topology id captured by each attempt, in order.
    pub topologies: Vec<TopologyId>,
}

/// Submits commands to a node's chains.
#[derive(Clone)]
pub struct Invoker {
    components: Arc<NodeComponents>,
    chains: ChainSet,
}

impl Invoker {
    pub fn new(components: Arc<NodeComponents>) -> Self {
        let chains = standard_chains(&components);
        Self { components, chains }
    }

    pub fn components(&self) -> &Arc<NodeComponents> {
        &self.components
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    /// A fresh context for one attempt.
    pub fn new_context(&self, origin: Origin, transactional: bool) -> InvocationContext {
        InvocationContext::new(
            self.components.local.clone(),
            origin,
            self.components.container.clone(),
            transactional,
        )
        .with_cache_mode(self.components.cache_mode())
    }

    /// Run one attempt in `ctx`.
    pub async fn attempt(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> CacheResult<CommandResult> {
        let chain = self.chains.select(command, ctx.is_transactional());
        chain.invoke(ctx, command).await
    }

    /// Invoke a command submitted on this node.
    pub async fn invoke(&self, command: &Command) -> CacheResult<CommandResult> {
        self.invoke_traced(command).await.result
    }

    /// Invoke a command submitted on this node, reporting restarts.
    pub async fn invoke_traced(&self, command: &Command) -> InvocationReport {
        self.invoke_cancellable(command, CancelHandle::none()).await
    }

    /// Invoke a command that `cancel` may abandon at any suspension point.
    pub async fn invoke_cancellable(
        &self,
        command: &Command,
        cancel: CancelHandle,
    ) -> InvocationReport {
        let (report, _) = self
            .run(command, || {
                self.new_context(Origin::Local, false)
                    .with_cancel(cancel.clone())
            })
            .await;
        report
    }

    /// Drive attempts until one does not fail with `TopologyStale` or the
    /// restart bound is reached. `seed` builds the context of each attempt;
    /// the context of the last attempt is returned with the report.
    pub(crate) async fn run<S>(&self, command: &Command, mut seed: S) -> (InvocationReport, InvocationContext)
    where
        S: FnMut() -> InvocationContext + Send,
    {
        let max_restarts = self.components.config.invocation.max_topology_retries;
        let mut topologies = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut ctx = seed();
            let result = self.attempt(&mut ctx, command).await;
            topologies.push(ctx.topology_id());

            match result {
                Err(err) if err.is_topology_stale() && attempt <= max_restarts => {
                    tracing::warn!(
                        node = %self.components.local,
                        command = %command.tag(),
                        attempt,
                        error = %err,
                        "topology changed; restarting invocation"
                    );
                    ctx.discard();
                }
                result => {
                    if let Err(err) = &result {
                        tracing::debug!(
                            node = %self.components.local,
                            command = %command.tag(),
                            attempt,
                            error = %err,
                            "invocation failed"
                        );
                    }
                    let report = InvocationReport {
                        result,
                        attempts: attempt,
                        topologies,
                    };
                    return (report, ctx);
                }
            }
        }
    }

    /// Run a command sent by another node. Never restarted here: a stale
    /// topology is reported back to the sender, which restarts the whole
    /// invocation.
    pub async fn invoke_remote(&self, from: NodeId, command: &Command) -> CacheResult<CommandResult> {
        let mut ctx = self.new_context(Origin::Remote(from), false);
        self.attempt(&mut ctx, command).await
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("node", &self.components.local)
            .field("chains", &self.chains)
            .finish()
    }
}
