//! Interceptor chain.
//!
//! A chain is an immutable, ordered list of [`Stage`]s. Each stage receives
//! the context, the command and a [`Next`] continuation wrapping the rest of
//! the chain; it may call `next` zero times (short-circuit), once, or, for a
//! bounded retry, more than once. When the continuation runs past the last
//! stage it performs the command, which is the only place a command's effect
//! is applied.
//!
//! # Chain Layout
//!
//! | Chain | Stages |
//! |-------|--------|
//! | read | status → topology → distribution → entry |
//! | write | status → topology → locking → distribution → entry |
//! | transactional | status → topology → tx entry |
//! | tx control | status → topology → tx coordination → entry |
//!
//! Chains are built once per node and shared by every invocation.

use crate::commands::{Command, CommandCategory, CommandResult};
use crate::core::error::CacheResult;
use crate::invocation::context::InvocationContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by stages.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = CacheResult<CommandResult>> + Send + 'a>>;

/// One interceptor of the chain.
pub trait Stage: Send + Sync {
    /// Stable name for logs and chain introspection.
    fn name(&self) -> &'static str;

    /// Handle `command`, delegating to the rest of the chain through `next`.
    fn handle<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
        next: Next<'a>,
    ) -> StageFuture<'a>;
}

/// Continuation over the remaining stages.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    /// Run the remaining stages, then perform the command.
    pub fn invoke<'b>(self, ctx: &'b mut InvocationContext, command: &'b Command) -> StageFuture<'b>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.handle(ctx, command, Next { rest }),
            None => Box::pin(async move {
                ctx.mark_performed()?;
                command.perform(ctx)
            }),
        }
    }

    /// Names of the stages still ahead.
    pub fn remaining(&self) -> Vec<&'static str> {
        self.rest.iter().map(|stage| stage.name()).collect()
    }
}

/// Immutable, shareable ordered list of stages.
#[derive(Clone)]
pub struct InterceptorChain {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl InterceptorChain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder { stages: Vec::new() }
    }

    /// Submit `command` to the first stage.
    pub fn invoke<'a>(
        &'a self,
        ctx: &'a mut InvocationContext,
        command: &'a Command,
    ) -> StageFuture<'a> {
        Next {
            rest: &self.stages,
        }
        .invoke(ctx, command)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

/// Builder fixing the stage order of a chain.
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl ChainBuilder {
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> InterceptorChain {
        InterceptorChain {
            stages: self.stages.into(),
        }
    }
}

/// The chains of one node, selected by command category.
#[derive(Debug, Clone)]
pub struct ChainSet {
    pub read: InterceptorChain,
    pub write: InterceptorChain,
    pub transactional: InterceptorChain,
    pub tx_control: InterceptorChain,
}

impl ChainSet {
    /// Chain a command runs through.
    pub fn select(&self, command: &Command, transactional: bool) -> &InterceptorChain {
        match command.category() {
            CommandCategory::TxControl => &self.tx_control,
            _ if transactional => &self.transactional,
            CommandCategory::Read => &self.read,
            CommandCategory::Write => &self.write,
        }
    }
}
