//! Invocation pipeline.
//!
//! - [`chain`] - Stage trait, continuation and chain selection
//! - [`context`] - Per-attempt invocation state
//! - [`stages`] - The stages of the standard chains
//! - [`invoker`] - Attempt driver with topology restarts
//! - [`locks`] - Per-key locks and prepared transaction locks
//! - [`cancel`] - Cancellation of suspended invocations
//! - [`components`] - Node components shared by the stages

pub mod cancel;
pub mod chain;
pub mod components;
pub mod context;
pub mod invoker;
pub mod locks;
pub mod stages;

pub use cancel::{CancelHandle, Canceller};
pub use chain::{ChainSet, InterceptorChain, Next, Stage, StageFuture};
pub use components::NodeComponents;
pub use context::{ContextEntry, InvocationContext, Origin};
pub use invoker::{InvocationReport, Invoker};
pub use locks::{KeyLockGuard, LockManager, PendingTransactions};
