//! Tessera - transactional key-value cache built on a command pipeline.
//!
//! Every read and mutation is a [`commands::Command`] submitted to an
//! ordered interceptor chain. Stages capture the topology, take key locks,
//! forward or replicate across the cluster, load previous values and commit
//! entries; the chain terminal applies the command's effect exactly once per
//! attempt. Whether a node needs a key's previous value is decided by a pure
//! function of the command's load type, the cache mode, transactionality and
//! the node's ownership role.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CacheNode / Transaction                    │
//! │        get │ put │ conditional writes │ increment │ 2PC         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Invoker (topology-stale restarts)               │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Interceptor Chain                        │
//! │  status → topology → locking → distribution → entry → perform   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        DataContainer │ OwnershipOracle │ Transport              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - In-process cluster orchestration
//! - [`core::lifecycle`] - Component status and lifecycle hooks
//! - [`core::error`] - Error types and failure classification
//!
//! ## Commands
//! - [`commands`] - Command kinds, flags and results
//! - [`commands::load_type`] - Load types and the load decision
//! - [`commands::dispatch`] - Kind-based dispatch tables
//!
//! ## Invocation
//! - [`invocation::chain`] - Stage trait and chain selection
//! - [`invocation::context`] - Per-attempt invocation state
//! - [`invocation::stages`] - Standard chain stages
//! - [`invocation::invoker`] - Attempt driver
//!
//! ## Control
//! - [`control::topology`] - Topology ids and the ownership oracle
//! - [`control::ownership`] - Ownership roles and owner sets
//!
//! ## Storage and Networking
//! - [`storage::container`] - Versioned node-local data container
//! - [`net::transport`] - Transport contracts
//! - [`net::local`] - In-process cluster transport
//!
//! ## Cache
//! - [`cache`] - Cache node API and transactions
//!
//! # Key Invariants
//!
//! - A command is performed at most once per attempt.
//! - An attempt that observes a topology change is discarded and restarted
//!   from the first stage with a fresh context.
//! - A command's load type is fixed when it is built.
//! - Only the primary owner takes key locks for non-transactional writes.

// Core infrastructure
pub mod core;

// Commands and the load decision
pub mod commands;

// Interceptor chain and invocation driver
pub mod invocation;

// Topology and ownership
pub mod control;

// Data container
pub mod storage;

// Transports
pub mod net;

// Cache node API
pub mod cache;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, lifecycle, runtime};
pub use cache::{CacheNode, Transaction};
pub use commands::{Command, CommandResult, Flag, Key, LoadType, Value};
pub use error::{CacheError, CacheResult};
