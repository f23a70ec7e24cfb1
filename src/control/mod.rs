//! Cluster topology and key ownership.
//!
//! - [`topology`] - Node ids, topology ids and the ownership oracle
//! - [`ownership`] - Ownership roles and per-key owner sets
//!
//! # Topology Freshness
//!
//! Every invocation attempt captures the oracle's topology id once. Any
//! stage that later observes a different current id fails the attempt with
//! `TopologyStale`; the invoker restarts it with a fresh owner query rather
//! than patching the old one.

pub mod ownership;
pub mod topology;

pub use ownership::{OwnerSet, OwnershipRole};
pub use topology::{HashRingOracle, NodeId, OwnershipOracle, Topology, TopologyId};
