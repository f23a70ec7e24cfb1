//! Storage layer.
//!
//! The cache keeps its data in a node-local, versioned in-memory container.
//! Persistence stores are not part of the pipeline; the container is the
//! only thing the load step and the entry commit ever touch.
//!
//! # Modules
//!
//! - [`container`] - Versioned key-value container with counted access paths
//!
//! # Invariants
//!
//! - **Monotonic versions**: a key's version never decreases, removals included
//! - **Pinned versions**: replicas adopt the version chosen by the primary owner

pub mod container;

pub use container::{ContainerStats, DataContainer, VersionedValue};
