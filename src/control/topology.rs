//! Cluster topology and the ownership oracle.
//!
//! The pipeline treats key ownership as a black box: it asks an
//! [`OwnershipOracle`] for the ordered owner list of a key at a given
//! topology id (first entry = primary) and for the current topology id.
//!
//! [`HashRingOracle`] is the reference oracle used by the in-process
//! cluster. It routes a key with xxHash64 onto the member list and takes
//! `num_owners` consecutive members from there:
//! `start = hash64(key, hash_seed) % members.len()`
//!
//! # Topology changes
//!
//! Installing a new member list bumps the topology id. Older topologies stay
//! resolvable for a bounded history so in-flight invocations can still
//! compare what they observed with what is current.

use crate::core::error::{CacheError, CacheResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use twox_hash::XxHash64;

/// Monotonically increasing topology version.
pub type TopologyId = u64;

/// Topologies retained for lookups by older invocations.
const TOPOLOGY_HISTORY: usize = 16;

/// A cluster node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Source of key ownership for the pipeline.
pub trait OwnershipOracle: Send + Sync {
    /// Ordered owners of `key` at `topology_id`; the first is the primary.
    fn owners_of(&self, key: &[u8], topology_id: TopologyId) -> CacheResult<Vec<NodeId>>;

    /// The latest installed topology id.
    fn current_topology_id(&self) -> TopologyId;

    /// All members at `topology_id`.
    fn members(&self, topology_id: TopologyId) -> CacheResult<Vec<NodeId>>;
}

/// A versioned snapshot of membership and key assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Topology id.
    pub id: TopologyId,
    /// Members in ring order.
    pub members: Vec<NodeId>,
    /// Owners per key, capped at the member count.
    pub num_owners: usize,
    /// Hash seed for key placement.
    pub hash_seed: u64,
}

impl Topology {
    /// Route a key to its ordered owners.
    pub fn owners_of(&self, key: &[u8]) -> Vec<NodeId> {
        if self.members.is_empty() {
            return Vec::new();
        }

        let count = self.members.len();
        let start = (compute_key_hash(key, self.hash_seed) % count as u64) as usize;
        (0..self.num_owners.min(count))
            .map(|i| self.members[(start + i) % count].clone())
            .collect()
    }

    /// Check if a node is a member of this topology.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}

/// Reference oracle: hash ring over the member list with topology history.
pub struct HashRingOracle {
    /// Current topology id.
    current: AtomicU64,

    /// Recent topologies by id.
    history: RwLock<BTreeMap<TopologyId, Arc<Topology>>>,

    /// Owners per key.
    num_owners: usize,

    /// Hash seed.
    hash_seed: u64,
}

impl HashRingOracle {
    /// Create an oracle whose first topology (id 1) contains `members`.
    pub fn new(members: Vec<NodeId>, num_owners: usize, hash_seed: u64) -> Self {
        let initial = Arc::new(Topology {
            id: 1,
            members,
            num_owners,
            hash_seed,
        });
        let mut history = BTreeMap::new();
        history.insert(1, initial);

        Self {
            current: AtomicU64::new(1),
            history: RwLock::new(history),
            num_owners,
            hash_seed,
        }
    }

    /// Create an oracle matching a cache mode.
    ///
    /// Replicated caches make every member an owner of every key.
    pub fn for_mode(
        cache_mode: crate::core::config::CacheMode,
        members: Vec<NodeId>,
        num_owners: usize,
        hash_seed: u64,
    ) -> Self {
        let owners = if cache_mode.is_replicated() {
            usize::MAX
        } else {
            num_owners
        };
        Self::new(members, owners, hash_seed)
    }

    /// Get a topology by id.
    pub fn topology(&self, topology_id: TopologyId) -> Option<Arc<Topology>> {
        self.history.read().get(&topology_id).cloned()
    }

    /// Get the current topology.
    pub fn current_topology(&self) -> Arc<Topology> {
        let history = self.history.read();
        let current = self.current.load(Ordering::Acquire);
        match history.get(&current) {
            Some(topology) => topology.clone(),
            None => history
                .values()
                .next_back()
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(Topology {
                        id: current,
                        members: Vec::new(),
                        num_owners: self.num_owners,
                        hash_seed: self.hash_seed,
                    })
                }),
        }
    }

    /// Install a new member list, returning the new topology id.
    pub fn install(&self, members: Vec<NodeId>) -> TopologyId {
        let mut history = self.history.write();
        let previous = self.current.load(Ordering::Acquire);
        let id = previous + 1;

        history.insert(
            id,
            Arc::new(Topology {
                id,
                members,
                num_owners: self.num_owners,
                hash_seed: self.hash_seed,
            }),
        );
        while history.len() > TOPOLOGY_HISTORY {
            let oldest = match history.keys().next() {
                Some(oldest) => *oldest,
                None => break,
            };
            history.remove(&oldest);
        }
        self.current.store(id, Ordering::Release);

        tracing::info!(
            old_topology = previous,
            new_topology = id,
            "topology installed"
        );
        id
    }

    /// Reinstall the current members under a new topology id.
    ///
    /// Ownership is unchanged but every in-flight invocation becomes stale.
    pub fn bump(&self) -> TopologyId {
        let members = self.current_topology().members.clone();
        self.install(members)
    }

    /// Add a member at the end of the ring.
    pub fn join(&self, node: NodeId) -> TopologyId {
        let mut members = self.current_topology().members.clone();
        if !members.contains(&node) {
            members.push(node);
        }
        self.install(members)
    }

    /// Remove a member.
    pub fn leave(&self, node: &NodeId) -> TopologyId {
        let mut members = self.current_topology().members.clone();
        members.retain(|m| m != node);
        self.install(members)
    }
}

impl OwnershipOracle for HashRingOracle {
    fn owners_of(&self, key: &[u8], topology_id: TopologyId) -> CacheResult<Vec<NodeId>> {
        match self.topology(topology_id) {
            Some(topology) => Ok(topology.owners_of(key)),
            None => Err(CacheError::topology_stale(
                self.current_topology_id(),
                topology_id,
            )),
        }
    }

    fn current_topology_id(&self) -> TopologyId {
        self.current.load(Ordering::Acquire)
    }

    fn members(&self, topology_id: TopologyId) -> CacheResult<Vec<NodeId>> {
        match self.topology(topology_id) {
            Some(topology) => Ok(topology.members.clone()),
            None => Err(CacheError::topology_stale(
                self.current_topology_id(),
                topology_id,
            )),
        }
    }
}

/// Compute the placement hash for a key.
pub fn compute_key_hash(key: &[u8], hash_seed: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(hash_seed);
    hasher.write(key);
    hasher.finish()
}
