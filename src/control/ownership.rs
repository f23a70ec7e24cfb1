//! Ownership roles.
//!
//! For a key and topology, a node is the primary owner, a backup owner or
//! not an owner at all. The role is derived from the oracle's owner list and
//! never stored; local and invalidation caches make every node the sole
//! owner of whatever it holds.

use crate::control::topology::{NodeId, OwnershipOracle, TopologyId};
use crate::core::config::CacheMode;
use crate::core::error::CacheResult;
use serde::{Deserialize, Serialize};

/// Role of a node for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipRole {
    /// Serializes writes and resolves conflicts for the key.
    Primary,
    /// Holds a replica.
    Backup,
    /// Holds nothing for the key; forwards.
    NotOwner,
}

impl OwnershipRole {
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Primary | Self::Backup)
    }
}

impl std::fmt::Display for OwnershipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Backup => write!(f, "backup"),
            Self::NotOwner => write!(f, "not-owner"),
        }
    }
}

impl std::str::FromStr for OwnershipRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "backup" => Ok(Self::Backup),
            "not-owner" => Ok(Self::NotOwner),
            other => Err(format!("unknown ownership role: {}", other)),
        }
    }
}

/// Ordered owners of a key at one topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSet {
    /// Owners; the first is the primary.
    pub owners: Vec<NodeId>,

    /// Topology the list was computed for.
    pub topology_id: TopologyId,
}

impl OwnerSet {
    /// A set where `node` alone owns the key.
    pub fn local(node: NodeId, topology_id: TopologyId) -> Self {
        Self {
            owners: vec![node],
            topology_id,
        }
    }

    /// Resolve the owners of `key` for a cache mode.
    pub fn resolve(
        cache_mode: CacheMode,
        oracle: &dyn OwnershipOracle,
        local: &NodeId,
        key: &[u8],
        topology_id: TopologyId,
    ) -> CacheResult<Self> {
        if !cache_mode.uses_oracle() {
            return Ok(Self::local(local.clone(), topology_id));
        }

        Ok(Self {
            owners: oracle.owners_of(key, topology_id)?,
            topology_id,
        })
    }

    /// The primary owner, if any member exists.
    pub fn primary(&self) -> Option<&NodeId> {
        self.owners.first()
    }

    /// Backup owners in order.
    pub fn backups(&self) -> &[NodeId] {
        self.owners.get(1..).unwrap_or(&[])
    }

    /// Classify `node`.
    pub fn role_of(&self, node: &NodeId) -> OwnershipRole {
        match self.owners.iter().position(|owner| owner == node) {
            Some(0) => OwnershipRole::Primary,
            Some(_) => OwnershipRole::Backup,
            None => OwnershipRole::NotOwner,
        }
    }

    pub fn is_owner(&self, node: &NodeId) -> bool {
        self.owners.contains(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::topology::HashRingOracle;

    #[test]
    fn test_role_classification() {
        let set = OwnerSet {
            owners: vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")],
            topology_id: 1,
        };
        assert_eq!(set.role_of(&NodeId::from("a")), OwnershipRole::Primary);
        assert_eq!(set.role_of(&NodeId::from("c")), OwnershipRole::Backup);
        assert_eq!(set.role_of(&NodeId::from("d")), OwnershipRole::NotOwner);
        assert_eq!(set.backups().len(), 2);
    }

    #[test]
    fn test_local_modes_ignore_oracle() {
        let oracle = HashRingOracle::new(vec![NodeId::from("x"), NodeId::from("y")], 1, 0);
        let me = NodeId::from("me");
        for mode in [CacheMode::Local, CacheMode::InvalidationSync] {
            let set = OwnerSet::resolve(mode, &oracle, &me, b"k", 1).unwrap();
            assert_eq!(set.role_of(&me), OwnershipRole::Primary);
            assert!(set.backups().is_empty());
        }
    }

    #[test]
    fn test_empty_owner_set() {
        let set = OwnerSet {
            owners: Vec::new(),
            topology_id: 1,
        };
        assert!(set.primary().is_none());
        assert!(set.backups().is_empty());
    }
}
