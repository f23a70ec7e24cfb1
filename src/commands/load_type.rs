//! Load types and the load decision.
//!
//! A command declares where the previous value of its keys must be read.
//! [`resolve`] turns that declaration, the cache mode, transactionality and
//! the local node's ownership role into a [`LoadDecision`]. The function is
//! pure: it never touches storage, topology or the network.
//!
//! | LoadType | Mode | Role | Decision |
//! |----------|------|------|----------|
//! | DontLoad | any | any | no load |
//! | Primary | non-tx | Primary | load, Local |
//! | Primary | non-tx | Backup / NotOwner | no load |
//! | Primary | tx, originator | Primary | load, Local |
//! | Primary | tx, originator | Backup / NotOwner | load, RemotePrimary |
//! | Primary | tx, owner side | Primary | no load, write-skew check |
//! | Primary | tx, owner side | Backup / NotOwner | no load |
//! | Owner | any | Primary / Backup | load, Local (write-skew check on a tx primary) |
//! | Owner | tx, originator | NotOwner | load, RemoteAll |
//! | Owner | otherwise | NotOwner | no load |

use crate::control::ownership::OwnershipRole;
use crate::core::config::CacheMode;
use serde::{Deserialize, Serialize};

/// Nodes on which a command needs the previous value of its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadType {
    /// Never load the previous value.
    DontLoad,
    /// Non-transactional: only the primary owner loads. Transactional: the
    /// value is fetched to the originator and the primary reads it only for
    /// the write-skew check.
    Primary,
    /// Every owner loads the previous value itself, because each one derives
    /// the new value from the old one.
    Owner,
}

impl std::fmt::Display for LoadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DontLoad => write!(f, "dont-load"),
            Self::Primary => write!(f, "primary"),
            Self::Owner => write!(f, "owner"),
        }
    }
}

/// Where a previous value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadSource {
    /// This node's data container.
    Local,
    /// The key's primary owner.
    RemotePrimary,
    /// Any owner; the first reply wins.
    RemoteAll,
}

/// Inputs of the load decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadQuery {
    pub load_type: LoadType,
    pub cache_mode: CacheMode,
    pub transactional: bool,
    pub role: OwnershipRole,
    /// Whether this node started the invocation (as opposed to executing a
    /// forwarded, replicated or transaction-control command).
    pub originator: bool,
}

/// Outcome of the load decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadDecision {
    pub must_load: bool,
    pub source: LoadSource,
    /// Compare the version read by the transaction with the stored one.
    pub verify_write_skew: bool,
}

impl LoadDecision {
    /// No load at all.
    pub const NONE: LoadDecision = LoadDecision {
        must_load: false,
        source: LoadSource::Local,
        verify_write_skew: false,
    };

    pub const fn load(source: LoadSource) -> Self {
        Self {
            must_load: true,
            source,
            verify_write_skew: false,
        }
    }

    pub const fn write_skew_only() -> Self {
        Self {
            must_load: false,
            source: LoadSource::Local,
            verify_write_skew: true,
        }
    }

    fn with_write_skew(mut self) -> Self {
        self.verify_write_skew = true;
        self
    }

    /// Whether the decision involves reading stored data in any way.
    pub fn touches_storage(&self) -> bool {
        self.must_load || self.verify_write_skew
    }
}

/// Decide whether, and from where, the previous value must be loaded.
pub fn resolve(query: &LoadQuery) -> LoadDecision {
    // Without an oracle the node owns everything it holds.
    let role = if query.cache_mode.uses_oracle() {
        query.role
    } else {
        OwnershipRole::Primary
    };
    let transactional = query.transactional;

    match query.load_type {
        LoadType::DontLoad => LoadDecision::NONE,

        LoadType::Primary if !transactional => match role {
            OwnershipRole::Primary => LoadDecision::load(LoadSource::Local),
            OwnershipRole::Backup | OwnershipRole::NotOwner => LoadDecision::NONE,
        },

        LoadType::Primary => match (query.originator, role) {
            (true, OwnershipRole::Primary) => LoadDecision::load(LoadSource::Local),
            (true, _) => LoadDecision::load(LoadSource::RemotePrimary),
            (false, OwnershipRole::Primary) => LoadDecision::write_skew_only(),
            (false, _) => LoadDecision::NONE,
        },

        LoadType::Owner => match role {
            OwnershipRole::Primary if transactional && !query.originator => {
                LoadDecision::load(LoadSource::Local).with_write_skew()
            }
            OwnershipRole::Primary | OwnershipRole::Backup => {
                LoadDecision::load(LoadSource::Local)
            }
            OwnershipRole::NotOwner if transactional && query.originator => {
                LoadDecision::load(LoadSource::RemoteAll)
            }
            OwnershipRole::NotOwner => LoadDecision::NONE,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLES: [OwnershipRole; 3] = [
        OwnershipRole::Primary,
        OwnershipRole::Backup,
        OwnershipRole::NotOwner,
    ];

    fn query(
        load_type: LoadType,
        transactional: bool,
        role: OwnershipRole,
        originator: bool,
    ) -> LoadQuery {
        LoadQuery {
            load_type,
            cache_mode: CacheMode::DistSync,
            transactional,
            role,
            originator,
        }
    }

    #[test]
    fn test_dont_load_never_touches_storage() {
        for role in ROLES {
            for tx in [false, true] {
                for originator in [false, true] {
                    let decision = resolve(&query(LoadType::DontLoad, tx, role, originator));
                    assert!(!decision.touches_storage());
                }
            }
        }
    }

    #[test]
    fn test_primary_non_tx_only_primary_loads() {
        for originator in [false, true] {
            let primary = resolve(&query(LoadType::Primary, false, OwnershipRole::Primary, originator));
            assert!(primary.must_load);
            assert_eq!(primary.source, LoadSource::Local);

            for role in [OwnershipRole::Backup, OwnershipRole::NotOwner] {
                assert!(!resolve(&query(LoadType::Primary, false, role, originator)).must_load);
            }
        }
    }

    #[test]
    fn test_primary_tx_loads_at_originator() {
        let at_primary = resolve(&query(LoadType::Primary, true, OwnershipRole::Primary, true));
        assert_eq!(at_primary, LoadDecision::load(LoadSource::Local));

        let at_backup = resolve(&query(LoadType::Primary, true, OwnershipRole::Backup, true));
        assert_eq!(at_backup, LoadDecision::load(LoadSource::RemotePrimary));

        let at_non_owner = resolve(&query(LoadType::Primary, true, OwnershipRole::NotOwner, true));
        assert_eq!(at_non_owner.source, LoadSource::RemotePrimary);
    }

    #[test]
    fn test_primary_tx_owner_side_checks_write_skew_only() {
        let primary = resolve(&query(LoadType::Primary, true, OwnershipRole::Primary, false));
        assert!(!primary.must_load);
        assert!(primary.verify_write_skew);

        let backup = resolve(&query(LoadType::Primary, true, OwnershipRole::Backup, false));
        assert!(!backup.touches_storage());
    }

    #[test]
    fn test_owner_every_owner_loads_locally() {
        for tx in [false, true] {
            for role in [OwnershipRole::Primary, OwnershipRole::Backup] {
                let decision = resolve(&query(LoadType::Owner, tx, role, false));
                assert!(decision.must_load);
                assert_eq!(decision.source, LoadSource::Local);
            }
        }
    }

    #[test]
    fn test_non_owner_relays_never_load() {
        for load_type in [LoadType::DontLoad, LoadType::Primary, LoadType::Owner] {
            for tx in [false, true] {
                let decision = resolve(&query(load_type, tx, OwnershipRole::NotOwner, false));
                assert!(!decision.must_load);
            }
        }
        let non_tx_originator = resolve(&query(LoadType::Owner, false, OwnershipRole::NotOwner, true));
        assert!(!non_tx_originator.must_load);
    }

    #[test]
    fn test_owner_tx_non_owner_originator_fetches_from_any_owner() {
        let decision = resolve(&query(LoadType::Owner, true, OwnershipRole::NotOwner, true));
        assert_eq!(decision, LoadDecision::load(LoadSource::RemoteAll));
    }

    #[test]
    fn test_local_modes_treat_node_as_primary() {
        for mode in [CacheMode::Local, CacheMode::InvalidationSync, CacheMode::InvalidationAsync] {
            let decision = resolve(&LoadQuery {
                load_type: LoadType::Primary,
                cache_mode: mode,
                transactional: false,
                role: OwnershipRole::NotOwner,
                originator: true,
            });
            assert_eq!(decision, LoadDecision::load(LoadSource::Local));
        }
    }

    #[test]
    fn test_resolve_is_pure() {
        let q = query(LoadType::Owner, true, OwnershipRole::Backup, true);
        assert_eq!(resolve(&q), resolve(&q));
    }
}
