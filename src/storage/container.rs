//! Node-local versioned data container.
//!
//! Every committed write bumps the key's version; removals keep a tombstone
//! so the version keeps increasing across delete/re-create cycles and
//! write-skew checks cannot be fooled by an ABA sequence.
//!
//! Access paths are counted separately so the pipeline's load behaviour is
//! observable: `load` is the load step, `version_of` is the write-skew
//! check, and `serve_remote` answers another node's remote load.

use crate::commands::{Key, Value};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored value with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    value: Option<Value>,
    version: u64,
}

/// Access counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    /// Load-step reads.
    pub loads: u64,
    /// Write-skew version checks.
    pub version_checks: u64,
    /// Reads served to other nodes.
    pub remote_reads: u64,
    /// Committed writes (including removals).
    pub writes: u64,
    /// Live entries.
    pub entries: usize,
}

/// In-memory versioned key-value store.
pub struct DataContainer {
    slots: RwLock<HashMap<Key, Slot>>,
    loads: AtomicU64,
    version_checks: AtomicU64,
    remote_reads: AtomicU64,
    writes: AtomicU64,
}

impl DataContainer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::with_capacity(capacity)),
            loads: AtomicU64::new(0),
            version_checks: AtomicU64::new(0),
            remote_reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Read a key for the load step.
    pub fn load(&self, key: &[u8]) -> Option<VersionedValue> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.read(key)
    }

    /// Read a key on behalf of another node.
    pub fn serve_remote(&self, key: &[u8]) -> Option<VersionedValue> {
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        self.read(key)
    }

    /// Current version of a key for the write-skew check; `None` if absent.
    pub fn version_of(&self, key: &[u8]) -> Option<u64> {
        self.version_checks.fetch_add(1, Ordering::Relaxed);
        self.slots
            .read()
            .get(key)
            .filter(|slot| slot.value.is_some())
            .map(|slot| slot.version)
    }

    /// Uncounted read for inspection.
    pub fn peek(&self, key: &[u8]) -> Option<VersionedValue> {
        self.read(key)
    }

    fn read(&self, key: &[u8]) -> Option<VersionedValue> {
        let slots = self.slots.read();
        let slot = slots.get(key)?;
        slot.value.as_ref().map(|value| VersionedValue {
            value: value.clone(),
            version: slot.version,
        })
    }

    /// Store or remove a key and return the version it now has.
    ///
    /// `pinned` forces the version chosen by the primary owner. A pinned
    /// write older than the stored version arrived out of order and is
    /// dropped; the stored version is returned unchanged.
    pub fn commit(&self, key: Key, value: Option<Value>, pinned: Option<u64>) -> u64 {
        let mut slots = self.slots.write();
        let current = slots.get(&key).map(|slot| slot.version).unwrap_or(0);
        let version = match pinned {
            Some(pinned) if pinned < current => return current,
            Some(pinned) => pinned,
            None => current + 1,
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        slots.insert(key, Slot { value, version });
        version
    }

    /// Drop the values of `keys` without bumping their versions, as
    /// invalidation does. The tombstones stay.
    pub fn invalidate(&self, keys: &[Key]) -> usize {
        let mut slots = self.slots.write();
        let mut dropped = 0;
        for key in keys {
            if let Some(slot) = slots.get_mut(&key[..]) {
                if slot.value.take().is_some() {
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            loads: self.loads.load(Ordering::Relaxed),
            version_checks: self.version_checks.load(Ordering::Relaxed),
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for DataContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &'static str) -> Key {
        Key::from_static(s.as_bytes())
    }

    #[test]
    fn test_commit_bumps_version() {
        let container = DataContainer::new();
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"1")), None), 1);
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"2")), None), 2);

        let stored = container.peek(b"a").unwrap();
        assert_eq!(stored.value, Value::from_static(b"2"));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_removal_keeps_version_monotonic() {
        let container = DataContainer::new();
        container.commit(key("a"), Some(Value::from_static(b"1")), None);
        assert_eq!(container.commit(key("a"), None, None), 2);
        assert!(container.peek(b"a").is_none());
        assert_eq!(container.version_of(b"a"), None);
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"x")), None), 3);
    }

    #[test]
    fn test_pinned_version_never_goes_back() {
        let container = DataContainer::new();
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"1")), Some(7)), 7);
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"2")), Some(7)), 7);
        assert_eq!(container.peek(b"a").unwrap().value, Value::from_static(b"2"));
    }

    #[test]
    fn test_late_pinned_write_is_dropped() {
        let container = DataContainer::new();
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"new")), Some(2)), 2);
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"old")), Some(1)), 2);
        assert_eq!(container.commit(key("a"), None, Some(1)), 2);

        let stored = container.peek(b"a").unwrap();
        assert_eq!(stored.value, Value::from_static(b"new"));
        assert_eq!(stored.version, 2);
        assert_eq!(container.stats().writes, 1);
    }

    #[test]
    fn test_invalidation_keeps_version_tombstone() {
        let container = DataContainer::new();
        container.commit(key("a"), Some(Value::from_static(b"1")), None);
        container.commit(key("a"), Some(Value::from_static(b"2")), None);

        container.invalidate(&[key("a")]);
        assert!(container.peek(b"a").is_none());
        assert_eq!(container.version_of(b"a"), None);
        assert_eq!(container.commit(key("a"), Some(Value::from_static(b"3")), None), 3);
    }

    #[test]
    fn test_access_paths_are_counted_separately() {
        let container = DataContainer::new();
        container.commit(key("a"), Some(Value::from_static(b"1")), None);

        container.load(b"a");
        container.load(b"missing");
        container.version_of(b"a");
        container.serve_remote(b"a");
        container.peek(b"a");

        let stats = container.stats();
        assert_eq!(stats.loads, 2);
        assert_eq!(stats.version_checks, 1);
        assert_eq!(stats.remote_reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let container = DataContainer::new();
        container.commit(key("a"), Some(Value::from_static(b"1")), None);
        container.commit(key("b"), Some(Value::from_static(b"2")), None);

        assert_eq!(container.invalidate(&[key("a"), key("zzz")]), 1);
        assert_eq!(container.len(), 1);
        assert_eq!(container.invalidate(&[key("a")]), 0);

        container.clear();
        assert!(container.is_empty());
    }
}
