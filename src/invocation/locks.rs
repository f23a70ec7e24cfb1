//! Per-key lock table.
//!
//! Each key maps to a `tokio::sync::Mutex`, whose waiters are granted in
//! FIFO order, so writers on a hot key cannot starve. Acquisition is bounded
//! by the configured timeout. Entries disappear from the table once nobody
//! holds or waits for them.
//!
//! Lock owners are invocation contexts (non-transactional writes on the
//! primary) or prepared transactions parked in [`PendingTransactions`],
//! which also remembers recently committed transactions so a resent COMMIT
//! is applied once.

use crate::commands::{Key, TxId};
use crate::core::error::{display_key, CacheError, CacheResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};

type LockSlot = Arc<KeyMutex<()>>;

struct LockTable {
    slots: Mutex<HashMap<Key, LockSlot>>,
}

impl LockTable {
    fn slot(&self, key: &Key) -> LockSlot {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyMutex::new(())))
            .clone()
    }

    fn forget_if_idle(&self, key: &[u8]) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }
}

/// Shared per-key lock table.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Arc::new(LockTable {
                slots: Mutex::new(HashMap::with_capacity(capacity)),
            }),
        }
    }

    /// Acquire the lock of `key`, waiting at most `timeout`.
    pub async fn acquire(&self, key: &Key, timeout: Duration) -> CacheResult<KeyLockGuard> {
        let slot = self.table.slot(key);

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                tracing::trace!(key = %display_key(key), "key lock acquired");
                Ok(KeyLockGuard {
                    key: key.clone(),
                    guard: Some(guard),
                    table: self.table.clone(),
                })
            }
            Err(_) => {
                self.table.forget_if_idle(key);
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(key = %display_key(key), timeout_ms, "key lock acquisition timed out");
                Err(CacheError::lock_timeout(key, timeout_ms))
            }
        }
    }

    /// Whether someone currently holds the lock of `key`.
    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.table
            .slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys with a holder or waiter.
    pub fn len(&self) -> usize {
        self.table.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("keys", &self.len()).finish()
    }
}

/// Held key lock; released on drop.
pub struct KeyLockGuard {
    key: Key,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl KeyLockGuard {
    pub fn key(&self) -> &Key {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.table.forget_if_idle(&self.key);
    }
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &display_key(&self.key))
            .finish()
    }
}

/// Committed transaction ids remembered per node.
const COMMITTED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct CommittedLog {
    order: VecDeque<TxId>,
    ids: HashSet<TxId>,
}

/// Locks held by prepared transactions until commit or rollback.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    prepared: Mutex<HashMap<TxId, Vec<KeyLockGuard>>>,
    committed: Mutex<CommittedLog>,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `tx_id` was applied here; false if it already was.
    pub fn mark_committed(&self, tx_id: &TxId) -> bool {
        let mut log = self.committed.lock();
        if !log.ids.insert(tx_id.clone()) {
            return false;
        }
        log.order.push_back(tx_id.clone());
        if log.order.len() > COMMITTED_CAPACITY {
            if let Some(oldest) = log.order.pop_front() {
                log.ids.remove(&oldest);
            }
        }
        true
    }

    pub fn is_committed(&self, tx_id: &TxId) -> bool {
        self.committed.lock().ids.contains(tx_id)
    }

    /// Park the locks taken while preparing `tx_id`.
    pub fn stash(&self, tx_id: TxId, guards: Vec<KeyLockGuard>) {
        self.prepared.lock().entry(tx_id).or_default().extend(guards);
    }

    /// Release every lock of `tx_id`; returns whether it was prepared here.
    pub fn release(&self, tx_id: &TxId) -> bool {
        let guards = self.prepared.lock().remove(tx_id);
        guards.is_some()
    }

    pub fn is_prepared(&self, tx_id: &TxId) -> bool {
        self.prepared.lock().contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.prepared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::topology::NodeId;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn key(s: &'static str) -> Key {
        Key::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_guard_releases_and_cleans_up() {
        let locks = LockManager::new(16);
        let guard = locks.acquire(&key("a"), Duration::from_secs(1)).await.unwrap();
        assert!(locks.is_locked(b"a"));
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(!locks.is_locked(b"a"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let locks = LockManager::new(16);
        let _held = locks.acquire(&key("a"), Duration::from_secs(1)).await.unwrap();

        let err = locks
            .acquire(&key("a"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { timeout_ms: 20, .. }));
        assert!(locks.is_locked(b"a"));
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = LockManager::new(16);
        let _a = locks.acquire(&key("a"), Duration::from_secs(1)).await.unwrap();
        let b = locks.acquire(&key("b"), Duration::from_millis(20)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_holders_never_overlap() {
        let locks = LockManager::new(16);
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key("hot"), Duration::from_secs(5)).await.unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst));
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.store(false, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_pending_transactions_hold_locks() {
        let locks = LockManager::new(16);
        let pending = PendingTransactions::new();
        let tx = TxId {
            origin: NodeId::from("a"),
            seq: 1,
        };

        let guard = locks.acquire(&key("k"), Duration::from_secs(1)).await.unwrap();
        pending.stash(tx.clone(), vec![guard]);
        assert!(pending.is_prepared(&tx));
        assert!(locks.is_locked(b"k"));

        assert!(pending.release(&tx));
        assert!(!locks.is_locked(b"k"));
        assert!(!pending.release(&tx));
    }

    #[test]
    fn test_committed_ids_are_remembered_once() {
        let pending = PendingTransactions::new();
        let tx = |seq| TxId {
            origin: NodeId::from("a"),
            seq,
        };

        assert!(pending.mark_committed(&tx(1)));
        assert!(!pending.mark_committed(&tx(1)));
        assert!(pending.is_committed(&tx(1)));

        for seq in 2..=(COMMITTED_CAPACITY as u64 + 1) {
            pending.mark_committed(&tx(seq));
        }
        assert!(!pending.is_committed(&tx(1)));
        assert!(pending.is_committed(&tx(2)));
    }
}
