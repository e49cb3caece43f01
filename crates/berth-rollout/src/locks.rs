//! Per-namespace mutual exclusion for the Executing stage.
//!
//! At most one request may execute against a given cluster/namespace at a
//! time. The guard is held from the moment a request commits `Executing`
//! until it completes, fails or is cancelled. A slot is dropped from the
//! table once its last guard is released and nobody is waiting on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (String, String);
type Slot = Arc<AsyncMutex<()>>;
type SlotTable = Arc<Mutex<HashMap<Key, Slot>>>;

fn lock(table: &SlotTable) -> MutexGuard<'_, HashMap<Key, Slot>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while a request owns its namespace.
#[derive(Debug)]
pub struct NamespaceGuard {
    key: Key,
    slot: Slot,
    table: SlotTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NamespaceGuard {
    pub fn cluster(&self) -> &str {
        &self.key.0
    }

    pub fn namespace(&self) -> &str {
        &self.key.1
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        let mut slots = lock(&self.table);
        drop(self.guard.take());
        // Only the table and this guard still reference the slot.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}

#[derive(Debug, Default)]
pub struct NamespaceLocks {
    slots: SlotTable,
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, cluster: &str, namespace: &str) -> (Key, Slot) {
        let key = (cluster.to_string(), namespace.to_string());
        let slot = lock(&self.slots).entry(key.clone()).or_default().clone();
        (key, slot)
    }

    fn guard(&self, key: Key, slot: Slot, guard: OwnedMutexGuard<()>) -> NamespaceGuard {
        NamespaceGuard {
            key,
            slot,
            table: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Wait until the namespace is free.
    pub async fn acquire(&self, cluster: &str, namespace: &str) -> NamespaceGuard {
        let (key, slot) = self.slot(cluster, namespace);
        let guard = Arc::clone(&slot).lock_owned().await;
        self.guard(key, slot, guard)
    }

    /// Take the namespace if nobody holds it.
    pub fn try_acquire(&self, cluster: &str, namespace: &str) -> Option<NamespaceGuard> {
        let (key, slot) = self.slot(cluster, namespace);
        match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => Some(self.guard(key, slot, guard)),
            Err(_) => {
                self.discard_if_idle(&key, slot);
                None
            }
        }
    }

    /// Namespaces with a holder or a waiter.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a slot fetched for a failed attempt if the holder let go meanwhile.
    fn discard_if_idle(&self, key: &Key, slot: Slot) {
        let mut slots = lock(&self.slots);
        if Arc::strong_count(&slot) == 2 && slot.try_lock().is_ok() {
            slots.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_namespace_is_exclusive() {
        let locks = NamespaceLocks::new();
        let held = locks.acquire("stg", "voice-staging").await;
        assert!(locks.try_acquire("stg", "voice-staging").is_none());
        assert!(locks.try_acquire("stg", "other-staging").is_some());
        assert!(locks.try_acquire("prd", "voice-staging").is_some());
        drop(held);
        assert!(locks.try_acquire("stg", "voice-staging").is_some());
    }

    #[tokio::test]
    async fn test_guard_reports_key() {
        let locks = NamespaceLocks::new();
        let guard = locks.acquire("dev", "voice-development").await;
        assert_eq!(guard.cluster(), "dev");
        assert_eq!(guard.namespace(), "voice-development");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(NamespaceLocks::new());
        let first = locks.acquire("stg", "ns").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("stg", "ns").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_released_slots_are_dropped() {
        let locks = NamespaceLocks::new();
        let a = locks.acquire("stg", "a").await;
        let b = locks.try_acquire("stg", "b").unwrap();
        assert_eq!(locks.len(), 2);

        assert!(locks.try_acquire("stg", "a").is_none());
        assert_eq!(locks.len(), 2);

        drop(a);
        assert_eq!(locks.len(), 1);
        drop(b);
        assert!(locks.is_empty());
    }
}
