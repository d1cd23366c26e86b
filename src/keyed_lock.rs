//! Lazily instantiated per-key async mutexes, guarded by a coarse
//! mutex on the map itself. Mirrors the upstream `defaultdict(Semaphore)`
//! pattern used for per-volume and per-content-key serialization.
//! Entries are never pruned; for the small, bounded set of distinct
//! volume ids and content keys a node plugin ever sees, leaking them
//! is acceptable (§9).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as SyncMutex};

use tokio::sync::Mutex as AsyncMutex;

pub struct KeyedLocks<K> {
    locks: SyncMutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the mutex for `key`, creating it on first use.
    pub fn get(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_returns_same_mutex() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let a = locks.get(&"v1".to_string());
        let b = locks.get(&"v1".to_string());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_keys_serialize_independently() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let guard_a = locks.get(&"a".to_string()).lock_owned().await;
        let guard_b = locks.get(&"b".to_string()).try_lock_owned();
        assert!(guard_b.is_ok());
        drop(guard_a);
    }
}
