//! Keyed async mutual exclusion.
//!
//! Used for per-thread classification passes, per-model training and
//! per-model metrics updates. Multi-key acquisition takes keys in sorted
//! order so two passes over overlapping threads cannot deadlock.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A lazily-populated map of async mutexes.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Ord + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        // Drop entries nobody holds or waits on.
        if locks.len() > 1024 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the lock on one key.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Take the lock only if it is free.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Wait for the locks on all keys, in sorted order.
    pub async fn lock_all<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<OwnedMutexGuard<()>>
    where
        K: 'a,
    {
        let sorted: BTreeSet<&K> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys with an allocated lock.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_lock_is_exclusive_per_key() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let guard = locks.try_lock(&"a".to_string());
        assert!(guard.is_some());
        assert!(locks.try_lock(&"a".to_string()).is_none());
        assert!(locks.try_lock(&"b".to_string()).is_some());

        drop(guard);
        assert!(locks.try_lock(&"a".to_string()).is_some());
    }

    #[tokio::test]
    async fn test_lock_all_deduplicates_and_orders() {
        let locks: Arc<KeyedLocks<u32>> = Arc::new(KeyedLocks::new());
        let keys = [3, 1, 2, 1];
        let guards = locks.lock_all(keys.iter()).await;
        assert_eq!(guards.len(), 3);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock_all([2, 3].iter()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }
}
