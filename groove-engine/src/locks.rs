//! Per-key async mutexes
//!
//! Writers of the same key queue behind each other; writers of different
//! keys never wait on each other. Lock several keys through [`KeyedLocks::lock_all`]
//! so every caller takes them in the same order.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to `key` until the guard drops
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Lock every distinct key, in ascending key order
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = K>) -> Vec<OwnedMutexGuard<()>>
    where
        K: Ord,
    {
        let ordered: BTreeSet<K> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.lock(key).await);
        }
        guards
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_all_dedups_keys() {
        let locks = KeyedLocks::new();
        let guards = locks.lock_all([3u32, 1, 3, 2]).await;
        assert_eq!(guards.len(), 3);
    }

    #[tokio::test]
    async fn overlapping_lock_all_waits_for_release() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock_all([1u32, 2]).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock_all([2u32, 3]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.lock(4))
                .await
                .is_ok()
        );

        drop(held);
        contender.await.unwrap();
    }
}
