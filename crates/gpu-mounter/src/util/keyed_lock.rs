//! Per-key async mutex, used to keep one mutating request per consumer pod.
//!
//! Entries are held weakly and dropped together with the last guard, so the
//! map only ever contains keys with a request in flight.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Held while a key is locked.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // only `self.lock` left means nobody holds or waits for the key
        if Arc::strong_count(&self.lock) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits until no other guard for `key` is alive.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let lock = self.lock_for(key);
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            lock,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(lock) = occupied.get().upgrade() {
                    return lock;
                }
                let lock = Arc::new(Mutex::new(()));
                occupied.insert(Arc::downgrade(&lock));
                lock
            }
            Entry::Vacant(vacant) => {
                let lock = Arc::new(Mutex::new(()));
                vacant.insert(Arc::downgrade(&lock));
                lock
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::<(String, String)>::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let key = ("ns".to_string(), "p1".to_string());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_flight = Arc::clone(&in_flight);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedAsyncLock::<&str>::new();
        let _p1 = locks.lock(&"p1").await;

        let p2 = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"p2")).await;
        assert!(p2.is_ok(), "lock for another key must not wait");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_is_removed_with_last_guard() {
        let locks = KeyedAsyncLock::<u32>::new();
        {
            let _guard = locks.lock(&1).await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }
}
