//! Keyed async locks.
//!
//! Hands out one `tokio::sync::Mutex` per key. Used to serialize pushes of
//! the same (secret, rule, destination) triple and writes to the same
//! (store, remote key).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

/// Lock a std mutex, recovering the data if a panicking task poisoned it
///
/// Guards are never held across an await, and every critical section
/// leaves the data consistent, so a poisoned lock is still usable.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the lock for `key`
    pub fn get(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = lock(&self.locks);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drop locks nobody holds any more for keys matching `predicate`
    pub fn prune(&self, predicate: impl Fn(&K) -> bool) {
        let mut locks = lock(&self.locks);
        locks.retain(|key, held| !(predicate(key) && Arc::strong_count(held) == 1));
    }

    /// Drop the lock for `key` unless someone else still holds or waits on it
    pub fn release(&self, key: &K) {
        self.prune(|candidate| candidate == key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_same_lock() {
        let locks: KeyedLocks<String> = KeyedLocks::new();
        let a = locks.get(&"k".to_string());
        let b = locks.get(&"k".to_string());
        assert!(Arc::ptr_eq(&a, &b));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(locks.get(&"other".to_string()).try_lock().is_ok());
    }

    #[test]
    fn test_prune_keeps_held_locks() {
        let locks: KeyedLocks<u32> = KeyedLocks::new();
        let held = locks.get(&1);
        let _ = locks.get(&2);
        locks.prune(|_| true);
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune(|_| true);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_waits_for_other_holders() {
        let locks: KeyedLocks<u32> = KeyedLocks::new();
        let first = locks.get(&7);
        let second = locks.get(&7);
        drop(first);
        locks.release(&7);
        assert_eq!(locks.len(), 1);
        drop(second);
        locks.release(&7);
        assert!(locks.is_empty());
    }
}
