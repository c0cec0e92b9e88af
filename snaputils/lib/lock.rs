//! A table of async mutexes addressed by string key.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands out one async lock per key so that work on different keys never contends.
///
/// Entries are dropped from the table as soon as no guard or waiter refers to them.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Guard returned by [`KeyedMutex::lock`]. The key is released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KeyedMutex {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting for any current holder to release it.
    pub async fn lock(&self, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let lock = self.entry(&key);
        let guard = lock.lock_owned().await;

        KeyedGuard { key, _guard: guard }
    }

    /// Number of keys that are currently held or waited on.
    pub fn len(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, weak| weak.strong_count() > 0);
        locks.len()
    }

    /// Returns `true` if no key is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, weak| weak.strong_count() > 0);

        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }
}

impl KeyedGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let table = Arc::new(KeyedMutex::new());
        let guard = table.lock("snap-1").await;
        assert_eq!(guard.key(), "snap-1");

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let _guard = table.lock("snap-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let table = KeyedMutex::new();
        let _a = table.lock("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), table.lock("b"))
            .await
            .expect("lock on a different key must not block");
        assert_eq!(table.len(), 2);
    }
}
