use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-content-hash mutual exclusion between writes and purges on one node.
/// Entries disappear once no guard or waiter references them.
#[derive(Default)]
pub struct ObjectLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, sha512: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);

            match locks.get(sha512).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    locks.insert(sha512.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };

        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_hash_is_exclusive() {
        let locks = Arc::new(ObjectLocks::new());
        let guard = locks.lock("abc").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("abc").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // other hashes are independent
        let _other = locks.lock("def").await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_are_dropped() {
        let locks = ObjectLocks::new();
        {
            let _guard = locks.lock("abc").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
