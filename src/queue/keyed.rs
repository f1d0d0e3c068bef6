//! Per-key serialized execution
//!
//! Applies on the same counter partition must not interleave, while applies
//! on different partitions run concurrently. Each key maps to an async mutex
//! that is created on first use and dropped once nobody waits on it.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Runs futures one at a time per key
pub struct KeyedExecutionQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for KeyedExecutionQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K> KeyedExecutionQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` after every earlier future submitted under `key` finished
    pub async fn exec<F, T>(&self, key: K, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let result = {
            let _guard = lock.lock().await;
            fut.await
        };

        // One reference in the map, one held here
        drop(lock);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of keys with queued or running work
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_never_overlaps() {
        let queue = Arc::new(KeyedExecutionQueue::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                queue
                    .exec("volume/merchant=1".to_string(), async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let queue = Arc::new(KeyedExecutionQueue::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                queue
                    .exec(i, async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_returns_future_output() {
        let queue = KeyedExecutionQueue::new();
        let value = queue.exec("k", async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(queue.active_keys(), 0);
    }
}
