//! Local in-memory caches
//!
//! Hot counters and resolved config lookups are kept in process to avoid a
//! store round-trip per read.
//!
//! # Features
//!
//! - LRU eviction when at capacity
//! - TTL-based expiration for freshness
//! - Thread-safe with a `parking_lot` mutex
//! - Write generation so readers never put back a value that a concurrent
//!   write or invalidation replaced
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_store::cache::LocalCounterCache;
//!
//! let cache = LocalCounterCache::new(10_000, 60_000); // 10k counters, 60s TTL
//! cache.put(key.clone(), counter);
//! assert!(cache.get(&key).is_some());
//! ```

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::counter::{Counter, CounterKey};
use crate::engine::traits::{CacheStats, CounterCache};
use crate::metrics;

/// Cached entry with TTL tracking
#[derive(Clone, Debug)]
pub struct CachedEntry<T: Clone> {
    /// The cached data
    pub data: T,
    /// Timestamp when cached (milliseconds since epoch)
    cached_at: i64,
    /// Time-to-live in milliseconds
    ttl_ms: i64,
}

impl<T: Clone> CachedEntry<T> {
    /// Create a new cached entry
    pub fn new(data: T, ttl_ms: i64) -> Self {
        Self {
            data,
            cached_at: Utc::now().timestamp_millis(),
            ttl_ms,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() - self.cached_at > self.ttl_ms
    }

    /// Remaining TTL in milliseconds (0 if expired)
    pub fn remaining_ttl_ms(&self) -> i64 {
        let elapsed = Utc::now().timestamp_millis() - self.cached_at;
        (self.ttl_ms - elapsed).max(0)
    }
}

/// LRU cache whose entries also expire after a TTL
pub struct TtlLruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    entries: Mutex<LruCache<K, CachedEntry<V>>>,
    default_ttl_ms: i64,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `max_entries` (at least one)
    pub fn new(max_entries: usize, default_ttl_ms: i64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl_ms,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`; expired entries are dropped on access
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let lookup = entries
            .get(key)
            .map(|entry| (!entry.is_expired()).then(|| entry.data.clone()));
        let fresh = match lookup {
            Some(Some(data)) => Some(data),
            Some(None) => {
                entries.pop(key);
                None
            },
            None => None,
        };
        drop(entries);

        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    /// Insert with the default TTL
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl_ms);
    }

    /// Insert with an explicit TTL
    pub fn insert_with_ttl(&self, key: K, value: V, ttl_ms: i64) {
        let mut entries = self.entries.lock();
        self.push(&mut entries, key, value, ttl_ms);
    }

    /// Counter bumped by every insert and removal
    ///
    /// Read it before loading a value from the backing store, then populate
    /// with [`insert_if_unchanged`](Self::insert_if_unchanged).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert only when nothing was written or removed since `generation`
    pub fn insert_if_unchanged(&self, key: K, value: V, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.push(&mut entries, key, value, self.default_ttl_ms);
        true
    }

    fn push(&self, entries: &mut LruCache<K, CachedEntry<V>>, key: K, value: V, ttl_ms: i64) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some((evicted, _)) = entries.push(key.clone(), CachedEntry::new(value, ttl_ms)) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove one entry
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.pop(key).map(|e| e.data)
    }

    /// Remove every entry whose key matches
    pub fn remove_where<F: Fn(&K) -> bool>(&self, predicate: F) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// Number of entries, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

// =============================================================================
// Counter Cache
// =============================================================================

/// LRU + TTL [`CounterCache`]
pub struct LocalCounterCache {
    inner: TtlLruCache<CounterKey, Counter>,
}

impl LocalCounterCache {
    /// Create a counter cache
    pub fn new(max_entries: usize, ttl_ms: i64) -> Self {
        Self {
            inner: TtlLruCache::new(max_entries, ttl_ms),
        }
    }
}

impl CounterCache for LocalCounterCache {
    fn get(&self, key: &CounterKey) -> Option<Counter> {
        let found = self.inner.get(key);
        metrics::record_counter_cache(found.is_some());
        found
    }

    fn put(&self, key: CounterKey, counter: Counter) {
        self.inner.insert(key, counter);
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }

    fn put_if_unchanged(&self, key: CounterKey, counter: Counter, generation: u64) -> bool {
        self.inner.insert_if_unchanged(key, counter, generation)
    }

    fn invalidate(&self, key: &CounterKey) {
        self.inner.remove(key);
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
