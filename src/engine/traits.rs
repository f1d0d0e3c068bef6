//! Core trait definitions for pluggable collaborators
//!
//! The engine consumes persistence, cluster routing, and counter caching only
//! through these traits. In-memory implementations live in
//! [`crate::engine::memory`], [`crate::cluster`], and [`crate::cache`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::PersistedContext;
use crate::counter::{Counter, CounterKey, CounterState};
use crate::error::{Result, StoreError};
use crate::queue::{ApplyOutcome, CounterEvent, QueuedCounterEvent};
use crate::types::{EventId, SequenceNumber, ShardId, Timestamp};
use crate::value::PersistedValue;

// =============================================================================
// Persistence
// =============================================================================

/// A stored config override
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    /// Context the override applies to
    pub context: PersistedContext,
    /// One value for scalar entries, the members for set-valued ones
    pub values: Vec<PersistedValue>,
}

/// Entry point to the relational store
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Unique identifier for this provider
    fn provider_id(&self) -> &str;

    /// Open an optimistic transaction
    async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, StoreError>;
}

/// Transaction-scoped read/write contract
///
/// Reads record the versions they observed; `commit` fails with
/// [`StoreError::Conflict`] when any of them changed. Deletes report the
/// number of affected rows so callers can detect work already done.
#[async_trait]
pub trait Transaction: Send {
    /// All overrides stored for a config key
    async fn scan_config(&mut self, config_key: &str)
        -> std::result::Result<Vec<ConfigRow>, StoreError>;

    /// Insert or replace an override
    async fn put_config(&mut self, config_key: &str, row: ConfigRow)
        -> std::result::Result<(), StoreError>;

    /// Delete an override; returns rows deleted
    async fn delete_config(
        &mut self,
        config_key: &str,
        context: &PersistedContext,
    ) -> std::result::Result<u64, StoreError>;

    /// Load a counter's state
    async fn load_counter(
        &mut self,
        key: &CounterKey,
    ) -> std::result::Result<Option<CounterState>, StoreError>;

    /// Insert or replace a counter's state
    async fn put_counter(
        &mut self,
        key: CounterKey,
        state: CounterState,
    ) -> std::result::Result<(), StoreError>;

    /// Record an event
    async fn put_event(&mut self, event: CounterEvent) -> std::result::Result<(), StoreError>;

    /// Load a recorded event
    async fn load_event(
        &mut self,
        event_id: &EventId,
    ) -> std::result::Result<Option<CounterEvent>, StoreError>;

    /// Delete a recorded event; returns rows deleted
    async fn delete_event(&mut self, event_id: &EventId) -> std::result::Result<u64, StoreError>;

    /// Insert a queue row; the store assigns and returns its sequence number
    async fn insert_queue_row(
        &mut self,
        row: QueuedCounterEvent,
    ) -> std::result::Result<SequenceNumber, StoreError>;

    /// Delete a queue row; returns rows deleted
    async fn delete_queue_row(&mut self, seq: SequenceNumber)
        -> std::result::Result<u64, StoreError>;

    /// Reschedule a queue row; returns rows updated
    async fn reschedule_queue_row(
        &mut self,
        seq: SequenceNumber,
        failure_count: u32,
        next_retry_at: Timestamp,
    ) -> std::result::Result<u64, StoreError>;

    /// Up to `limit` rows on `shards` due at `now`, ordered by
    /// `(next_retry_at, seq)`
    async fn due_queue_rows(
        &mut self,
        shards: &[ShardId],
        now: Timestamp,
        limit: usize,
    ) -> std::result::Result<Vec<QueuedCounterEvent>, StoreError>;

    /// Number of queue rows still referencing an event
    async fn count_queue_rows(&mut self, event_id: &EventId)
        -> std::result::Result<usize, StoreError>;

    /// Run `hook` after a successful commit
    fn on_commit(&mut self, hook: Box<dyn FnOnce() + Send>);

    /// Commit buffered writes and run on-commit hooks
    async fn commit(self: Box<Self>) -> std::result::Result<(), StoreError>;

    /// Discard buffered writes
    async fn rollback(self: Box<Self>);
}

// =============================================================================
// Cluster Routing
// =============================================================================

/// Work dispatched to the owner of a shard
pub type ShardTask = BoxFuture<'static, Result<ApplyOutcome>>;

/// Outcome of routing work to a shard owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed<T> {
    /// The task ran and produced a value
    Ran(T),
    /// The shard is owned elsewhere; the task was not run
    NotLocal,
}

/// Shard ownership and dispatch
#[async_trait]
pub trait ClusterRouter: Send + Sync + 'static {
    /// Shard owning `key`
    fn shard_for(&self, key: &str) -> ShardId;

    /// True when this node owns `shard`
    fn is_local(&self, shard: ShardId) -> bool;

    /// Shards owned by this node
    fn local_shards(&self) -> Vec<ShardId>;

    /// Run `task` on the node owning `shard`
    async fn run_on_owner(&self, shard: ShardId, task: ShardTask) -> Routed<Result<ApplyOutcome>>;
}

// =============================================================================
// Counter Cache
// =============================================================================

/// Cache statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries evicted for capacity
    pub evictions: u64,
    /// Entries currently cached
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache of hot counters, populated after commit
pub trait CounterCache: Send + Sync + 'static {
    /// Cached counter, if present and fresh
    fn get(&self, key: &CounterKey) -> Option<Counter>;

    /// Insert or replace a counter
    fn put(&self, key: CounterKey, counter: Counter);

    /// Write generation; read before loading a counter to cache it
    fn generation(&self) -> u64;

    /// Insert unless the cache was written or invalidated since
    /// `generation`; returns whether the counter was stored
    fn put_if_unchanged(&self, key: CounterKey, counter: Counter, generation: u64) -> bool;

    /// Drop a counter
    fn invalidate(&self, key: &CounterKey);

    /// Cache statistics
    fn stats(&self) -> CacheStats;
}
