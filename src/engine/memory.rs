//! In-memory persistence provider
//!
//! These implementations are intended for:
//! - **Unit testing** without an external database
//! - **Integration testing** of the event pipeline
//! - **Development and prototyping** of new definitions
//!
//! # Concurrency model
//!
//! Every row carries a version stamp taken from a store-wide counter. A
//! transaction records the version of every row it reads and buffers its
//! writes in an overlay. `commit` takes the write lock, re-checks every
//! recorded version, and fails with [`StoreError::Conflict`] if any row
//! changed. Deleted rows keep a tombstone so a delete followed by a re-insert
//! is still detected.
//!
//! Sequence numbers are handed out on insert and never reused, so a rolled
//! back transaction leaves a gap.
//!
//! # Warning
//!
//! **Not suitable for production use:** all data is lost on restart.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = InMemoryStore::new();
//! let mut tx = store.begin().await?;
//! tx.put_config("limit", row).await?;
//! tx.commit().await?;
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::PersistedContext;
use crate::counter::{CounterKey, CounterState};
use crate::engine::traits::{ConfigRow, Persistence, Transaction};
use crate::error::StoreError;
use crate::queue::{CounterEvent, QueuedCounterEvent};
use crate::types::{EventId, SequenceNumber, ShardId, Timestamp};

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug, Clone)]
struct Row<T> {
    version: u64,
    value: Option<T>,
}

type ConfigId = (String, PersistedContext);

#[derive(Debug, Clone, PartialEq, Eq)]
enum RowId {
    Config(ConfigId),
    ConfigKey(String),
    Counter(CounterKey),
    Event(EventId),
    Queue(SequenceNumber),
}

#[derive(Debug, Default)]
struct StoreState {
    configs: BTreeMap<ConfigId, Row<ConfigRow>>,
    config_keys: HashMap<String, u64>,
    counters: HashMap<CounterKey, Row<CounterState>>,
    events: HashMap<EventId, Row<CounterEvent>>,
    queue: BTreeMap<SequenceNumber, Row<QueuedCounterEvent>>,
    version: u64,
}

impl StoreState {
    fn version_of(&self, id: &RowId) -> u64 {
        match id {
            RowId::Config(key) => self.configs.get(key).map_or(0, |r| r.version),
            RowId::ConfigKey(key) => self.config_keys.get(key).copied().unwrap_or(0),
            RowId::Counter(key) => self.counters.get(key).map_or(0, |r| r.version),
            RowId::Event(id) => self.events.get(id).map_or(0, |r| r.version),
            RowId::Queue(seq) => self.queue.get(seq).map_or(0, |r| r.version),
        }
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Committed transactions
    pub commits: u64,
    /// Commits rejected by conflict detection
    pub conflicts: u64,
    /// Rolled back transactions
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<StoreState>,
    next_seq: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    rollbacks: AtomicU64,
    injected_failures: Mutex<Vec<StoreError>>,
}

// =============================================================================
// InMemoryStore
// =============================================================================

/// Optimistic, versioned in-memory store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `errors.len()` commits fail with the given errors, in
    /// order
    pub fn fail_next_commits(&self, errors: Vec<StoreError>) {
        let mut injected = self.inner.injected_failures.lock();
        injected.extend(errors.into_iter().rev());
    }

    /// Store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            commits: self.inner.commits.load(Ordering::Relaxed),
            conflicts: self.inner.conflicts.load(Ordering::Relaxed),
            rollbacks: self.inner.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Committed queue rows, in sequence order
    pub fn queue_rows(&self) -> Vec<QueuedCounterEvent> {
        let state = self.inner.state.read();
        state
            .queue
            .values()
            .filter_map(|r| r.value.clone())
            .collect()
    }

    /// Number of committed event records
    pub fn event_count(&self) -> usize {
        let state = self.inner.state.read();
        state.events.values().filter(|r| r.value.is_some()).count()
    }

    /// Committed state of a counter
    pub fn counter_state(&self, key: &CounterKey) -> Option<CounterState> {
        let state = self.inner.state.read();
        state.counters.get(key).and_then(|r| r.value)
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    fn provider_id(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            reads: Vec::new(),
            configs: BTreeMap::new(),
            counters: HashMap::new(),
            events: HashMap::new(),
            queue: BTreeMap::new(),
            hooks: Vec::new(),
        }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

struct MemoryTransaction {
    inner: Arc<Inner>,
    reads: Vec<(RowId, u64)>,
    configs: BTreeMap<ConfigId, Option<ConfigRow>>,
    counters: HashMap<CounterKey, Option<CounterState>>,
    events: HashMap<EventId, Option<CounterEvent>>,
    queue: BTreeMap<SequenceNumber, Option<QueuedCounterEvent>>,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl MemoryTransaction {
    fn record(&mut self, state: &StoreState, id: RowId) {
        let version = state.version_of(&id);
        self.reads.push((id, version));
    }

    /// Queue rows as seen by this transaction
    fn queue_view(&self) -> BTreeMap<SequenceNumber, QueuedCounterEvent> {
        let state = self.inner.state.read();
        let mut view = BTreeMap::new();
        for (seq, row) in &state.queue {
            if let Some(value) = &row.value {
                view.insert(*seq, value.clone());
            }
        }
        drop(state);
        for (seq, pending) in &self.queue {
            match pending {
                Some(row) => view.insert(*seq, row.clone()),
                None => view.remove(seq),
            };
        }
        view
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn scan_config(&mut self, config_key: &str) -> Result<Vec<ConfigRow>, StoreError> {
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        self.record(&state, RowId::ConfigKey(config_key.to_string()));

        let mut rows: BTreeMap<PersistedContext, ConfigRow> = state
            .configs
            .iter()
            .filter(|((key, _), _)| key == config_key)
            .filter_map(|((_, ctx), row)| row.value.clone().map(|v| (ctx.clone(), v)))
            .collect();
        drop(state);

        for ((key, ctx), pending) in &self.configs {
            if key != config_key {
                continue;
            }
            match pending {
                Some(row) => rows.insert(ctx.clone(), row.clone()),
                None => rows.remove(ctx),
            };
        }
        Ok(rows.into_values().collect())
    }

    async fn put_config(&mut self, config_key: &str, row: ConfigRow) -> Result<(), StoreError> {
        self.configs
            .insert((config_key.to_string(), row.context.clone()), Some(row));
        Ok(())
    }

    async fn delete_config(
        &mut self,
        config_key: &str,
        context: &PersistedContext,
    ) -> Result<u64, StoreError> {
        let id = (config_key.to_string(), context.clone());
        let existed = match self.configs.get(&id) {
            Some(pending) => pending.is_some(),
            None => {
                let inner = Arc::clone(&self.inner);
                let state = inner.state.read();
                self.record(&state, RowId::Config(id.clone()));
                state.configs.get(&id).is_some_and(|r| r.value.is_some())
            },
        };
        self.configs.insert(id, None);
        Ok(u64::from(existed))
    }

    async fn load_counter(&mut self, key: &CounterKey) -> Result<Option<CounterState>, StoreError> {
        if let Some(pending) = self.counters.get(key) {
            return Ok(*pending);
        }
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        self.record(&state, RowId::Counter(key.clone()));
        Ok(state.counters.get(key).and_then(|r| r.value))
    }

    async fn put_counter(&mut self, key: CounterKey, state: CounterState) -> Result<(), StoreError> {
        self.counters.insert(key, Some(state));
        Ok(())
    }

    async fn put_event(&mut self, event: CounterEvent) -> Result<(), StoreError> {
        self.events.insert(event.event_id, Some(event));
        Ok(())
    }

    async fn load_event(&mut self, event_id: &EventId) -> Result<Option<CounterEvent>, StoreError> {
        if let Some(pending) = self.events.get(event_id) {
            return Ok(pending.clone());
        }
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        self.record(&state, RowId::Event(*event_id));
        Ok(state.events.get(event_id).and_then(|r| r.value.clone()))
    }

    async fn delete_event(&mut self, event_id: &EventId) -> Result<u64, StoreError> {
        let existed = self.load_event(event_id).await?.is_some();
        self.events.insert(*event_id, None);
        Ok(u64::from(existed))
    }

    async fn insert_queue_row(
        &mut self,
        mut row: QueuedCounterEvent,
    ) -> Result<SequenceNumber, StoreError> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        row.seq = seq;
        self.queue.insert(seq, Some(row));
        Ok(seq)
    }

    async fn delete_queue_row(&mut self, seq: SequenceNumber) -> Result<u64, StoreError> {
        let existed = match self.queue.get(&seq) {
            Some(pending) => pending.is_some(),
            None => {
                let inner = Arc::clone(&self.inner);
                let state = inner.state.read();
                self.record(&state, RowId::Queue(seq));
                state.queue.get(&seq).is_some_and(|r| r.value.is_some())
            },
        };
        if existed {
            self.queue.insert(seq, None);
        }
        Ok(u64::from(existed))
    }

    async fn reschedule_queue_row(
        &mut self,
        seq: SequenceNumber,
        failure_count: u32,
        next_retry_at: Timestamp,
    ) -> Result<u64, StoreError> {
        let current = match self.queue.get(&seq) {
            Some(pending) => pending.clone(),
            None => {
                let inner = Arc::clone(&self.inner);
                let state = inner.state.read();
                self.record(&state, RowId::Queue(seq));
                state.queue.get(&seq).and_then(|r| r.value.clone())
            },
        };
        let Some(mut row) = current else {
            return Ok(0);
        };
        row.failure_count = failure_count;
        row.next_retry_at = next_retry_at;
        self.queue.insert(seq, Some(row));
        Ok(1)
    }

    async fn due_queue_rows(
        &mut self,
        shards: &[ShardId],
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<QueuedCounterEvent>, StoreError> {
        let mut due: Vec<QueuedCounterEvent> = self
            .queue_view()
            .into_values()
            .filter(|row| row.next_retry_at <= now && shards.contains(&row.shard))
            .collect();
        due.sort_by_key(|row| (row.next_retry_at, row.seq));
        due.truncate(limit);
        Ok(due)
    }

    async fn count_queue_rows(&mut self, event_id: &EventId) -> Result<usize, StoreError> {
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        let shared: Vec<SequenceNumber> = state
            .queue
            .iter()
            .filter(|(_, r)| r.value.as_ref().is_some_and(|v| v.event_id == *event_id))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in shared {
            if !self.queue.contains_key(&seq) {
                self.record(&state, RowId::Queue(seq));
            }
        }
        drop(state);

        Ok(self
            .queue_view()
            .values()
            .filter(|row| row.event_id == *event_id)
            .count())
    }

    fn on_commit(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.hooks.push(hook);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if let Some(error) = this.inner.injected_failures.lock().pop() {
            this.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(error);
        }

        {
            let mut state = this.inner.state.write();
            for (id, seen) in &this.reads {
                let current = state.version_of(id);
                if current != *seen {
                    this.inner.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::Conflict(format!(
                        "{:?} changed (read version {}, now {})",
                        id, seen, current
                    )));
                }
            }

            for ((key, ctx), value) in this.configs {
                let version = state.next_version();
                state.config_keys.insert(key.clone(), version);
                state.configs.insert((key, ctx), Row { version, value });
            }
            for (key, value) in this.counters {
                let version = state.next_version();
                state.counters.insert(key, Row { version, value });
            }
            for (id, value) in this.events {
                let version = state.next_version();
                state.events.insert(id, Row { version, value });
            }
            for (seq, value) in this.queue {
                let version = state.next_version();
                state.queue.insert(seq, Row { version, value });
            }
        }

        this.inner.commits.fetch_add(1, Ordering::Relaxed);
        for hook in this.hooks {
            hook();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}
