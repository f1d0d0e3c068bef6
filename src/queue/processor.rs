//! Recording and applying counter events
//!
//! Recording an event writes the event itself plus one queue row per
//! partition present in its context and one aggregate row, all inside the
//! caller's transaction. Each row is applied independently on the node
//! owning its shard:
//!
//! ```text
//!   PENDING --apply--> APPLIED   (row deleted with the counter updates)
//!      |  \--error---> RETRY     (failure_count + 1, next_retry_at pushed out)
//!      \--not local--> ABANDONED (left for the shard owner)
//! ```
//!
//! The apply deletes its queue row before touching any counter. A second
//! delivery of the same row deletes nothing and becomes a no-op, which turns
//! at-least-once delivery into effectively-once application.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::config::QueueConfig;
use crate::context::Context;
use crate::counter::{Counter, CounterKey};
use crate::definition::{CounterDef, DefinitionRegistry};
use crate::engine::retry_on_conflict;
use crate::engine::traits::{ClusterRouter, CounterCache, Persistence, Routed, ShardTask, Transaction};
use crate::error::{Error, Result, ValidationError};
use crate::metrics::{self, outcome};
use crate::queue::backoff::{self, BackoffStrategy};
use crate::queue::event::{ApplyOutcome, CounterEvent, EventKind, PartitionKey, QueuedCounterEvent};
use crate::queue::keyed::KeyedExecutionQueue;
use crate::types::{now_millis, SequenceNumber, Timestamp};

/// Queues counter events and applies queued rows
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<dyn Persistence>,
    router: Arc<dyn ClusterRouter>,
    cache: Arc<dyn CounterCache>,
    definitions: Arc<DefinitionRegistry>,
    keyed: Arc<KeyedExecutionQueue<(String, String)>>,
    backoff: Arc<dyn BackoffStrategy>,
    batch_size: usize,
    conflict_retries: u32,
}

impl EventProcessor {
    /// Create a processor
    pub fn new(
        store: Arc<dyn Persistence>,
        router: Arc<dyn ClusterRouter>,
        cache: Arc<dyn CounterCache>,
        definitions: Arc<DefinitionRegistry>,
        config: &QueueConfig,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            router,
            cache,
            definitions,
            keyed: Arc::new(KeyedExecutionQueue::new()),
            backoff: Arc::from(backoff::from_config(&config.backoff)),
            batch_size: config.batch_size.max(1),
            conflict_retries: conflict_retries.max(1),
        }
    }

    /// Replace the retry delay strategy
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Maximum rows returned by [`pending`](Self::pending)
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Record `event` and its queue rows inside `tx`
    ///
    /// Returns the sequence numbers of the inserted rows, aggregate row last.
    pub async fn queue_event(
        &self,
        tx: &mut dyn Transaction,
        event: CounterEvent,
    ) -> Result<Vec<SequenceNumber>> {
        let def = self.definitions.counter(&event.counter_key)?;
        let context = Context::from_persisted(def.context_def(), &event.context)?;
        if !context.is_valid_for_query() {
            return Err(ValidationError::NotQueryable(context.to_string()).into());
        }

        let partitions: BTreeSet<PartitionKey> = def
            .templates()
            .iter()
            .filter_map(|template| partition_of(def, template, &context))
            .collect();

        let now = now_millis();
        let mut rows = Vec::with_capacity(partitions.len() + 1);
        for partition in partitions.into_iter().map(Some).chain(std::iter::once(None)) {
            let routing_key = QueuedCounterEvent::routing_key(def.key(), partition.as_ref());
            let shard = self.router.shard_for(&routing_key);
            let seq = tx
                .insert_queue_row(QueuedCounterEvent {
                    seq: 0,
                    event_id: event.event_id,
                    counter_key: def.key().to_string(),
                    partition,
                    shard,
                    failure_count: 0,
                    next_retry_at: now,
                })
                .await?;
            rows.push(seq);
        }

        tracing::debug!(
            counter = def.key(),
            event_id = %event.event_id,
            rows = rows.len(),
            "Counter event queued"
        );
        tx.put_event(event).await?;
        metrics::record_queued(def.key());
        Ok(rows)
    }

    /// Due rows on local shards and whether the batch came back full
    pub async fn pending(&self, now: Timestamp) -> Result<(Vec<QueuedCounterEvent>, bool)> {
        let shards = self.router.local_shards();
        if shards.is_empty() {
            return Ok((Vec::new(), false));
        }
        let mut tx = self.store.begin().await?;
        let rows = tx.due_queue_rows(&shards, now, self.batch_size).await;
        tx.rollback().await;
        let rows = rows?;

        metrics::record_batch(rows.len());
        let full = rows.len() >= self.batch_size;
        Ok((rows, full))
    }

    /// Apply one queue row on the node owning its shard
    pub async fn process_message(&self, row: QueuedCounterEvent) -> Result<ApplyOutcome> {
        let shard = row.shard;
        let counter = row.counter_key.clone();
        let seq = row.seq;

        let this = self.clone();
        let task: ShardTask = Box::pin(async move {
            let key = row.execution_key();
            let keyed = Arc::clone(&this.keyed);
            keyed.exec(key, this.apply(row)).await
        });

        match self.router.run_on_owner(shard, task).await {
            Routed::Ran(result) => result,
            Routed::NotLocal => {
                tracing::debug!(counter = %counter, shard, seq, "Shard moved, abandoning row");
                metrics::record_processed(&counter, outcome::ABANDONED);
                Ok(ApplyOutcome::Abandoned)
            },
        }
    }

    async fn apply(&self, row: QueuedCounterEvent) -> Result<ApplyOutcome> {
        let started = Instant::now();
        let result = retry_on_conflict(self.conflict_retries, || self.try_apply(&row)).await;

        let result = match result {
            Err(e) if e.is_conflict() => self.settle_conflict(&row, e).await,
            other => other,
        };

        match result {
            Ok(applied) => {
                let label = match applied {
                    ApplyOutcome::Applied { .. } => outcome::APPLIED,
                    _ => outcome::DUPLICATE,
                };
                metrics::record_processed(&row.counter_key, label);
                metrics::record_apply_duration(&row.counter_key, started.elapsed().as_secs_f64());
                Ok(applied)
            },
            Err(e) => {
                self.reschedule(&row, &e).await;
                metrics::record_processed(&row.counter_key, outcome::RETRIED);
                Err(e)
            },
        }
    }

    /// A conflict that outlived the retries counts as applied only when
    /// another attempt already deleted the row
    async fn settle_conflict(&self, row: &QueuedCounterEvent, cause: Error) -> Result<ApplyOutcome> {
        let mut tx = self.store.begin().await?;
        let deleted = tx.delete_queue_row(row.seq).await;
        tx.rollback().await;
        if deleted? == 0 {
            tracing::warn!(
                counter = %row.counter_key,
                seq = row.seq,
                error = %cause,
                "Conflict persisted across retries but row is gone, treating as applied"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        Err(cause)
    }

    async fn try_apply(&self, row: &QueuedCounterEvent) -> Result<ApplyOutcome> {
        let now = now_millis();
        let mut tx = self.store.begin().await?;
        match self.apply_in(tx.as_mut(), row, now).await {
            Ok(Some(updated)) => {
                let counters = updated.len();
                let cache = Arc::clone(&self.cache);
                tx.on_commit(Box::new(move || {
                    for (key, counter) in updated {
                        if counter.context().is_cacheable() {
                            cache.put(key, counter);
                        }
                    }
                }));
                tx.commit().await?;
                tracing::debug!(
                    counter = %row.counter_key,
                    seq = row.seq,
                    counters,
                    "Queue row applied"
                );
                Ok(ApplyOutcome::Applied { counters })
            },
            Ok(None) => {
                tx.rollback().await;
                tracing::debug!(counter = %row.counter_key, seq = row.seq, "Queue row already applied");
                Ok(ApplyOutcome::AlreadyApplied)
            },
            Err(e) => {
                tx.rollback().await;
                Err(e)
            },
        }
    }

    /// Counter updates for `row`, or `None` when the row is already gone
    async fn apply_in(
        &self,
        tx: &mut dyn Transaction,
        row: &QueuedCounterEvent,
        now: Timestamp,
    ) -> Result<Option<Vec<(CounterKey, Counter)>>> {
        if tx.delete_queue_row(row.seq).await? == 0 {
            return Ok(None);
        }

        let event = tx.load_event(&row.event_id).await?.ok_or_else(|| {
            Error::Apply(format!(
                "event {} referenced by queue row {} is missing",
                row.event_id, row.seq
            ))
        })?;
        let def = self.definitions.counter(&row.counter_key)?;
        let context = Context::from_persisted(def.context_def(), &event.context)?;

        // Templates differing only in dimensions the event lacks project onto
        // the same counter, which must still see the event once
        let mut seen = BTreeSet::new();
        let mut updated = Vec::new();
        for template in def.templates() {
            if partition_of(def, template, &context) != row.partition {
                continue;
            }
            let projected = context.project(template);
            for (index, window) in def.windows().iter().enumerate() {
                let key = CounterKey::new(def.key(), &projected, index);
                if !seen.insert(key.clone()) {
                    continue;
                }
                let mut counter = match tx.load_counter(&key).await? {
                    Some(state) => Counter::from_state(projected.clone(), *window, state),
                    None => Counter::new(projected.clone(), *window, now),
                };
                match event.kind {
                    EventKind::Increment => counter.increment(event.timestamp, event.delta, now),
                    EventKind::Decrement => counter.decrement(event.timestamp, event.delta, now),
                };
                tx.put_counter(key.clone(), *counter.state()).await?;
                updated.push((key, counter));
            }
        }

        if tx.count_queue_rows(&event.event_id).await? == 0 {
            tx.delete_event(&event.event_id).await?;
        }
        Ok(Some(updated))
    }

    async fn reschedule(&self, row: &QueuedCounterEvent, cause: &Error) {
        let failure_count = row.failure_count.saturating_add(1);
        let delay = self.backoff.next_retry_delay(failure_count);
        let next_retry_at = now_millis().saturating_add(delay.as_millis() as i64);

        tracing::warn!(
            counter = %row.counter_key,
            shard = row.shard,
            seq = row.seq,
            failure_count,
            retry_in_ms = delay.as_millis() as u64,
            error = %cause,
            "Apply failed, rescheduling row"
        );

        let rescheduled = async {
            let mut tx = self.store.begin().await?;
            tx.reschedule_queue_row(row.seq, failure_count, next_retry_at)
                .await?;
            tx.commit().await?;
            Ok::<_, Error>(())
        };
        if let Err(e) = rescheduled.await {
            tracing::error!(
                counter = %row.counter_key,
                seq = row.seq,
                error = %e,
                "Failed to reschedule queue row"
            );
        }
    }
}

/// Partition whose queue row updates counters built from `template`
///
/// `None` when the template carries no partition dimension present in the
/// event's context; such counters are updated by the aggregate row.
fn partition_of(def: &CounterDef, template: &[String], context: &Context) -> Option<PartitionKey> {
    def.partition_dimensions()
        .iter()
        .filter(|d| template.contains(d))
        .find_map(|d| context.get(d))
        .map(|dim| PartitionKey {
            dimension: dim.key().to_string(),
            value: dim.to_string_value(),
        })
}
