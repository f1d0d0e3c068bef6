//! Counter event poller
//!
//! Periodically fetches due queue rows for the local shards and applies them
//! concurrently. A full batch means more rows are waiting, so the poller
//! fetches again right away instead of waiting for the next tick.

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::{ApplyOutcome, EventProcessor};
use crate::types::now_millis;

/// Poller statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStats {
    /// Batches fetched
    pub batches: u64,
    /// Rows applied
    pub applied: u64,
    /// Rows found already applied
    pub duplicates: u64,
    /// Rows left for another shard owner
    pub abandoned: u64,
    /// Rows that failed and were rescheduled
    pub failed: u64,
}

/// Background service draining the counter event queue
pub struct CounterEventPoller {
    processor: EventProcessor,
    refresh_interval: Duration,
    max_concurrency: usize,
    status: RwLock<ServiceStatus>,
    stats: RwLock<PollerStats>,
}

impl CounterEventPoller {
    /// Create a poller for `processor`
    pub fn new(processor: EventProcessor, config: &QueueConfig) -> Self {
        Self {
            processor,
            refresh_interval: Duration::from_millis(config.refresh_interval_ms.max(1)),
            max_concurrency: config.max_concurrency.max(1),
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(PollerStats::default()),
        }
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> PollerStats {
        self.stats.read().clone()
    }

    /// Fetch and apply one batch; returns true when the batch was full
    pub async fn poll_once(&self) -> Result<bool> {
        let (rows, full) = self.processor.pending(now_millis()).await?;
        if rows.is_empty() {
            return Ok(false);
        }
        let fetched = rows.len();

        let results: Vec<_> = stream::iter(rows)
            .map(|row| self.processor.process_message(row))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut stats = self.stats.write();
        stats.batches += 1;
        for result in results {
            match result {
                Ok(ApplyOutcome::Applied { .. }) => stats.applied += 1,
                Ok(ApplyOutcome::AlreadyApplied) => stats.duplicates += 1,
                Ok(ApplyOutcome::Abandoned) => stats.abandoned += 1,
                Err(_) => stats.failed += 1,
            }
        }
        tracing::debug!(fetched, full, "Counter event batch processed");
        Ok(full)
    }

    async fn drain(&self) {
        loop {
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Counter event poll failed");
                    break;
                },
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for CounterEventPoller {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(
            refresh_ms = self.refresh_interval.as_millis() as u64,
            batch_size = self.processor.batch_size(),
            max_concurrency = self.max_concurrency,
            "Counter event poller started"
        );

        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Counter event poller received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Counter event poller receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!("Counter event poller stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "counter_event_poller"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCounterCache;
    use crate::cluster::LocalCluster;
    use crate::context::{ContextDef, DimensionDef, MatchKind, ScalarKind};
    use crate::definition::{CounterDef, CounterWindow, DefinitionRegistry};
    use crate::engine::memory::InMemoryStore;
    use crate::engine::traits::Persistence;
    use crate::queue::{CounterEvent, EventKind};
    use crate::services::ServiceManager;
    use crate::types::EventId;
    use crate::window::WindowWidth;
    use std::sync::Arc;

    fn setup(batch_size: usize) -> (InMemoryStore, EventProcessor, Arc<ContextDef>) {
        let merchant = Arc::new(
            DimensionDef::builder("merchant", MatchKind::Exact(ScalarKind::Long))
                .build()
                .unwrap(),
        );
        let def = ContextDef::new("payments", vec![merchant]).unwrap();
        let mut registry = DefinitionRegistry::new();
        registry
            .register_counter(
                CounterDef::new(
                    "volume",
                    Arc::clone(&def),
                    vec!["merchant".to_string()],
                    vec![vec!["merchant".to_string()]],
                    vec![CounterWindow::new(WindowWidth::always(), 1).unwrap()],
                )
                .unwrap(),
            )
            .unwrap();

        let store = InMemoryStore::new();
        let config = QueueConfig {
            batch_size,
            ..QueueConfig::default()
        };
        let processor = EventProcessor::new(
            Arc::new(store.clone()),
            Arc::new(LocalCluster::new(4, 16)),
            Arc::new(LocalCounterCache::new(64, 60_000)),
            Arc::new(registry),
            &config,
            3,
        );
        (store, processor, def)
    }

    async fn record(store: &InMemoryStore, processor: &EventProcessor, def: &Arc<ContextDef>, merchant: i64) {
        let context = def.parse([("merchant", merchant.to_string().as_str())]).unwrap();
        let mut tx = store.begin().await.unwrap();
        processor
            .queue_event(
                tx.as_mut(),
                CounterEvent {
                    event_id: EventId::new(),
                    counter_key: "volume".to_string(),
                    context: context.persisted(),
                    delta: 1,
                    timestamp: now_millis(),
                    kind: EventKind::Increment,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_once_reports_full_batches() {
        let (store, processor, def) = setup(4);
        for merchant in 0..3 {
            record(&store, &processor, &def, merchant).await;
        }
        let poller = CounterEventPoller::new(processor, &QueueConfig {
            batch_size: 4,
            ..QueueConfig::default()
        });

        assert!(poller.poll_once().await.unwrap());
        assert!(!poller.poll_once().await.unwrap());
        assert!(!poller.poll_once().await.unwrap());

        let stats = poller.stats();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.applied, 6);
        assert!(store.queue_rows().is_empty());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_poller_runs_under_service_manager() {
        let (store, processor, def) = setup(32);
        record(&store, &processor, &def, 7).await;

        let poller = Arc::new(CounterEventPoller::new(processor, &QueueConfig {
            refresh_interval_ms: 10,
            ..QueueConfig::default()
        }));
        let manager = ServiceManager::with_defaults();
        manager.register(poller.clone()).unwrap();
        manager.start_all().await.unwrap();

        for _ in 0..100 {
            if store.queue_rows().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown().await.unwrap();

        assert!(store.queue_rows().is_empty());
        assert_eq!(poller.status(), ServiceStatus::Stopped);
        assert_eq!(poller.stats().applied, 2);
    }
}
