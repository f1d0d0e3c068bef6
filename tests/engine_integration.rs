//! Engine Integration Tests
//!
//! Exercises the public engine surface end to end over the in-memory store:
//!
//! - Cascading bounds across a three-level context hierarchy
//! - Queue rows applied effectively once under redelivery
//! - Same-partition applies serialized under concurrent delivery
//! - Rows abandoned when their shard moves and applied after takeover
//! - Failed applies rescheduled with the configured backoff

use cascade_store::cluster::LocalCluster;
use cascade_store::config::Config;
use cascade_store::context::{ContextDef, DimensionDef, MatchKind, ScalarKind};
use cascade_store::engine::memory::InMemoryStore;
use cascade_store::engine::traits::ClusterRouter;
use cascade_store::error::StoreError;
use cascade_store::overrides::Constraint;
use cascade_store::queue::{ApplyOutcome, CounterEvent, EventKind, QueuedCounterEvent};
use cascade_store::types::{now_millis, EventId};
use cascade_store::value::ValueKind;
use cascade_store::{
    CascadeEngine, ConfigDef, Context, CounterDef, CounterWindow, DefinitionRegistry, Error,
    Value, WindowTimeUnit, WindowWidth,
};
use std::sync::Arc;

// =============================================================================
// Test Helpers
// =============================================================================

fn context_def() -> Arc<ContextDef> {
    let tenant = Arc::new(
        DimensionDef::builder("tenant", MatchKind::Exact(ScalarKind::Text))
            .build()
            .unwrap(),
    );
    let region = Arc::new(
        DimensionDef::builder("region", MatchKind::Hierarchy { max_depth: 3 })
            .build()
            .unwrap(),
    );
    let amount = Arc::new(
        DimensionDef::builder(
            "amount",
            MatchKind::Range {
                boundaries: vec![0, 100, 1_000],
            },
        )
        .build()
        .unwrap(),
    );
    ContextDef::new("orders", vec![tenant, region, amount]).unwrap()
}

fn window() -> CounterWindow {
    CounterWindow::new(WindowWidth::new(1, WindowTimeUnit::Day).unwrap(), 7).unwrap()
}

fn registry(def: &Arc<ContextDef>) -> DefinitionRegistry {
    let mut registry = DefinitionRegistry::new();
    registry
        .register_config(
            ConfigDef::builder("max_order", ValueKind::Long, Arc::clone(def))
                .constraint(Constraint::Max)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_config(
            ConfigDef::builder("settle_delay", ValueKind::Duration, Arc::clone(def))
                .default_value(Value::Duration(60_000))
                .constraint(Constraint::Min)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_counter(
            CounterDef::new(
                "orders",
                Arc::clone(def),
                vec!["tenant".to_string()],
                vec![vec!["tenant".to_string()], vec![]],
                vec![window()],
            )
            .unwrap(),
        )
        .unwrap();
    registry
}

struct Harness {
    engine: CascadeEngine,
    store: InMemoryStore,
    router: Arc<LocalCluster>,
    def: Arc<ContextDef>,
}

fn harness(config: Config) -> Harness {
    let def = context_def();
    let store = InMemoryStore::new();
    let router = Arc::new(LocalCluster::new(8, 32));
    let engine = CascadeEngine::builder()
        .with_store(store.clone())
        .with_router_arc(router.clone())
        .with_definitions(registry(&def))
        .with_config(config)
        .build()
        .unwrap();
    Harness {
        engine,
        store,
        router,
        def,
    }
}

fn ctx(def: &Arc<ContextDef>, pairs: &[(&str, &str)]) -> Context {
    def.parse(pairs.iter().copied()).unwrap()
}

async fn record(h: &Harness, tenant: &str, delta: i64) -> EventId {
    let context = ctx(&h.def, &[("tenant", tenant), ("region", "eu/de"), ("amount", "250")]);
    let event_id = EventId::new();
    let mut tx = h.engine.begin().await.unwrap();
    h.engine
        .queue_event(
            tx.as_mut(),
            CounterEvent {
                event_id,
                counter_key: "orders".to_string(),
                context: context.persisted(),
                delta,
                timestamp: now_millis(),
                kind: EventKind::Increment,
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    event_id
}

fn rows_for(h: &Harness, event_id: EventId) -> Vec<QueuedCounterEvent> {
    h.store
        .queue_rows()
        .into_iter()
        .filter(|r| r.event_id == event_id)
        .collect()
}

// =============================================================================
// Config Cascade
// =============================================================================

#[tokio::test]
async fn test_max_bound_cascades_through_hierarchy() {
    let h = harness(Config::default());
    let tenant = ctx(&h.def, &[("tenant", "acme")]);
    let region = ctx(&h.def, &[("tenant", "acme"), ("region", "eu")]);
    let city = ctx(&h.def, &[("tenant", "acme"), ("region", "eu/de/berlin")]);

    h.engine.set_config_value("max_order", &tenant, Value::Long(10)).await.unwrap();
    h.engine.set_config_value("max_order", &region, Value::Long(9)).await.unwrap();
    assert!(h
        .engine
        .set_config_value("max_order", &city, Value::Long(11))
        .await
        .is_err());
    h.engine.set_config_value("max_order", &city, Value::Long(8)).await.unwrap();

    // A looser value never shadows an ancestor bound
    h.engine.set_config_value("max_order", &tenant, Value::Long(7)).await.unwrap();
    for context in [&tenant, &region, &city] {
        assert_eq!(
            h.engine.get_config_value("max_order", context).await.unwrap(),
            Some(Value::Long(7))
        );
    }

    let other = ctx(&h.def, &[("tenant", "globex"), ("region", "eu")]);
    assert_eq!(h.engine.get_config_value("max_order", &other).await.unwrap(), None);
}

#[tokio::test]
async fn test_min_bound_and_range_specificity() {
    let h = harness(Config::default());
    let small = ctx(&h.def, &[("tenant", "acme"), ("amount", "0")]);
    let large = ctx(&h.def, &[("tenant", "acme"), ("amount", "1000")]);
    let query = ctx(&h.def, &[("tenant", "acme"), ("amount", "5000")]);

    assert_eq!(
        h.engine.get_config_value("settle_delay", &query).await.unwrap(),
        Some(Value::Duration(60_000))
    );

    h.engine
        .set_config_value("settle_delay", &small, Value::Duration(120_000))
        .await
        .unwrap();
    h.engine
        .set_config_value("settle_delay", &large, Value::Duration(600_000))
        .await
        .unwrap();
    assert_eq!(
        h.engine.get_config_value("settle_delay", &query).await.unwrap(),
        Some(Value::Duration(600_000))
    );

    let err = h
        .engine
        .set_config_value("settle_delay", &large, Value::Duration(30_000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// =============================================================================
// Queue Processing
// =============================================================================

#[tokio::test]
async fn test_redelivered_row_applies_once() {
    let h = harness(Config::default());
    let event_id = record(&h, "acme", 40).await;
    let rows = rows_for(&h, event_id);
    assert_eq!(rows.len(), 2);

    let processor = h.engine.processor();
    for row in &rows {
        let first = processor.process_message(row.clone()).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { counters: 1 }));
        let again = processor.process_message(row.clone()).await.unwrap();
        assert_eq!(again, ApplyOutcome::AlreadyApplied);
    }
    assert_eq!(h.store.event_count(), 0);

    let tenant = ctx(&h.def, &[("tenant", "acme")]);
    let value = h.engine.get_counter("orders", &tenant, &window(), false).await.unwrap();
    assert_eq!(value.narrow.count, 1);
    assert_eq!(value.narrow.sum, 40);

    let total = h
        .engine
        .get_counter("orders", &h.def.root(), &window(), false)
        .await
        .unwrap();
    assert_eq!(total.wide.count, 1);
}

#[tokio::test]
async fn test_concurrent_rows_serialized_per_partition() {
    let h = harness(Config::default());
    for _ in 0..25 {
        record(&h, "acme", 2).await;
    }
    record(&h, "globex", 5).await;

    let rows = h.store.queue_rows();
    assert_eq!(rows.len(), 52);
    let processor = h.engine.processor().clone();
    let outcomes = futures::future::join_all(
        rows.into_iter().map(|row| {
            let processor = processor.clone();
            async move { processor.process_message(row).await }
        }),
    )
    .await;
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Ok(ApplyOutcome::Applied { .. }))));
    assert!(h.store.queue_rows().is_empty());

    let acme = ctx(&h.def, &[("tenant", "acme")]);
    let value = h.engine.get_counter("orders", &acme, &window(), false).await.unwrap();
    assert_eq!(value.narrow.count, 25);
    assert_eq!(value.narrow.sum, 50);

    let total = h
        .engine
        .get_counter("orders", &h.def.root(), &window(), false)
        .await
        .unwrap();
    assert_eq!(total.wide.count, 26);
    assert_eq!(total.wide.sum, 55);
}

#[tokio::test]
async fn test_row_abandoned_until_shard_acquired() {
    let h = harness(Config::default());
    let event_id = record(&h, "acme", 9).await;
    let row = rows_for(&h, event_id)
        .into_iter()
        .find(|r| r.partition.is_some())
        .unwrap();

    assert!(h.router.release_shard(row.shard));
    assert!(!h.router.local_shards().contains(&row.shard));
    let outcome = h.engine.processor().process_message(row.clone()).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Abandoned);
    assert_eq!(rows_for(&h, event_id).len(), 2);

    // Pending never hands out rows of a shard owned elsewhere
    let (pending, _) = h.engine.processor().pending(now_millis()).await.unwrap();
    assert!(pending.iter().all(|r| r.shard != row.shard));

    assert!(h.router.acquire_shard(row.shard));
    let outcome = h.engine.processor().process_message(row).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
    assert_eq!(rows_for(&h, event_id).len(), 1);
}

#[tokio::test]
async fn test_failed_apply_rescheduled_with_backoff() {
    let config = Config::from_toml(
        r#"
        [queue.backoff]
        strategy = "fixed"
        delay_ms = 60000
        "#,
    )
    .unwrap();
    let h = harness(config);
    let event_id = record(&h, "acme", 3).await;
    let row = rows_for(&h, event_id)
        .into_iter()
        .find(|r| r.partition.is_none())
        .unwrap();

    h.store
        .fail_next_commits(vec![StoreError::Backend("disk full".to_string())]);
    let err = h
        .engine
        .processor()
        .process_message(row.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Backend(_))));

    let now = now_millis();
    let rescheduled = rows_for(&h, event_id)
        .into_iter()
        .find(|r| r.seq == row.seq)
        .unwrap();
    assert_eq!(rescheduled.failure_count, 1);
    assert!(rescheduled.next_retry_at >= now + 50_000);

    let (due, _) = h.engine.processor().pending(now).await.unwrap();
    assert!(due.iter().all(|r| r.seq != row.seq));
    let (due, _) = h
        .engine
        .processor()
        .pending(rescheduled.next_retry_at)
        .await
        .unwrap();
    let retried = due.into_iter().find(|r| r.seq == row.seq).unwrap();

    let outcome = h.engine.processor().process_message(retried).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
}

#[tokio::test]
async fn test_poller_drains_queue() {
    let h = harness(Config::default());
    for tenant in ["acme", "globex", "initech"] {
        record(&h, tenant, 1).await;
    }

    let poller = h.engine.poller();
    while poller.poll_once().await.unwrap() {}
    assert!(h.store.queue_rows().is_empty());
    assert_eq!(poller.stats().applied, 6);

    let total = h
        .engine
        .get_counter("orders", &h.def.root(), &window(), false)
        .await
        .unwrap();
    assert_eq!(total.narrow.count, 3);
}
