//! Engine builder with pluggable collaborators
//!
//! This module provides the main [`CascadeEngine`] type that ties the
//! persistence provider, cluster router, counter cache, and definition
//! registry into the public config and counter operations.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry_on_conflict;
use super::traits::{
    CacheStats, ClusterRouter, ConfigRow, CounterCache, Persistence, Transaction,
};
use crate::cache::{LocalCounterCache, TtlLruCache};
use crate::cluster::LocalCluster;
use crate::config::Config;
use crate::context::{Context, PersistedContext};
use crate::counter::{Counter, CounterKey};
use crate::definition::{ConfigDef, CounterWindow, DefinitionRegistry};
use crate::error::{Error, Result, StoreError, ValidationError};
use crate::metrics;
use crate::overrides::{self, apply_set_delta, Bounded, Override};
use crate::queue::{CounterEvent, EventProcessor};
use crate::services::CounterEventPoller;
use crate::types::{now_millis, SequenceNumber, Timestamp};
use crate::value::{PersistedValue, Value};
use crate::window::CounterValue;

/// Builder for configuring the engine with custom collaborators
pub struct CascadeEngineBuilder {
    store: Option<Arc<dyn Persistence>>,
    router: Option<Arc<dyn ClusterRouter>>,
    counter_cache: Option<Arc<dyn CounterCache>>,
    definitions: Option<Arc<DefinitionRegistry>>,
    config: Config,
}

impl CascadeEngineBuilder {
    /// Create a new engine builder
    pub fn new() -> Self {
        Self {
            store: None,
            router: None,
            counter_cache: None,
            definitions: None,
            config: Config::default(),
        }
    }

    /// Set the persistence provider
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: Persistence,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the persistence provider from an existing Arc
    pub fn with_store_arc(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cluster router; defaults to a [`LocalCluster`] built from the
    /// cluster config
    pub fn with_router_arc(mut self, router: Arc<dyn ClusterRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the counter cache; defaults to a [`LocalCounterCache`]
    pub fn with_counter_cache_arc(mut self, cache: Arc<dyn CounterCache>) -> Self {
        self.counter_cache = Some(cache);
        self
    }

    /// Set the definition registry
    pub fn with_definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = Some(Arc::new(definitions));
        self
    }

    /// Set engine configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<CascadeEngine> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| Error::Configuration("No persistence provider configured".to_string()))?;
        let definitions = self
            .definitions
            .ok_or_else(|| Error::Configuration("No definition registry configured".to_string()))?;

        let cluster = &self.config.cluster;
        let router: Arc<dyn ClusterRouter> = match self.router {
            Some(router) => router,
            None => match &cluster.owned_shards {
                Some(owned) => Arc::new(LocalCluster::with_owned_shards(
                    cluster.shards,
                    cluster.virtual_nodes,
                    owned.iter().copied(),
                )),
                None => Arc::new(LocalCluster::new(cluster.shards, cluster.virtual_nodes)),
            },
        };

        let caches = &self.config.cache;
        let counter_cache: Arc<dyn CounterCache> = match self.counter_cache {
            Some(cache) => cache,
            None => Arc::new(LocalCounterCache::new(
                caches.counter_capacity,
                caches.counter_ttl_ms,
            )),
        };
        let config_cache = Arc::new(TtlLruCache::new(caches.config_capacity, caches.config_ttl_ms));

        let processor = EventProcessor::new(
            Arc::clone(&store),
            Arc::clone(&router),
            Arc::clone(&counter_cache),
            Arc::clone(&definitions),
            &self.config.queue,
            self.config.engine.conflict_retries,
        );

        if self.config.monitoring.metrics_enabled {
            metrics::init();
        }
        info!(
            store = store.provider_id(),
            local_shards = router.local_shards().len(),
            "Cascade engine ready"
        );

        Ok(CascadeEngine {
            store,
            counter_cache,
            definitions,
            config_cache,
            processor,
            config: self.config,
        })
    }
}

impl Default for CascadeEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stored value encoding
// =============================================================================

/// Values stored as config overrides
trait StoredValue: Bounded + Clone + Send + Sync + 'static {
    fn decode(def: &ConfigDef, values: &[PersistedValue]) -> std::result::Result<Self, ValidationError>;
    fn encode(&self) -> Vec<PersistedValue>;
}

impl StoredValue for Value {
    fn decode(def: &ConfigDef, values: &[PersistedValue]) -> std::result::Result<Self, ValidationError> {
        let first = values.first().ok_or_else(|| ValidationError::InvalidFormat {
            field: def.key().to_string(),
            message: "stored override holds no value".to_string(),
        })?;
        def.kind().build_from_persisted(first)
    }

    fn encode(&self) -> Vec<PersistedValue> {
        vec![self.persisted_value()]
    }
}

impl StoredValue for BTreeSet<Value> {
    fn decode(def: &ConfigDef, values: &[PersistedValue]) -> std::result::Result<Self, ValidationError> {
        values
            .iter()
            .map(|v| def.kind().build_from_persisted(v))
            .collect()
    }

    fn encode(&self) -> Vec<PersistedValue> {
        self.iter().map(Value::persisted_value).collect()
    }
}

#[derive(Clone, Debug)]
enum CachedConfig {
    Value(Option<Value>),
    Set(BTreeSet<Value>),
}

type ConfigCacheKey = (String, PersistedContext);

// =============================================================================
// Engine
// =============================================================================

/// Config and counter store over pluggable collaborators
pub struct CascadeEngine {
    store: Arc<dyn Persistence>,
    counter_cache: Arc<dyn CounterCache>,
    definitions: Arc<DefinitionRegistry>,
    config_cache: Arc<TtlLruCache<ConfigCacheKey, CachedConfig>>,
    processor: EventProcessor,
    config: Config,
}

impl CascadeEngine {
    /// Start building an engine
    pub fn builder() -> CascadeEngineBuilder {
        CascadeEngineBuilder::new()
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registered definitions
    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    /// Event processor applying queued counter events
    pub fn processor(&self) -> &EventProcessor {
        &self.processor
    }

    /// Background poller driving the event processor
    pub fn poller(&self) -> CounterEventPoller {
        CounterEventPoller::new(self.processor.clone(), &self.config.queue)
    }

    /// Open a transaction for [`queue_event`](Self::queue_event)
    pub async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(self.store.begin().await?)
    }

    /// Counter cache statistics
    pub fn counter_cache_stats(&self) -> CacheStats {
        self.counter_cache.stats()
    }

    /// Config lookup cache statistics
    pub fn config_cache_stats(&self) -> CacheStats {
        self.config_cache.stats()
    }

    // =========================================================================
    // Scalar config values
    // =========================================================================

    /// Most specific value for `context`, falling back to the default
    ///
    /// Fails with [`Error::MissingValue`] when nothing applies and the entry
    /// is required.
    pub async fn get_config_value(&self, config_key: &str, context: &Context) -> Result<Option<Value>> {
        let def = self.config_def(config_key, false)?;
        check_query_context(def, context)?;

        let cache_key = (config_key.to_string(), context.persisted());
        let generation = self.config_cache.generation();
        if context.is_cacheable() {
            let cached = self.config_cache.get(&cache_key);
            metrics::record_config_cache(cached.is_some());
            if let Some(CachedConfig::Value(value)) = cached {
                return Ok(value);
            }
        }

        let resolved = self
            .resolve_stored::<Value>(def, context)
            .await?
            .or_else(|| def.default_value().cloned());
        if resolved.is_none() && def.is_required() {
            return Err(missing(config_key, context));
        }

        if context.is_cacheable() {
            self.config_cache
                .insert_if_unchanged(cache_key, CachedConfig::Value(resolved.clone()), generation);
        }
        Ok(resolved)
    }

    /// Store `value` at `context`
    ///
    /// Constrained entries are validated against ancestors and descendants;
    /// violating descendants are rejected or removed per the conflict policy.
    pub async fn set_config_value(&self, config_key: &str, context: &Context, value: Value) -> Result<()> {
        let def = self.config_def(config_key, false)?;
        check_context_def(def, context)?;
        if let Err(e) = def.check_kind(&value) {
            metrics::record_validation_rejection(config_key);
            return Err(e.into());
        }
        retry_on_conflict(self.config.engine.conflict_retries, || {
            self.write_override(def, context, &value)
        })
        .await
    }

    /// Remove the override at `context`; returns false when none was stored
    pub async fn remove_config_value(&self, config_key: &str, context: &Context) -> Result<bool> {
        let def = self.config_def(config_key, false)?;
        check_context_def(def, context)?;
        retry_on_conflict(self.config.engine.conflict_retries, || {
            self.delete_override(config_key, context)
        })
        .await
    }

    // =========================================================================
    // Set-valued config entries
    // =========================================================================

    /// Most specific set for `context`, falling back to the default set
    pub async fn get_config_set(&self, config_key: &str, context: &Context) -> Result<BTreeSet<Value>> {
        let def = self.config_def(config_key, true)?;
        check_query_context(def, context)?;

        let cache_key = (config_key.to_string(), context.persisted());
        let generation = self.config_cache.generation();
        if context.is_cacheable() {
            let cached = self.config_cache.get(&cache_key);
            metrics::record_config_cache(cached.is_some());
            if let Some(CachedConfig::Set(set)) = cached {
                return Ok(set);
            }
        }

        let resolved = match self.resolve_stored::<BTreeSet<Value>>(def, context).await? {
            Some(set) => set,
            None if def.is_required() && def.default_set().is_empty() => {
                return Err(missing(config_key, context));
            },
            None => def.default_set().clone(),
        };

        if context.is_cacheable() {
            self.config_cache
                .insert_if_unchanged(cache_key, CachedConfig::Set(resolved.clone()), generation);
        }
        Ok(resolved)
    }

    /// Add and remove members of the set effective at `context`, storing the
    /// result as an override at `context`
    ///
    /// Returns the stored set.
    pub async fn update_config_set(
        &self,
        config_key: &str,
        context: &Context,
        add: BTreeSet<Value>,
        remove: BTreeSet<Value>,
    ) -> Result<BTreeSet<Value>> {
        let def = self.config_def(config_key, true)?;
        check_context_def(def, context)?;
        if let Some(e) = add.iter().find_map(|v| def.check_kind(v).err()) {
            metrics::record_validation_rejection(config_key);
            return Err(e.into());
        }

        retry_on_conflict(self.config.engine.conflict_retries, || {
            self.update_set_once(def, context, &add, &remove)
        })
        .await
    }

    /// Remove the set override at `context`; returns false when none was
    /// stored
    pub async fn remove_config_set(&self, config_key: &str, context: &Context) -> Result<bool> {
        let def = self.config_def(config_key, true)?;
        check_context_def(def, context)?;
        retry_on_conflict(self.config.engine.conflict_retries, || {
            self.delete_override(config_key, context)
        })
        .await
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Current value of the counter tracked for `context` and `window`
    ///
    /// With `last_full` set, the narrow value is that of the last complete
    /// narrow window instead of the current one.
    pub async fn get_counter(
        &self,
        counter_key: &str,
        context: &Context,
        window: &CounterWindow,
        last_full: bool,
    ) -> Result<CounterValue> {
        let def = self.definitions.counter(counter_key)?;
        if context.def().name() != def.context_def().name() {
            return Err(ValidationError::ContextDefMismatch {
                expected: def.context_def().name().to_string(),
                actual: context.def().name().to_string(),
            }
            .into());
        }
        if !context.is_valid_for_query() {
            return Err(ValidationError::NotQueryable(context.to_string()).into());
        }
        let index = def.window_index(window).ok_or_else(|| ValidationError::InvalidDefinition {
            key: counter_key.to_string(),
            message: format!("window {} x{} is not tracked", window.narrow(), window.multiple()),
        })?;

        let now = now_millis();
        let key = CounterKey::new(def.key(), context, index);
        let generation = self.counter_cache.generation();
        let (mut counter, stored) = match self.counter_cache.get(&key) {
            Some(counter) => (counter, true),
            None => {
                let mut tx = self.store.begin().await?;
                let state = tx.load_counter(&key).await;
                tx.rollback().await;
                match state? {
                    Some(state) => (Counter::from_state(context.clone(), *window, state), true),
                    None => (Counter::new(context.clone(), *window, now), false),
                }
            },
        };

        let mut value = counter.value(now);
        if last_full {
            value.narrow = counter.last_full(now);
        }

        let interval = self.config.engine.query_persist_interval_ms;
        if counter.record_query(now, interval) && stored && self.persist_last_queried(&key, now).await {
            counter.mark_persisted();
        }
        // An apply committed meanwhile has already cached a newer counter
        if context.is_cacheable() && !self.counter_cache.put_if_unchanged(key, counter, generation) {
            debug!(counter = counter_key, "Counter cache written during read, skipping put");
        }
        Ok(value)
    }

    /// Record a counter event inside a caller-held transaction
    pub async fn queue_event(
        &self,
        tx: &mut dyn Transaction,
        event: CounterEvent,
    ) -> Result<Vec<SequenceNumber>> {
        self.processor.queue_event(tx, event).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn config_def(&self, config_key: &str, set_valued: bool) -> Result<&Arc<ConfigDef>> {
        let def = self.definitions.config(config_key)?;
        if def.is_set_valued() != set_valued {
            let shape = |set: bool| if set { "set" } else { "scalar" }.to_string();
            return Err(ValidationError::WrongKind {
                expected: shape(set_valued),
                actual: shape(def.is_set_valued()),
            }
            .into());
        }
        Ok(def)
    }

    async fn resolve_stored<V: StoredValue>(&self, def: &ConfigDef, context: &Context) -> Result<Option<V>> {
        let mut tx = self.store.begin().await?;
        let stored = load_overrides::<V>(tx.as_mut(), def).await;
        tx.rollback().await;
        Ok(overrides::resolve(&stored?, context).map(|o| o.value.clone()))
    }

    async fn write_override<V: StoredValue>(&self, def: &ConfigDef, context: &Context, value: &V) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let stored = load_overrides::<V>(tx.as_mut(), def).await?;
            self.stage_override(tx.as_mut(), def, &stored, context, value)
                .await
        }
        .await;
        finish(tx, result).await
    }

    async fn update_set_once(
        &self,
        def: &ConfigDef,
        context: &Context,
        add: &BTreeSet<Value>,
        remove: &BTreeSet<Value>,
    ) -> Result<BTreeSet<Value>> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let stored = load_overrides::<BTreeSet<Value>>(tx.as_mut(), def).await?;
            let current = overrides::resolve(&stored, context)
                .map(|o| o.value.clone())
                .unwrap_or_else(|| def.default_set().clone());
            let updated = apply_set_delta(&current, add, remove);
            self.stage_override(tx.as_mut(), def, &stored, context, &updated)
                .await?;
            Ok::<_, Error>(updated)
        }
        .await;
        finish(tx, result).await
    }

    /// Validate and buffer a write plus any cascaded removals
    async fn stage_override<V: StoredValue>(
        &self,
        tx: &mut dyn Transaction,
        def: &ConfigDef,
        stored: &[Override<V>],
        context: &Context,
        value: &V,
    ) -> Result<()> {
        let config_key = def.key();
        let removals = overrides::plan_write(
            config_key,
            def.constraint(),
            self.config.engine.conflict_policy,
            stored,
            context,
            value,
        )
        .map_err(|e| {
            warn!(config = config_key, context = %context, error = %e, "Config write rejected");
            metrics::record_validation_rejection(config_key);
            Error::from(e)
        })?;

        for removed in &removals {
            tx.delete_config(config_key, &removed.persisted()).await?;
        }
        tx.put_config(
            config_key,
            ConfigRow {
                context: context.persisted(),
                values: value.encode(),
            },
        )
        .await?;

        let cascaded = removals.len();
        let cache = Arc::clone(&self.config_cache);
        let key = config_key.to_string();
        tx.on_commit(Box::new(move || {
            cache.remove_where(|(k, _)| *k == key);
            if cascaded > 0 {
                metrics::record_cascaded_removals(&key, cascaded);
            }
        }));
        debug!(config = config_key, context = %context, cascaded, "Config override staged");
        Ok(())
    }

    async fn delete_override(&self, config_key: &str, context: &Context) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let deleted = match tx.delete_config(config_key, &context.persisted()).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tx.rollback().await;
                return Err(e.into());
            },
        };
        let cache = Arc::clone(&self.config_cache);
        let key = config_key.to_string();
        tx.on_commit(Box::new(move || {
            cache.remove_where(|(k, _)| *k == key);
        }));
        tx.commit().await?;
        debug!(config = config_key, context = %context, deleted, "Config override removed");
        Ok(deleted > 0)
    }

    /// Write back the last-queried timestamp; true when it was stored
    async fn persist_last_queried(&self, key: &CounterKey, now: Timestamp) -> bool {
        let result = async {
            let mut tx = self.store.begin().await?;
            match tx.load_counter(key).await? {
                Some(mut state) => {
                    state.last_queried = now;
                    tx.put_counter(key.clone(), state).await?;
                    tx.commit().await?;
                    Ok::<bool, StoreError>(true)
                },
                None => {
                    tx.rollback().await;
                    Ok(false)
                },
            }
        }
        .await;

        match result {
            Ok(stored) => stored,
            Err(StoreError::Conflict(_)) => {
                debug!(counter = %key, "Counter changed while persisting query time");
                false
            },
            Err(e) => {
                warn!(counter = %key, error = %e, "Failed to persist counter query time");
                false
            },
        }
    }
}

async fn load_overrides<V: StoredValue>(tx: &mut dyn Transaction, def: &ConfigDef) -> Result<Vec<Override<V>>> {
    let rows = tx.scan_config(def.key()).await?;
    rows.iter()
        .map(|row| {
            Ok(Override {
                context: Context::from_persisted(def.context_def(), &row.context)?,
                value: V::decode(def, &row.values)?,
            })
        })
        .collect()
}

/// Commit on success, roll back on failure
async fn finish<T>(tx: Box<dyn Transaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        },
        Err(e) => {
            tx.rollback().await;
            Err(e)
        },
    }
}

fn check_context_def(def: &ConfigDef, context: &Context) -> std::result::Result<(), ValidationError> {
    if context.def().name() != def.context_def().name() {
        return Err(ValidationError::ContextDefMismatch {
            expected: def.context_def().name().to_string(),
            actual: context.def().name().to_string(),
        });
    }
    Ok(())
}

fn check_query_context(def: &ConfigDef, context: &Context) -> std::result::Result<(), ValidationError> {
    check_context_def(def, context)?;
    if !context.is_valid_for_query() {
        return Err(ValidationError::NotQueryable(context.to_string()));
    }
    Ok(())
}

fn missing(config_key: &str, context: &Context) -> Error {
    Error::MissingValue {
        config_key: config_key.to_string(),
        context: context.to_string(),
    }
}
