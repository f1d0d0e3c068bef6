//! Prometheus metrics for the event pipeline, config writes, and caches

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Event Pipeline ===

    /// Counter events recorded
    pub static ref EVENTS_QUEUED_TOTAL: CounterVec = register_counter_vec!(
        "cascade_events_queued_total",
        "Total counter events recorded",
        &["counter"]
    ).expect("events_queued metric registers once");

    /// Queue rows by final outcome of an apply attempt
    pub static ref EVENTS_PROCESSED_TOTAL: CounterVec = register_counter_vec!(
        "cascade_events_processed_total",
        "Total queue rows processed by outcome",
        &["counter", "outcome"]
    ).expect("events_processed metric registers once");

    /// Apply latency
    pub static ref APPLY_DURATION: HistogramVec = register_histogram_vec!(
        "cascade_apply_duration_seconds",
        "Queued event apply latency in seconds",
        &["counter"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).expect("apply_duration metric registers once");

    /// Rows fetched by the most recent poll
    pub static ref PENDING_BATCH_SIZE: Gauge = register_gauge!(
        "cascade_pending_batch_size",
        "Number of queue rows fetched by the last poll"
    ).expect("pending_batch_size metric registers once");

    // === Config Writes ===

    /// Writes rejected by validation
    pub static ref VALIDATION_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "cascade_validation_rejections_total",
        "Total config writes rejected by validation",
        &["config"]
    ).expect("validation_rejections metric registers once");

    /// Descendant overrides removed by a tightened bound
    pub static ref CASCADED_REMOVALS_TOTAL: CounterVec = register_counter_vec!(
        "cascade_cascaded_removals_total",
        "Total descendant overrides removed by cascading bounds",
        &["config"]
    ).expect("cascaded_removals metric registers once");

    // === Caches ===

    /// Cache lookups by cache and result
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = register_counter_vec!(
        "cascade_cache_lookups_total",
        "Total cache lookups by cache and result",
        &["cache", "result"]
    ).expect("cache_lookups metric registers once");
}

/// Apply outcome label values
pub mod outcome {
    /// Row applied and deleted
    pub const APPLIED: &str = "applied";
    /// Row already deleted by an earlier attempt
    pub const DUPLICATE: &str = "duplicate";
    /// Shard owned elsewhere
    pub const ABANDONED: &str = "abandoned";
    /// Apply failed and the row was rescheduled
    pub const RETRIED: &str = "retried";
}

/// Touch every metric so it shows up before first use
pub fn init() {
    PENDING_BATCH_SIZE.set(0.0);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a recorded event
#[inline]
pub fn record_queued(counter: &str) {
    EVENTS_QUEUED_TOTAL.with_label_values(&[counter]).inc();
}

/// Record the outcome of processing one queue row
#[inline]
pub fn record_processed(counter: &str, outcome: &str) {
    EVENTS_PROCESSED_TOTAL
        .with_label_values(&[counter, outcome])
        .inc();
}

/// Record apply latency
#[inline]
pub fn record_apply_duration(counter: &str, duration_secs: f64) {
    APPLY_DURATION
        .with_label_values(&[counter])
        .observe(duration_secs);
}

/// Record the size of a fetched batch
#[inline]
pub fn record_batch(size: usize) {
    PENDING_BATCH_SIZE.set(size as f64);
}

/// Record a rejected config write
#[inline]
pub fn record_validation_rejection(config: &str) {
    VALIDATION_REJECTIONS_TOTAL
        .with_label_values(&[config])
        .inc();
}

/// Record descendant overrides removed by a cascading write
#[inline]
pub fn record_cascaded_removals(config: &str, count: usize) {
    CASCADED_REMOVALS_TOTAL
        .with_label_values(&[config])
        .inc_by(count as f64);
}

/// Record a counter cache lookup
#[inline]
pub fn record_counter_cache(hit: bool) {
    record_cache_lookup("counter", hit);
}

/// Record a config cache lookup
#[inline]
pub fn record_config_cache(hit: bool) {
    record_cache_lookup("config", hit);
}

fn record_cache_lookup(cache: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL
        .with_label_values(&[cache, result])
        .inc();
}
